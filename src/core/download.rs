use crate::core::config::{SourceConfig, VERSION};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Release {
    #[serde(rename = "tag_name")]
    pub tag: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub url: String,
}

impl Release {
    /// Assets whose name ends in `.<extension>`, in publication order.
    pub fn assets_with_extension<'a>(
        &'a self,
        extension: &'a str,
    ) -> impl Iterator<Item = &'a ReleaseAsset> + 'a {
        self.assets.iter().filter(move |asset| {
            Path::new(&asset.name)
                .extension()
                .map_or(false, |ext| ext == extension)
        })
    }
}

/// The most recently created release.
pub fn latest_release(releases: &[Release]) -> Option<&Release> {
    releases.iter().max_by_key(|release| release.created_at)
}

/// Fetches files into the cache. Callers check for an existing file first.
#[cfg_attr(test, mockall::automock)]
pub trait DownloadService: Send + Sync {
    fn download(&self, url: &str, dest: &Path) -> Result<PathBuf>;

    /// One split archive of the given app version.
    fn download_named_asset(&self, version: &str, split: &str, dest: &Path) -> Result<PathBuf>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ReleaseService: Send + Sync {
    fn list_releases(&self, project: &str) -> Result<Vec<Release>>;
}

fn client() -> Result<Client> {
    Ok(Client::builder()
        .user_agent(format!("splitpatch/{VERSION}"))
        // Large archives over slow links; a stalled transfer blocks the run instead.
        .timeout(None::<Duration>)
        .build()?)
}

pub struct HttpDownloader {
    client: Client,
    archive_url: String,
}

impl HttpDownloader {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        Ok(Self {
            client: client()?,
            archive_url: source.archive_url.clone(),
        })
    }

    fn archive_url(&self, version: &str, split: &str) -> String {
        self.archive_url
            .replace("{version}", version)
            .replace("{split}", split)
    }
}

impl DownloadService for HttpDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        tracing::info!("downloading {url}");
        let mut response = self
            .client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("While requesting `{url}`"))?;

        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut file = NamedTempFile::new_in(dir)?;

        let total_size = response.content_length().unwrap_or(0);
        let mut downloaded = 0u64;
        let mut buffer = [0u8; 8192];
        let mut last_percent = 0;
        loop {
            let n = response
                .read(&mut buffer)
                .with_context(|| format!("While reading `{url}`"))?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])?;
            downloaded += n as u64;
            if total_size > 0 {
                let percent = (downloaded * 100 / total_size).min(100);
                if percent != last_percent {
                    let downloaded_mb = downloaded as f64 / 1024.0 / 1024.0;
                    let total_mb = total_size as f64 / 1024.0 / 1024.0;
                    tracing::debug!(
                        "{}: {percent}% ({downloaded_mb:.2} MB / {total_mb:.2} MB)",
                        dest.display()
                    );
                    last_percent = percent;
                }
            }
        }
        file.as_file().sync_all()?;
        file.persist(dest)
            .with_context(|| format!("While moving download to `{}`", dest.display()))?;
        Ok(dest.to_path_buf())
    }

    fn download_named_asset(&self, version: &str, split: &str, dest: &Path) -> Result<PathBuf> {
        let url = self.archive_url(version, split);
        self.download(&url, dest)
    }
}

pub struct GithubReleases {
    client: Client,
    api: String,
}

impl GithubReleases {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        Ok(Self {
            client: client()?,
            api: source.github_api.trim_end_matches('/').to_string(),
        })
    }
}

impl ReleaseService for GithubReleases {
    fn list_releases(&self, project: &str) -> Result<Vec<Release>> {
        let url = format!("{}/repos/{project}/releases", self.api);
        let body = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text())
            .with_context(|| format!("While listing releases of `{project}`"))?;
        parse_releases(&body)
    }
}

pub fn parse_releases(body: &str) -> Result<Vec<Release>> {
    serde_json::from_str(body).context("While parsing release metadata")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASES: &str = r#"[
        {
            "tag_name": "v0.2.0",
            "created_at": "2024-03-01T10:00:00Z",
            "assets": [
                {"name": "hermes-release-v0.2.0.aar", "browser_download_url": "https://dl.invalid/a.aar"},
                {"name": "notes.txt", "browser_download_url": "https://dl.invalid/notes.txt"},
                {"name": "hermes-cppruntime-release-v0.2.0.aar", "browser_download_url": "https://dl.invalid/b.aar"}
            ]
        },
        {
            "tag_name": "v0.3.0",
            "created_at": "2024-05-20T08:30:00Z",
            "assets": []
        },
        {
            "tag_name": "v0.1.0",
            "created_at": "2023-12-24T00:00:00Z"
        }
    ]"#;

    #[test]
    fn picks_latest_by_creation_time() {
        let releases = parse_releases(RELEASES).unwrap();
        assert_eq!(releases.len(), 3);
        assert!(releases[2].assets.is_empty());
        assert_eq!(latest_release(&releases).unwrap().tag, "v0.3.0");
        assert_eq!(latest_release(&[]), None);
    }

    #[test]
    fn filters_assets_by_extension() {
        let releases = parse_releases(RELEASES).unwrap();
        let names: Vec<_> = releases[0]
            .assets_with_extension("aar")
            .map(|asset| asset.name.as_str())
            .collect();
        assert_eq!(
            names,
            ["hermes-release-v0.2.0.aar", "hermes-cppruntime-release-v0.2.0.aar"]
        );
        assert_eq!(releases[0].assets_with_extension("dex").count(), 0);
    }

    #[test]
    fn substitutes_archive_url() {
        let downloader = HttpDownloader::new(&SourceConfig {
            archive_url: "https://mirror.invalid/{version}/{split}.apk".into(),
            ..SourceConfig::default()
        })
        .unwrap();
        assert_eq!(
            downloader.archive_url("1.2.3", "config.arm64_v8a"),
            "https://mirror.invalid/1.2.3/config.arm64_v8a.apk"
        );
    }

    #[test]
    fn rejects_malformed_metadata() {
        assert!(parse_releases(r#"[{"tag_name": "v1"}]"#).is_err());
        assert!(parse_releases("not json").is_err());
    }
}
