use crate::core::utils::Target;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const CONFIG_FILE_NAME: &str = "splitpatch.toml";

/// Where the config file lives when `--config` is not given.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("splitpatch")
        .join(CONFIG_FILE_NAME)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PatchConfig {
    /// Every group carries `#[serde(default)]`: a broken or missing group must fall back
    /// to its defaults without taking the valid groups down with it.
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub source: SourceConfig,
    /// Bundle file name prefix → shared object it carries.
    #[serde(default = "default_libraries")]
    pub libraries: BTreeMap<String, String>,
    #[serde(default)]
    pub icons: IconConfig,
    #[serde(default)]
    pub paths: PathConfig,
    #[serde(default)]
    pub signing: SigningConfig,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            target: TargetConfig::default(),
            source: SourceConfig::default(),
            libraries: default_libraries(),
            icons: IconConfig::default(),
            paths: PathConfig::default(),
            signing: SigningConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_package_name")]
    pub package_name: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub debuggable: bool,
    #[serde(default)]
    pub replace_icons: bool,
}

fn default_package_name() -> String {
    "app.splitpatch.client".to_string()
}

fn default_app_name() -> String {
    "SplitPatch".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            package_name: default_package_name(),
            app_name: default_app_name(),
            debuggable: false,
            replace_icons: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TargetConfig {
    #[serde(default = "default_arch")]
    pub arch: Target,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_density")]
    pub density: String,
}

fn default_arch() -> Target {
    Target::host().unwrap_or_default()
}

fn default_locale() -> String {
    "en".to_string()
}

fn default_density() -> String {
    "xxhdpi".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            arch: default_arch(),
            locale: default_locale(),
            density: default_density(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SourceConfig {
    /// Download URL of one split; `{version}` and `{split}` are substituted.
    #[serde(default = "default_archive_url")]
    pub archive_url: String,
    #[serde(default = "default_github_api")]
    pub github_api: String,
    /// `owner/repo` publishing the runtime `.aar` bundles.
    #[serde(default = "default_runtime_project")]
    pub runtime_project: String,
    /// `owner/repo` publishing the injected `.dex`.
    #[serde(default = "default_injector_project")]
    pub injector_project: String,
}

fn default_archive_url() -> String {
    "https://splitpatch.invalid/download/{version}/{split}.apk".to_string()
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_runtime_project() -> String {
    "splitpatch/hermes".to_string()
}

fn default_injector_project() -> String {
    "splitpatch/injector".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            archive_url: default_archive_url(),
            github_api: default_github_api(),
            runtime_project: default_runtime_project(),
            injector_project: default_injector_project(),
        }
    }
}

fn default_libraries() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "hermes-cppruntime-release".to_string(),
            "libc++_shared.so".to_string(),
        ),
        ("hermes-release".to_string(), "libhermes.so".to_string()),
    ])
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IconConfig {
    /// Directory holding `<name>.png` replacement assets.
    #[serde(default = "default_icon_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_icon_names")]
    pub names: Vec<String>,
}

fn default_icon_dir() -> PathBuf {
    PathBuf::from("icons")
}

fn default_icon_names() -> Vec<String> {
    ["ic_launcher", "ic_launcher_round", "ic_launcher_foreground"]
        .map(String::from)
        .to_vec()
}

impl Default for IconConfig {
    fn default() -> Self {
        Self {
            dir: default_icon_dir(),
            names: default_icon_names(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PathConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("splitpatch")
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct SigningConfig {
    /// PEM file with a certificate and a PKCS#8 private key. The bundled debug key
    /// signs when unset.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// Reads the config at `path`. A missing file gives the defaults; a malformed one is
/// reported and also gives the defaults so the user can fix it and try again.
pub fn parse_config(path: &Path) -> PatchConfig {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::debug!("no config at {} ({err}), using defaults", path.display());
            return PatchConfig::default();
        }
    };
    match toml::from_str::<PatchConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("ignoring malformed config {}: {err}", path.display());
            PatchConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn with_config_file(content: &str, f: impl Fn(&Path)) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, content).unwrap();
        f(&path)
    }

    #[test]
    fn should_read_every_group() {
        with_config_file(
            r#"
                [app]
                package_name = "com.mod.app"
                app_name = "Modded"
                debuggable = true
                replace_icons = true

                [target]
                arch = "x86_64"
                locale = "de"
                density = "hdpi"

                [source]
                archive_url = "https://mirror.invalid/{version}/{split}.apk"

                [libraries]
                "libfoo-release" = "libfoo.so"

                [paths]
                cache_dir = "/tmp/splitpatch-cache"

                [signing]
                key = "/etc/splitpatch/release.pem"
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(config.app.package_name, "com.mod.app");
                assert!(config.app.debuggable);
                assert!(config.app.replace_icons);
                assert_eq!(config.target.arch, Target::X86_64);
                assert_eq!(config.target.locale, "de");
                assert_eq!(
                    config.source.archive_url,
                    "https://mirror.invalid/{version}/{split}.apk"
                );
                assert_eq!(config.source.github_api, "https://api.github.com");
                assert_eq!(config.libraries.len(), 1);
                assert_eq!(config.libraries["libfoo-release"], "libfoo.so");
                assert_eq!(config.paths.cache_dir, PathBuf::from("/tmp/splitpatch-cache"));
                assert_eq!(
                    config.signing.key,
                    Some(PathBuf::from("/etc/splitpatch/release.pem"))
                );
            },
        );
    }

    #[test]
    fn should_default_missing_groups() {
        with_config_file(
            r#"
                [app]
                app_name = "Modded"
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(config.app.app_name, "Modded");
                assert_eq!(config.app.package_name, default_package_name());
                assert_eq!(config.target.density, "xxhdpi");
                assert_eq!(config.libraries, default_libraries());
                assert_eq!(config.signing.key, None);
            },
        );
    }

    #[test]
    fn should_fall_back_on_malformed_or_missing_file() {
        with_config_file("[app\npackage_name = ", |path| {
            let config = parse_config(path);
            assert_eq!(config.app.package_name, default_package_name());
        });
        let dir = tempdir().unwrap();
        let config = parse_config(&dir.path().join("missing.toml"));
        assert_eq!(config.app.app_name, default_app_name());
    }
}
