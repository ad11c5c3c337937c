use crate::core::config::PatchConfig;
use crate::core::utils::Target;
use std::path::{Path, PathBuf};

pub const PATCHED_DIR: &str = "patched";

/// Which build of the app a run patches.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetVariant {
    pub version: String,
    pub arch: Target,
}

/// The four archives installed together. Their manifests must agree on the package.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveSet<T> {
    pub base: T,
    pub libs: T,
    pub locale: T,
    pub resources: T,
}

impl<T> ArchiveSet<T> {
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> ArchiveSet<U> {
        ArchiveSet {
            base: f(&self.base),
            libs: f(&self.libs),
            locale: f(&self.locale),
            resources: f(&self.resources),
        }
    }

    /// Base first, then the splits.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        [&self.base, &self.libs, &self.locale, &self.resources].into_iter()
    }

    pub fn splits(&self) -> impl Iterator<Item = &T> {
        [&self.libs, &self.locale, &self.resources].into_iter()
    }
}

impl<T: Clone> ArchiveSet<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

/// Paths and identifiers of one run, all derived from the config and variant.
#[derive(Clone, Debug)]
pub struct RunEnv {
    variant: TargetVariant,
    cache_dir: PathBuf,
    locale: String,
    density: String,
}

impl RunEnv {
    pub fn new(config: &PatchConfig, variant: TargetVariant) -> Self {
        Self {
            variant,
            cache_dir: config.paths.cache_dir.clone(),
            locale: config.target.locale.clone(),
            density: config.target.density.clone(),
        }
    }

    pub fn version(&self) -> &str {
        &self.variant.version
    }

    pub fn arch(&self) -> Target {
        self.variant.arch
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn patched_dir(&self) -> PathBuf {
        self.cache_dir.join(PATCHED_DIR)
    }

    pub fn split_ids(&self) -> ArchiveSet<String> {
        ArchiveSet {
            base: "base".to_string(),
            libs: format!("config.{}", self.arch().split_suffix()),
            locale: format!("config.{}", self.locale),
            resources: format!("config.{}", self.density),
        }
    }

    fn archive_names(&self) -> ArchiveSet<String> {
        self.split_ids()
            .map(|id| format!("{id}-{}.apk", self.version()))
    }

    /// Downloaded archives as fetched, never modified.
    pub fn cached_archives(&self) -> ArchiveSet<PathBuf> {
        self.archive_names().map(|name| self.cache_dir.join(name))
    }

    /// Working copies that get patched, signed and installed.
    pub fn patched_archives(&self) -> ArchiveSet<PathBuf> {
        let dir = self.patched_dir();
        self.archive_names().map(|name| dir.join(name))
    }

    /// `hermes-release.aar` of release `v1` caches as `hermes-release-v1.aar`.
    pub fn runtime_bundle_path(&self, asset_name: &str, tag: &str) -> PathBuf {
        let stem = asset_name.strip_suffix(".aar").unwrap_or(asset_name);
        self.cache_dir.join(format!("{stem}-{tag}.aar"))
    }

    pub fn injector_path(&self, tag: &str) -> PathBuf {
        self.cache_dir.join(format!("classes-{tag}.dex"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> RunEnv {
        let mut config = PatchConfig::default();
        config.paths.cache_dir = PathBuf::from("/cache");
        config.target.locale = "de".into();
        RunEnv::new(
            &config,
            TargetVariant {
                version: "1.4.0".into(),
                arch: Target::Arm64V8a,
            },
        )
    }

    #[test]
    fn deterministic_cache_names() {
        let env = env();
        let cached = env.cached_archives();
        assert_eq!(cached.base, Path::new("/cache/base-1.4.0.apk"));
        assert_eq!(cached.libs, Path::new("/cache/config.arm64_v8a-1.4.0.apk"));
        assert_eq!(cached.locale, Path::new("/cache/config.de-1.4.0.apk"));
        assert_eq!(cached.resources, Path::new("/cache/config.xxhdpi-1.4.0.apk"));
        assert_eq!(
            env.patched_archives().base,
            Path::new("/cache/patched/base-1.4.0.apk")
        );
        assert_eq!(
            env.runtime_bundle_path("hermes-release.aar", "v2"),
            Path::new("/cache/hermes-release-v2.aar")
        );
        assert_eq!(env.injector_path("v3"), Path::new("/cache/classes-v3.dex"));
    }

    #[test]
    fn base_comes_first() {
        let ids = env().split_ids();
        assert_eq!(ids.iter().next().map(String::as_str), Some("base"));
        assert_eq!(ids.splits().count(), 3);
        assert_eq!(ids.to_vec().len(), 4);
    }
}
