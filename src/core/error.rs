use std::path::PathBuf;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every way a patch run can halt. Steps return these unchanged to the orchestrator,
/// which never tries to recover from any of them.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Failed to download `{name}`")]
    DownloadFailure {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("`{}` has no entry `{entry}`", archive.display())]
    MissingArchiveEntry { archive: PathBuf, entry: String },

    #[error("Malformed binary manifest: {0}")]
    MalformedManifest(String),

    #[error("No library mapping matches `{0}`")]
    UnmappableLibrary(String),

    #[error("`{}` has no embedded binary `{path}`", bundle.display())]
    MissingEmbeddedBinary { bundle: PathBuf, path: String },

    #[error("Failed to sign `{}`", path.display())]
    SigningFailure {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Installer rejected the archives")]
    InstallRejected(#[source] BoxError),

    #[error("`{name}` is not a usable image")]
    InvalidAsset {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("Archive operation failed on `{}`", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PatchError {
    pub fn archive(path: impl Into<PathBuf>, source: anyhow::Error) -> Self {
        Self::Archive {
            path: path.into(),
            source: source.into(),
        }
    }

    /// The error followed by its whole `source()` chain, one cause per line.
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

pub type Result<T, E = PatchError> = std::result::Result<T, E>;

/// Attaches the archive path to a low-level editor failure.
pub trait ArchiveResultExt<T> {
    fn in_archive(self, path: &std::path::Path) -> Result<T>;
}

impl<T> ArchiveResultExt<T> for anyhow::Result<T> {
    fn in_archive(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|err| PatchError::archive(path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_lists_every_cause() {
        let inner = anyhow::anyhow!("connection reset").context("GET https://example.invalid");
        let err = PatchError::DownloadFailure {
            name: "base-1.apk".into(),
            source: inner.into(),
        };
        let trace = err.trace();
        assert!(trace.starts_with("Failed to download `base-1.apk`"));
        assert!(trace.contains("caused by: GET https://example.invalid"));
        assert!(trace.contains("caused by: connection reset"));
    }
}
