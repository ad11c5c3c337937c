//! Replaces native libraries in the ABI split with builds shipped inside `.aar` bundles.

use crate::core::archive::{ArchiveReader, ArchiveSession, ZipFileOptions, PAGE_ALIGNMENT};
use crate::core::error::{ArchiveResultExt, PatchError, Result};
use crate::core::utils::Target;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Bundle file name prefix to the shared object it carries.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BinaryNameMap(BTreeMap<String, String>);

impl BinaryNameMap {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    /// The binary for `file_name`, chosen by the longest matching prefix so that
    /// `hermes-cppruntime-release` wins over `hermes-` for the same file.
    pub fn resolve(&self, file_name: &str) -> Option<&str> {
        self.0
            .iter()
            .filter(|(prefix, _)| file_name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, binary)| binary.as_str())
    }
}

impl From<&BTreeMap<String, String>> for BinaryNameMap {
    fn from(map: &BTreeMap<String, String>) -> Self {
        Self(map.clone())
    }
}

pub fn embedded_path(arch: Target, binary: &str) -> String {
    format!("jni/{}/{binary}", arch.as_str())
}

pub fn installed_path(arch: Target, binary: &str) -> String {
    format!("lib/{}/{binary}", arch.as_str())
}

/// Copies the binary embedded in each bundle over the same-named library in `target`,
/// page aligned and uncompressed so it can be mapped in place. Returns the replaced entries.
pub fn swap_libraries(
    bundles: &[PathBuf],
    target: &mut ArchiveSession,
    arch: Target,
    names: &BinaryNameMap,
) -> Result<Vec<String>> {
    let mut replaced = Vec::with_capacity(bundles.len());
    for bundle in bundles {
        let file_name = bundle
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let binary = names
            .resolve(file_name)
            .ok_or_else(|| PatchError::UnmappableLibrary(file_name.to_string()))?;
        let contents = read_embedded(bundle, &embedded_path(arch, binary))?;
        let dest = installed_path(arch, binary);
        target.delete_entry(&dest, true);
        target.write_entry(&dest, contents, ZipFileOptions::Aligned(PAGE_ALIGNMENT));
        tracing::info!("{dest} replaced from {}", bundle.display());
        replaced.push(dest);
    }
    Ok(replaced)
}

fn read_embedded(bundle: &Path, path: &str) -> Result<Vec<u8>> {
    let mut reader = ArchiveReader::open(bundle).in_archive(bundle)?;
    reader
        .read_entry(path)
        .in_archive(bundle)?
        .ok_or_else(|| PatchError::MissingEmbeddedBinary {
            bundle: bundle.to_path_buf(),
            path: path.to_string(),
        })
}
