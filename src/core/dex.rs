//! Puts an injected bytecode file in front of the app's own classes.
//!
//! The runtime loads `classes.dex` first and then `classes2.dex`, `classes3.dex`, ...
//! in order, so the primary slot is handed to the payload and the original primary
//! moves to the first free numbered slot.

use crate::core::archive::{ArchiveSession, ZipFileOptions};
use crate::core::error::{ArchiveResultExt, PatchError, Result};

pub const PRIMARY_DEX: &str = "classes.dex";

/// Whether `name` is a root level `classes.dex` or `classes<N>.dex` entry.
pub fn is_dex_entry(name: &str) -> bool {
    name.strip_prefix("classes")
        .and_then(|rest| rest.strip_suffix(".dex"))
        .map_or(false, |n| {
            n.is_empty() || (!n.starts_with('0') && n.bytes().all(|b| b.is_ascii_digit()))
        })
}

pub fn count_dex_entries<'a>(names: impl IntoIterator<Item = &'a str>) -> usize {
    names.into_iter().filter(|name| is_dex_entry(name)).count()
}

/// Moves `classes.dex` to `classes<dex_count + 1>.dex` and writes `payload` as the new
/// primary. Returns the name the original primary now lives under.
pub fn reorder_dex(session: &mut ArchiveSession, dex_count: usize, payload: Vec<u8>) -> Result<String> {
    if !session.contains(PRIMARY_DEX) {
        return Err(PatchError::MissingArchiveEntry {
            archive: session.path().to_path_buf(),
            entry: PRIMARY_DEX.to_string(),
        });
    }
    let relocated = format!("classes{}.dex", dex_count + 1);
    let path = session.path().to_path_buf();
    session.rename_entry(PRIMARY_DEX, &relocated).in_archive(&path)?;
    session.write_entry(PRIMARY_DEX, payload, ZipFileOptions::Compressed);
    tracing::info!("{PRIMARY_DEX} moved to {relocated}, injector installed as primary");
    Ok(relocated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::ArchiveReader;
    use crate::core::testing::write_zip;
    use tempfile::tempdir;

    #[test]
    fn recognizes_numbered_entries() {
        assert!(is_dex_entry("classes.dex"));
        assert!(is_dex_entry("classes12.dex"));
        assert!(!is_dex_entry("classes0.dex"));
        assert!(!is_dex_entry("classesX.dex"));
        assert!(!is_dex_entry("assets/classes2.dex"));
        assert!(!is_dex_entry("classes2.dex.bak"));
    }

    #[test]
    fn payload_takes_the_primary_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("base.apk");
        write_zip(
            &path,
            &[
                ("classes.dex", b"primary", ZipFileOptions::Compressed),
                ("classes2.dex", b"secondary", ZipFileOptions::Compressed),
                ("assets/classes9.dex", b"asset", ZipFileOptions::Compressed),
            ],
        );
        let mut session = ArchiveSession::open(&path).unwrap();
        let count = count_dex_entries(session.entries());
        assert_eq!(count, 2);
        let relocated = reorder_dex(&mut session, count, b"injector".to_vec()).unwrap();
        assert_eq!(relocated, "classes3.dex");
        session.commit().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.read_entry("classes.dex").unwrap().unwrap(), b"injector");
        assert_eq!(reader.read_entry("classes2.dex").unwrap().unwrap(), b"secondary");
        assert_eq!(reader.read_entry("classes3.dex").unwrap().unwrap(), b"primary");
        let names = reader.list_entries().unwrap();
        assert_eq!(count_dex_entries(names.iter().map(String::as_str)), 3);
    }

    #[test]
    fn missing_primary_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("base.apk");
        write_zip(&path, &[("classes2.dex", b"secondary", ZipFileOptions::Compressed)]);
        let mut session = ArchiveSession::open(&path).unwrap();
        let err = reorder_dex(&mut session, 1, b"injector".to_vec()).unwrap_err();
        assert!(matches!(
            err,
            PatchError::MissingArchiveEntry { ref entry, .. } if entry == PRIMARY_DEX
        ));
    }
}
