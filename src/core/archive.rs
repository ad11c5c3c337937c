//! Entry-level editing of zip archives.
//!
//! Reads go straight to the archive on disk. Mutations are buffered in an
//! [`ArchiveSession`] and only become visible when [`ArchiveSession::commit`] rewrites
//! the whole archive into a temporary file next to it and renames it over the original.
//!
//! Every commit realigns stored entries the way `zipalign -p` does: shared objects under
//! `lib/` start on a page boundary, every other stored entry on a 4-byte boundary.

use anyhow::{ensure, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Page size native libraries must be aligned to so they can be mapped straight out of the archive.
pub const PAGE_ALIGNMENT: u16 = 4096;

/// Alignment of stored entries that are not native libraries.
pub const STORED_ALIGNMENT: u16 = 4;

/// Required data alignment of a stored entry called `name`.
pub fn stored_alignment(name: &str) -> u16 {
    if name.starts_with("lib/") && name.ends_with(".so") {
        PAGE_ALIGNMENT
    } else {
        STORED_ALIGNMENT
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZipFileOptions {
    Unaligned,
    Aligned(u16),
    Compressed,
}

impl ZipFileOptions {
    pub fn alignment(self) -> u16 {
        match self {
            Self::Aligned(align) => align,
            _ => 1,
        }
    }

    pub fn compression_method(self) -> CompressionMethod {
        match self {
            Self::Compressed => CompressionMethod::Deflated,
            _ => CompressionMethod::Stored,
        }
    }

    pub(crate) fn file_options(self) -> FileOptions {
        FileOptions::default().compression_method(self.compression_method())
    }
}

/// Where an entry's payload starts and how it is stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryInfo {
    pub compression: CompressionMethod,
    pub data_start: u64,
    pub size: u64,
}

pub struct ArchiveReader {
    path: PathBuf,
    zip: ZipArchive<BufReader<File>>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("While opening archive `{}`", path.display()))?;
        let zip = ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("`{}` is not a valid zip archive", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            zip,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry names in central directory order.
    pub fn list_entries(&mut self) -> Result<Vec<String>> {
        let zip = &mut self.zip;
        (0..zip.len())
            .map(|index| Ok(zip.by_index_raw(index)?.name().to_string()))
            .collect()
    }

    /// Decompressed contents of `name`, or `None` when the archive has no such entry.
    pub fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.zip.by_name(name) {
            Ok(mut file) => {
                let mut buf = Vec::with_capacity(file.size() as usize);
                file.read_to_end(&mut buf)
                    .with_context(|| format!("While reading `{name}`"))?;
                Ok(Some(buf))
            }
            Err(ZipError::FileNotFound) => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("While looking up `{name}` in `{}`", self.path.display())),
        }
    }

    pub fn entry_info(&mut self, name: &str) -> Result<Option<EntryInfo>> {
        match self.zip.by_name(name) {
            Ok(file) => Ok(Some(EntryInfo {
                compression: file.compression(),
                data_start: file.data_start(),
                size: file.size(),
            })),
            Err(ZipError::FileNotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn read_index(&mut self, index: usize) -> Result<Vec<u8>> {
        let mut file = self.zip.by_index(index)?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

enum Slot {
    /// Untouched entry, copied from this index of the source archive.
    Original(usize),
    Pending {
        contents: Vec<u8>,
        opts: ZipFileOptions,
    },
}

/// A scoped read-write edit of one archive.
///
/// Dropping a session without calling [`commit`](Self::commit) discards every edit.
pub struct ArchiveSession {
    reader: ArchiveReader,
    entries: Vec<(String, Slot)>,
}

impl ArchiveSession {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = ArchiveReader::open(path)?;
        let entries = reader
            .list_entries()?
            .into_iter()
            .enumerate()
            .map(|(index, name)| (name, Slot::Original(index)))
            .collect();
        Ok(Self { reader, entries })
    }

    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    /// Entry names as they will be written on commit.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(entry, _)| entry == name)
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(pos) = self.position(name) else {
            return Ok(None);
        };
        match &self.entries[pos].1 {
            Slot::Pending { contents, .. } => Ok(Some(contents.clone())),
            Slot::Original(index) => {
                let index = *index;
                self.reader.read_index(index).map(Some)
            }
        }
    }

    /// Removes `name` if present.
    ///
    /// Stored entries are realigned on every commit, so the entries after `name` keep their
    /// alignment whether or not `preserve_alignment` is set. The flag only states the
    /// caller's requirement in the log.
    pub fn delete_entry(&mut self, name: &str, preserve_alignment: bool) -> bool {
        match self.position(name) {
            Some(pos) => {
                self.entries.remove(pos);
                tracing::debug!(
                    "{}: delete `{name}` (alignment required: {preserve_alignment})",
                    self.path().display()
                );
                true
            }
            None => false,
        }
    }

    /// Inserts `name`, or replaces its contents in place when it already exists.
    pub fn write_entry(&mut self, name: &str, contents: Vec<u8>, opts: ZipFileOptions) {
        tracing::debug!(
            "{}: write `{name}` ({} bytes, {:?})",
            self.path().display(),
            contents.len(),
            opts
        );
        let slot = Slot::Pending { contents, opts };
        match self.position(name) {
            Some(pos) => self.entries[pos].1 = slot,
            None => self.entries.push((name.to_string(), slot)),
        }
    }

    /// Moves an entry to a new name without touching its compressed bytes.
    pub fn rename_entry(&mut self, from: &str, to: &str) -> Result<()> {
        ensure!(!self.contains(to), "entry `{to}` already exists");
        let pos = self
            .position(from)
            .with_context(|| format!("no entry `{from}` to rename"))?;
        tracing::debug!("{}: rename `{from}` -> `{to}`", self.path().display());
        self.entries[pos].0 = to.to_string();
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        let Self { reader, entries } = self;
        let ArchiveReader { path, mut zip } = reader;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("While creating a temporary file in `{}`", dir.display()))?;
        {
            let mut writer = ZipWriter::new(BufWriter::new(tmp.as_file_mut()));
            for (name, slot) in entries {
                match slot {
                    Slot::Original(index) => {
                        copy_entry(&mut zip, &mut writer, index, &name)
                            .with_context(|| format!("While copying `{name}`"))?;
                    }
                    Slot::Pending { contents, opts } => {
                        let alignment = match opts {
                            ZipFileOptions::Compressed => 1,
                            _ => opts.alignment().max(stored_alignment(&name)),
                        };
                        writer.start_file_aligned(name.as_str(), opts.file_options(), alignment)?;
                        writer.write_all(&contents)?;
                    }
                }
            }
            let mut out = writer.finish()?;
            out.flush()?;
        }
        drop(zip);
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .with_context(|| format!("While replacing `{}`", path.display()))?;
        tracing::debug!("{}: committed", path.display());
        Ok(())
    }
}

fn copy_entry<R: Read + Seek, W: Write + Seek>(
    zip: &mut ZipArchive<R>,
    writer: &mut ZipWriter<W>,
    index: usize,
    name: &str,
) -> Result<()> {
    let mut file = zip.by_index_raw(index)?;
    if !file.is_dir() && file.compression() == CompressionMethod::Stored {
        // Stored payloads are their own raw bytes; re-emit them so the padding is recomputed
        // for the offset they land on in the new archive.
        let mut options = FileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(file.last_modified());
        if let Some(mode) = file.unix_mode() {
            options = options.unix_permissions(mode);
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        writer.start_file_aligned(name, options, stored_alignment(name))?;
        writer.write_all(&contents)?;
    } else if file.name() == name {
        writer.raw_copy_file(file)?;
    } else {
        writer.raw_copy_file_rename(file, name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::write_zip;
    use tempfile::tempdir;

    const LIB: &str = "lib/arm64-v8a/libhermes.so";

    fn fixture(dir: &Path) -> PathBuf {
        let path = dir.join("split.apk");
        write_zip(
            &path,
            &[
                ("AndroidManifest.xml", b"manifest v1", ZipFileOptions::Compressed),
                (LIB, &[0x7f; 5000], ZipFileOptions::Aligned(PAGE_ALIGNMENT)),
                ("res/raw/data.bin", b"raw", ZipFileOptions::Unaligned),
            ],
        );
        path
    }

    #[test]
    fn lists_and_reads_entries() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path());
        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(
            reader.list_entries().unwrap(),
            vec!["AndroidManifest.xml", LIB, "res/raw/data.bin"]
        );
        assert_eq!(
            reader.read_entry("AndroidManifest.xml").unwrap().unwrap(),
            b"manifest v1"
        );
        assert_eq!(reader.read_entry("classes.dex").unwrap(), None);
    }

    #[test]
    fn commit_reflects_final_entry_set() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path());
        let mut session = ArchiveSession::open(&path).unwrap();
        session.write_entry("classes.dex", b"dex 1".to_vec(), ZipFileOptions::Compressed);
        session.write_entry("classes.dex", b"dex 2".to_vec(), ZipFileOptions::Compressed);
        assert!(session.delete_entry("res/raw/data.bin", false));
        assert!(!session.delete_entry("res/raw/missing.bin", false));
        session.commit().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(
            reader.list_entries().unwrap(),
            vec!["AndroidManifest.xml", LIB, "classes.dex"]
        );
        assert_eq!(reader.read_entry("classes.dex").unwrap().unwrap(), b"dex 2");
    }

    #[test]
    fn pending_writes_are_readable_before_commit() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path());
        let mut session = ArchiveSession::open(&path).unwrap();
        session.write_entry("AndroidManifest.xml", b"v2".to_vec(), ZipFileOptions::Compressed);
        assert_eq!(
            session.read_entry("AndroidManifest.xml").unwrap().unwrap(),
            b"v2"
        );
        assert_eq!(session.read_entry(LIB).unwrap().unwrap(), vec![0x7f; 5000]);
    }

    #[test]
    fn dropped_session_leaves_archive_untouched() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path());
        let before = std::fs::read(&path).unwrap();
        {
            let mut session = ArchiveSession::open(&path).unwrap();
            session.delete_entry("AndroidManifest.xml", true);
            session.write_entry("junk", vec![1, 2, 3], ZipFileOptions::Unaligned);
        }
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn rename_keeps_bytes_and_rejects_collisions() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path());
        let mut session = ArchiveSession::open(&path).unwrap();
        assert!(session.rename_entry("res/raw/data.bin", LIB).is_err());
        assert!(session.rename_entry("missing", "other").is_err());
        session
            .rename_entry("AndroidManifest.xml", "AndroidManifest.old")
            .unwrap();
        session.commit().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.read_entry("AndroidManifest.xml").unwrap(), None);
        assert_eq!(
            reader.read_entry("AndroidManifest.old").unwrap().unwrap(),
            b"manifest v1"
        );
    }

    #[test]
    fn alignment_survives_a_shrinking_rewrite() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path());
        let mut session = ArchiveSession::open(&path).unwrap();
        session.delete_entry("AndroidManifest.xml", false);
        session.write_entry(
            "AndroidManifest.xml",
            b"a much longer manifest than before".to_vec(),
            ZipFileOptions::Compressed,
        );
        session.commit().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let info = reader.entry_info(LIB).unwrap().unwrap();
        assert_eq!(info.compression, CompressionMethod::Stored);
        assert_eq!(info.data_start % PAGE_ALIGNMENT as u64, 0);
        assert_eq!(reader.read_entry(LIB).unwrap().unwrap(), vec![0x7f; 5000]);
    }

    #[test]
    fn untouched_stored_entries_stay_aligned_after_a_plain_edit() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path());
        for manifest in ["a", "a manifest several bytes longer than the first one"] {
            let mut session = ArchiveSession::open(&path).unwrap();
            session.write_entry(
                "AndroidManifest.xml",
                manifest.as_bytes().to_vec(),
                ZipFileOptions::Compressed,
            );
            session.commit().unwrap();

            let mut reader = ArchiveReader::open(&path).unwrap();
            let lib = reader.entry_info(LIB).unwrap().unwrap();
            assert_eq!(lib.data_start % PAGE_ALIGNMENT as u64, 0, "{manifest}");
            let raw = reader.entry_info("res/raw/data.bin").unwrap().unwrap();
            assert_eq!(raw.data_start % STORED_ALIGNMENT as u64, 0, "{manifest}");
            assert_eq!(reader.read_entry(LIB).unwrap().unwrap(), vec![0x7f; 5000]);
            assert_eq!(reader.read_entry("res/raw/data.bin").unwrap().unwrap(), b"raw");
        }
    }

    #[test]
    fn misaligned_libraries_are_moved_onto_a_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("split.apk");
        write_zip(
            &path,
            &[
                ("AndroidManifest.xml", b"m", ZipFileOptions::Compressed),
                (LIB, &[1; 64], ZipFileOptions::Unaligned),
            ],
        );
        let mut session = ArchiveSession::open(&path).unwrap();
        session.write_entry("classes.dex", b"dex".to_vec(), ZipFileOptions::Compressed);
        session.commit().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let info = reader.entry_info(LIB).unwrap().unwrap();
        assert_eq!(info.data_start % PAGE_ALIGNMENT as u64, 0);
    }

    #[test]
    fn stored_alignment_classes() {
        assert_eq!(stored_alignment("lib/arm64-v8a/libhermes.so"), PAGE_ALIGNMENT);
        assert_eq!(stored_alignment("resources.arsc"), STORED_ALIGNMENT);
        assert_eq!(stored_alignment("assets/lib/thing.so"), STORED_ALIGNMENT);
    }

    #[test]
    fn aligned_write_is_stored_on_a_page_boundary() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path());
        let mut session = ArchiveSession::open(&path).unwrap();
        session.write_entry(
            "lib/arm64-v8a/libc++_shared.so",
            vec![1; 100],
            ZipFileOptions::Aligned(PAGE_ALIGNMENT),
        );
        session.commit().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let info = reader
            .entry_info("lib/arm64-v8a/libc++_shared.so")
            .unwrap()
            .unwrap();
        assert_eq!(info.compression, CompressionMethod::Stored);
        assert_eq!(info.data_start % PAGE_ALIGNMENT as u64, 0);
    }
}
