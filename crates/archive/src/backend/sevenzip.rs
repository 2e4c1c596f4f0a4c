//! 7z archives.
//!
//! Solid archives compress many entries as one stream, so opening entry N
//! means decoding everything before it. For those the backend asks for
//! pre-extraction and decodes the whole archive in a single pass.

use super::{ArchiveBackend, PreExtractSink, blocking};
use crate::entry::{Entry, EntryHandle, EntryRecord, Instance};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::formats::FormatTable;
use crate::stream::EntryStream;
use async_trait::async_trait;
use quire_format::ArchiveFormat;
use sevenz_rust::{Password, SevenZReader};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

pub struct SevenZipBackend {
    path: PathBuf,
    pre_extract: bool,
    formats: Arc<FormatTable>,
    solid: Arc<OnceLock<bool>>,
}

impl SevenZipBackend {
    /// `pre_extract` enables bulk decoding for solid archives.
    pub fn new(path: impl Into<PathBuf>, pre_extract: bool, formats: Arc<FormatTable>) -> Self {
        Self { path: path.into(), pre_extract, formats, solid: Arc::new(OnceLock::new()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Known after the first listing.
    pub fn is_solid(&self) -> Option<bool> {
        self.solid.get().copied()
    }
}

fn sevenz_error(err: sevenz_rust::Error) -> ErrorKind {
    ErrorKind::Backend(format!("7z: {err}"))
}

fn open_reader(path: &Path) -> Result<SevenZReader<File>> {
    let file = File::open(path).map_err(|e| ErrorKind::io(e, path))?;
    let len = file.metadata().map_err(|e| ErrorKind::io(e, path))?.len();
    Ok(SevenZReader::new(file, len, Password::empty()).map_err(sevenz_error)?)
}

/// Entries are matched by name and by how many same-named entries came
/// before, because the decoder doesn't hand out indices.
type Occurrence = (String, usize);

fn occurrence_of(names: &[&str], index: usize) -> Option<Occurrence> {
    let name = *names.get(index)?;
    let nth = names[..index].iter().filter(|n| **n == name).count();
    Some((name.to_string(), nth))
}

#[async_trait]
impl ArchiveBackend for SevenZipBackend {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::SevenZip
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<EntryRecord>> {
        ensure_active(cancel)?;
        let path = self.path.clone();
        let solid = Arc::clone(&self.solid);
        let cancel = cancel.clone();
        blocking(move || {
            let reader = open_reader(&path)?;
            let archive = reader.archive();
            // A folder holding several streams has to be decoded front to back.
            let is_solid = archive.folders.iter().any(|folder| folder.num_unpack_sub_streams > 1);
            let _ = solid.set(is_solid);
            let container = std::fs::metadata(&path).and_then(|m| m.modified()).ok().map(OffsetDateTime::from);

            let mut records = Vec::with_capacity(archive.files.len());
            for (index, file) in archive.files.iter().enumerate() {
                ensure_active(&cancel)?;
                let record = match file.is_directory() {
                    true => EntryRecord::directory(index as i64, file.name()),
                    false => EntryRecord::file(index as i64, file.name(), file.size()),
                };
                let modified = match file.has_last_modified_date {
                    true => Some(OffsetDateTime::from(SystemTime::from(file.last_modified_date()))),
                    false => container,
                };
                records.push(record.with_modified(modified).with_instance(Instance::Index(index)));
            }
            tracing::trace!(path = %path.display(), count = records.len(), solid = is_solid, "7z listed");
            Ok(records)
        })
        .await
    }

    async fn open(&self, entry: &Entry, cancel: &CancellationToken) -> Result<EntryStream> {
        ensure_active(cancel)?;
        let Instance::Index(index) = *entry.instance() else {
            exn::bail!(ErrorKind::NotExtractable(entry.name().to_string()));
        };
        let path = self.path.clone();
        let raw_name = entry.raw_name().to_string();
        let cancel = cancel.clone();
        let bytes = blocking(move || {
            let mut reader = open_reader(&path)?;
            let names: Vec<&str> = reader.archive().files.iter().map(|f| f.name()).collect();
            let Some(target) = occurrence_of(&names, index) else {
                exn::bail!(ErrorKind::NotFound(raw_name));
            };
            if target.0 != raw_name {
                exn::bail!(ErrorKind::Inconsistency { expected: raw_name, actual: target.0 });
            }

            let mut seen: HashMap<String, usize> = HashMap::new();
            let mut found = None;
            reader
                .for_each_entries(|file, data| {
                    if cancel.is_cancelled() {
                        return Ok(false);
                    }
                    let nth = seen.entry(file.name().to_string()).or_default();
                    let hit = file.name() == target.0 && *nth == target.1;
                    *nth += 1;
                    if !hit {
                        io::copy(data, &mut io::sink())?;
                        return Ok(true);
                    }
                    let mut buf = Vec::with_capacity(usize::try_from(file.size()).unwrap_or_default());
                    data.read_to_end(&mut buf)?;
                    found = Some(buf);
                    Ok(false)
                })
                .map_err(sevenz_error)?;
            ensure_active(&cancel)?;
            found.ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(target.0)))
        })
        .await?;
        Ok(EntryStream::memory(bytes))
    }

    fn supports_pre_extract(&self) -> bool {
        self.pre_extract && self.is_solid() == Some(true)
    }

    /// Single pass over the archive. Nested containers and anything the
    /// memory budget can't take go to disk, the rest stays in memory.
    async fn pre_extract(&self, entries: &[EntryHandle], sink: &PreExtractSink, cancel: &CancellationToken) -> Result<()> {
        ensure_active(cancel)?;
        let path = self.path.clone();
        let formats = Arc::clone(&self.formats);
        let entries = entries.to_vec();
        let sink = sink.clone();
        let cancel = cancel.clone();
        blocking(move || {
            let mut reader = open_reader(&path)?;
            let names: Vec<&str> = reader.archive().files.iter().map(|f| f.name()).collect();
            let mut targets: HashMap<Occurrence, EntryHandle> = HashMap::new();
            for entry in entries {
                if let Instance::Index(index) = *entry.instance()
                    && let Some(key) = occurrence_of(&names, index)
                    && key.0 == entry.raw_name()
                {
                    targets.insert(key, entry);
                }
            }
            drop(names);

            let mut seen: HashMap<String, usize> = HashMap::new();
            reader
                .for_each_entries(|file, data| {
                    if cancel.is_cancelled() {
                        return Ok(false);
                    }
                    let nth = seen.entry(file.name().to_string()).or_default();
                    let key = (file.name().to_string(), *nth);
                    *nth += 1;
                    let Some(entry) = targets.remove(&key) else {
                        io::copy(data, &mut io::sink())?;
                        return Ok(true);
                    };
                    if sink.prefers_disk(file.size()) || formats.detect_container(file.name(), false).is_some() {
                        let dest = sink.file_path(&entry);
                        let mut out = File::create(&dest)?;
                        io::copy(data, &mut out)?;
                        sink.complete_file(&entry, dest);
                    } else {
                        let mut buf = Vec::with_capacity(usize::try_from(file.size()).unwrap_or_default());
                        data.read_to_end(&mut buf)?;
                        sink.complete_memory(&entry, buf);
                    }
                    Ok(!targets.is_empty())
                })
                .map_err(sevenz_error)?;
            ensure_active(&cancel)?;
            if !targets.is_empty() {
                tracing::debug!(path = %path.display(), missing = targets.len(), "7z entries not reached by pre-extract");
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::Archiver;
    use crate::entry::EntryData;
    use crate::testing::shared_context;
    use sevenz_rust::nt_time::FileTime;
    use sevenz_rust::{SeqReader, SevenZArchiveEntry, SevenZWriter, SourceReader};
    use std::io::Cursor;
    use std::time::Duration;

    const STAMP: u64 = 1_600_000_000;

    fn formats() -> Arc<FormatTable> {
        Arc::new(FormatTable::new(&quire_config::Config::default(), false, false))
    }

    fn sevenz_entry(name: &str, stamped: bool) -> SevenZArchiveEntry {
        let mut entry = SevenZArchiveEntry::new();
        entry.name = name.to_string();
        entry.has_stream = true;
        if stamped {
            entry.has_last_modified_date = true;
            entry.last_modified_date = FileTime::try_from(SystemTime::UNIX_EPOCH + Duration::from_secs(STAMP)).unwrap();
        }
        entry
    }

    /// Write a 7z with every file in one block (`solid`) or one block each.
    /// Only the first file carries its own modification time.
    fn write_7z(path: &Path, files: &[(&str, &[u8])], solid: bool) {
        let mut writer = SevenZWriter::create(path).unwrap();
        let entries: Vec<_> = files.iter().enumerate().map(|(i, (name, _))| sevenz_entry(name, i == 0)).collect();
        match solid {
            true => {
                let readers = files.iter().map(|(_, data)| SourceReader::new(Cursor::new(data.to_vec()))).collect();
                writer.push_archive_entries(entries, SeqReader::new(readers)).unwrap();
            },
            false => {
                for (entry, (_, data)) in entries.into_iter().zip(files) {
                    writer.push_archive_entry(entry, Some(Cursor::new(data.to_vec()))).unwrap();
                }
            },
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_occurrence_counts_duplicates() {
        let names = ["a.png", "b.png", "a.png", "a.png"];
        assert_eq!(occurrence_of(&names, 0), Some(("a.png".to_string(), 0)));
        assert_eq!(occurrence_of(&names, 3), Some(("a.png".to_string(), 2)));
        assert_eq!(occurrence_of(&names, 1), Some(("b.png".to_string(), 0)));
        assert_eq!(occurrence_of(&names, 4), None);
    }

    #[tokio::test]
    async fn test_solid_archive_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solid.7z");
        write_7z(&path, &[("1.png", b"one"), ("2.png", b"two")], true);

        let backend = SevenZipBackend::new(&path, true, formats());
        assert_eq!(backend.is_solid(), None);
        let records = backend.list(&CancellationToken::new()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(backend.is_solid(), Some(true));
        assert!(backend.supports_pre_extract());

        let disabled = SevenZipBackend::new(&path, false, formats());
        disabled.list(&CancellationToken::new()).await.unwrap();
        assert!(!disabled.supports_pre_extract());
    }

    #[tokio::test]
    async fn test_non_solid_archive_skips_pre_extract() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.7z");
        write_7z(&path, &[("1.png", b"one"), ("2.png", b"two")], false);

        let backend = SevenZipBackend::new(&path, true, formats());
        backend.list(&CancellationToken::new()).await.unwrap();
        assert_eq!(backend.is_solid(), Some(false));
        assert!(!backend.supports_pre_extract());
    }

    #[tokio::test]
    async fn test_entry_times_fall_back_to_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("times.7z");
        write_7z(&path, &[("stamped.png", b"one"), ("bare.png", b"two")], false);
        let container = OffsetDateTime::from(std::fs::metadata(&path).unwrap().modified().unwrap());

        let backend = SevenZipBackend::new(&path, true, formats());
        let records = backend.list(&CancellationToken::new()).await.unwrap();
        assert_eq!(records[0].modified.unwrap().unix_timestamp(), STAMP as i64);
        assert_eq!(records[1].modified, Some(container));
    }

    #[tokio::test]
    async fn test_open_reads_duplicate_names_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dupes.7z");
        write_7z(&path, &[("a.png", b"first"), ("b.png", b"middle"), ("a.png", b"second")], true);
        let context = shared_context(dir.path());
        let archiver = Archiver::open(&context, ArchiveFormat::SevenZip, &path, None, None, None).unwrap();
        let cancel = CancellationToken::new();

        let entries = archiver.list_entries(&cancel).await.unwrap();
        assert_eq!(entries.len(), 3);
        let mut read = Vec::new();
        for entry in entries.iter() {
            read.push(archiver.open_stream(entry, &cancel).await.unwrap().read_all().await.unwrap());
        }
        assert_eq!(read, [b"first".to_vec(), b"middle".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn test_pre_extract_sends_nested_containers_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.7z");
        write_7z(&path, &[("cover.png", b"cover"), ("inner.zip", b"PK not really"), ("page.png", b"page")], true);
        let context = shared_context(dir.path());
        let archiver = Archiver::open(&context, ArchiveFormat::SevenZip, &path, None, None, None).unwrap();
        let cancel = CancellationToken::new();

        let entries = archiver.list_entries(&cancel).await.unwrap();
        let direct = archiver.open_stream(&entries[2], &cancel).await.unwrap().read_all().await.unwrap();
        assert_eq!(direct, b"page");

        let _active = archiver.activation();
        assert!(archiver.can_pre_extract());
        archiver.open_stream(&entries[0], &cancel).await.unwrap();
        archiver.pre_extractor().subscribe().wait_for(|s| s.is_terminal()).await.unwrap();

        assert!(matches!(entries[0].data(), Some(EntryData::Memory(_))));
        let Some(EntryData::File(nested)) = entries[1].data() else {
            panic!("nested container should be written to disk");
        };
        assert_eq!(std::fs::read(&nested).unwrap(), b"PK not really");
        let extracted = archiver.open_stream(&entries[2], &cancel).await.unwrap().read_all().await.unwrap();
        assert_eq!(extracted, direct);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let formats = Arc::new(FormatTable::new(&quire_config::Config::default(), false, false));
        let backend = SevenZipBackend::new(dir.path().join("missing.7z"), true, formats);
        let err = backend.list(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        assert!(!backend.supports_pre_extract());
    }

    #[tokio::test]
    async fn test_garbage_is_a_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.7z");
        std::fs::write(&path, b"this is not a 7z archive at all").unwrap();
        let formats = Arc::new(FormatTable::new(&quire_config::Config::default(), false, false));
        let backend = SevenZipBackend::new(&path, true, formats);
        let err = backend.list(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Backend(_)));
    }
}
