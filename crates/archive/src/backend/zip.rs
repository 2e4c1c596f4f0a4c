//! ZIP archives.
//!
//! Decoding happens on the blocking pool. The parsed central directory is
//! kept between calls; any failure drops it so the next call starts over
//! from the file.

use super::{ArchiveBackend, blocking};
use crate::entry::{Entry, EntryHandle, EntryRecord, Instance};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::path;
use crate::stream::EntryStream;
use async_trait::async_trait;
use quire_config::{ZipConfig, ZipEncoding};
use quire_format::ArchiveFormat;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tokio_util::sync::CancellationToken;
use zip::result::ZipError;
use zip::{ZipArchive, ZipWriter};

struct Shared {
    path: PathBuf,
    encoding: ZipEncoding,
    utf8: OnceLock<bool>,
    archive: Mutex<Option<ZipArchive<File>>>,
}

impl Shared {
    fn open(&self) -> Result<ZipArchive<File>> {
        let mut file = File::open(&self.path).map_err(|e| ErrorKind::io(e, &self.path))?;
        let mut head = Vec::with_capacity(4);
        (&mut file).take(4).read_to_end(&mut head).map_err(|e| ErrorKind::io(e, &self.path))?;
        if !quire_format::zip::has_signature(&head) {
            exn::bail!(ErrorKind::NotSupported(format!("not a zip archive: {}", self.path.display())));
        }
        self.utf8.get_or_init(|| self.detect_utf8(&mut file));
        file.rewind().map_err(|e| ErrorKind::io(e, &self.path))?;
        Ok(ZipArchive::new(file).map_err(zip_error)?)
    }

    fn detect_utf8(&self, file: &mut File) -> bool {
        match self.encoding {
            ZipEncoding::Utf8 => true,
            ZipEncoding::Local => false,
            ZipEncoding::Auto => match quire_format::zip::is_utf8_encoded(file) {
                Ok(utf8) => utf8,
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "could not inspect zip names, assuming legacy encoding");
                    false
                },
            },
        }
    }

    fn names_are_utf8(&self) -> bool {
        self.utf8.get().copied().unwrap_or(false)
    }

    /// Run `job` against the cached archive, opening it first if needed.
    fn with_archive<T>(&self, job: impl FnOnce(&mut ZipArchive<File>, bool) -> Result<T>) -> Result<T> {
        let mut guard = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
        let mut archive = match guard.take() {
            Some(archive) => archive,
            None => self.open()?,
        };
        let result = job(&mut archive, self.names_are_utf8());
        if result.is_ok() {
            *guard = Some(archive);
        }
        result
    }
}

/// Reads ZIP (and CBZ) files.
///
/// Entry names are decoded as UTF-8 or with the legacy code page, depending
/// on [`ZipEncoding`]; with `Auto` the central directory is inspected once.
/// Entries can be deleted from root archives when the configuration allows
/// it; the archive is rewritten next to the original and swapped in.
pub struct ZipBackend {
    shared: Arc<Shared>,
    allow_delete: bool,
    is_root: bool,
}

impl ZipBackend {
    pub fn new(path: impl Into<PathBuf>, config: &ZipConfig, is_root: bool) -> Self {
        let shared = Shared {
            path: path.into(),
            encoding: config.encoding,
            utf8: OnceLock::new(),
            archive: Mutex::new(None),
        };
        Self { shared: Arc::new(shared), allow_delete: config.allow_delete, is_root }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

fn zip_error(err: ZipError) -> ErrorKind {
    match err {
        ZipError::Io(err) => ErrorKind::Io(err),
        other => ErrorKind::Backend(other.to_string()),
    }
}

fn entry_name(raw: &[u8], decoded: &str, utf8: bool) -> String {
    match utf8 {
        true => String::from_utf8_lossy(raw).into_owned(),
        // The zip crate decodes unflagged names as IBM437 itself.
        false => decoded.to_string(),
    }
}

/// ZIP stores local wall-clock time without a zone; read it as UTC.
fn to_offset(stamp: zip::DateTime) -> Option<OffsetDateTime> {
    let month = Month::try_from(stamp.month()).ok()?;
    let date = Date::from_calendar_date(i32::from(stamp.year()), month, stamp.day()).ok()?;
    let time = Time::from_hms(stamp.hour(), stamp.minute(), stamp.second()).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

fn index_of(entry: &Entry) -> Result<usize> {
    match entry.instance() {
        Instance::Index(index) => Ok(*index),
        _ => exn::bail!(ErrorKind::NotExtractable(entry.name().to_string())),
    }
}

#[async_trait]
impl ArchiveBackend for ZipBackend {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<EntryRecord>> {
        ensure_active(cancel)?;
        let shared = Arc::clone(&self.shared);
        let cancel = cancel.clone();
        blocking(move || {
            shared.with_archive(|archive, utf8| {
                let mut records = Vec::with_capacity(archive.len());
                for index in 0..archive.len() {
                    ensure_active(&cancel)?;
                    let file = archive.by_index_raw(index).map_err(zip_error)?;
                    let name = entry_name(file.name_raw(), file.name(), utf8);
                    let record = match path::has_trailing_separator(&name) {
                        true => EntryRecord::directory(index as i64, name),
                        false => EntryRecord::file(index as i64, name, file.size()),
                    };
                    let modified = file.last_modified().and_then(to_offset);
                    records.push(record.with_modified(modified).with_instance(Instance::Index(index)));
                }
                tracing::trace!(path = %shared.path.display(), count = records.len(), utf8, "zip listed");
                Ok(records)
            })
        })
        .await
    }

    async fn open(&self, entry: &Entry, cancel: &CancellationToken) -> Result<EntryStream> {
        ensure_active(cancel)?;
        let index = index_of(entry)?;
        let raw_name = entry.raw_name().to_string();
        let shared = Arc::clone(&self.shared);
        let bytes = blocking(move || {
            shared.with_archive(|archive, utf8| {
                let mut file = archive.by_index(index).map_err(zip_error)?;
                let actual = entry_name(file.name_raw(), file.name(), utf8);
                if actual != raw_name {
                    exn::bail!(ErrorKind::Inconsistency { expected: raw_name, actual });
                }
                let mut buf = Vec::with_capacity(usize::try_from(file.size()).unwrap_or_default());
                file.read_to_end(&mut buf).map_err(ErrorKind::Io)?;
                Ok(buf)
            })
        })
        .await?;
        Ok(EntryStream::memory(bytes))
    }

    // NOTE: Deleting shifts the indices of every later entry, so entries
    // listed before a delete can't be checked reliably. Only the deletion
    // flag is consulted.
    async fn exists(&self, entry: &Entry) -> Result<bool> {
        Ok(!entry.is_deleted())
    }

    fn can_delete(&self, _entries: &[EntryHandle]) -> bool {
        self.is_root && self.allow_delete
    }

    async fn delete(&self, entries: &[EntryHandle]) -> Result<()> {
        if !self.can_delete(entries) {
            exn::bail!(ErrorKind::Unsupported { format: ArchiveFormat::Zip, operation: "delete" });
        }
        // Directories take everything under them along.
        let prefixes: Vec<String> = entries.iter().filter(|e| e.is_directory()).map(|e| e.name().to_string()).collect();
        let mut targets: HashSet<usize> = HashSet::new();
        let mut names: Vec<(usize, String)> = Vec::new();
        for entry in entries.iter().filter(|e| e.id() >= 0) {
            let index = index_of(entry)?;
            targets.insert(index);
            names.push((index, entry.raw_name().to_string()));
        }

        let shared = Arc::clone(&self.shared);
        blocking(move || {
            let mut guard = shared.archive.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop the cached handle; the file is about to be replaced.
            guard.take();
            let mut archive = shared.open()?;
            let utf8 = shared.names_are_utf8();

            for index in 0..archive.len() {
                let file = archive.by_index_raw(index).map_err(zip_error)?;
                let name = path::normalize(&entry_name(file.name_raw(), file.name(), utf8));
                if prefixes.iter().any(|prefix| path::is_under(&name, prefix)) {
                    targets.insert(index);
                }
            }
            for (index, expected) in &names {
                let file = archive.by_index_raw(*index).map_err(zip_error)?;
                let actual = entry_name(file.name_raw(), file.name(), utf8);
                if actual != *expected {
                    exn::bail!(ErrorKind::Inconsistency { expected: expected.clone(), actual });
                }
            }

            let mut temp = shared.path.clone().into_os_string();
            temp.push(".temp");
            let temp = PathBuf::from(temp);
            let written: Result<()> = (|| {
                let out = File::create(&temp).map_err(|e| ErrorKind::io(e, &temp))?;
                let mut writer = ZipWriter::new(out);
                for index in (0..archive.len()).filter(|i| !targets.contains(i)) {
                    let file = archive.by_index_raw(index).map_err(zip_error)?;
                    writer.raw_copy_file(file).map_err(zip_error)?;
                }
                writer.finish().map_err(zip_error)?;
                Ok(())
            })();
            drop(archive);
            if let Err(err) = written {
                let _ = std::fs::remove_file(&temp);
                return Err(err);
            }
            std::fs::rename(&temp, &shared.path).map_err(|e| ErrorKind::io(e, &shared.path))?;
            tracing::info!(path = %shared.path.display(), removed = targets.len(), "zip entries deleted");
            Ok(())
        })
        .await
    }
}
