//! In-memory archive backend for testing.

use super::{ArchiveBackend, PreExtractSink};
use crate::entry::{Entry, EntryHandle, EntryRecord, Instance};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::stream::EntryStream;
use async_trait::async_trait;
use quire_format::ArchiveFormat;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

struct MockFile {
    name: String,
    // `None` for directories.
    data: Option<Vec<u8>>,
    removed: bool,
}

/// In-memory archive backend for testing.
///
/// Entries are kept in listing order behind a [`RwLock`]. Every open and
/// list is counted (see [`open_counter`](Self::open_counter)), and decoding
/// can be slowed down with [`with_delay`](Self::with_delay) to exercise
/// cancellation and concurrency.
///
/// # Examples
///
/// ```
/// use quire_archive::backend::{ArchiveBackend, MockBackend};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("001.jpg", b"page one".to_vec()),
///     ("extra/", Vec::new()),
/// ]);
/// let records = backend.list(&CancellationToken::new()).await?;
/// assert_eq!(records.len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    format: ArchiveFormat,
    files: RwLock<Vec<MockFile>>,
    modified: Option<OffsetDateTime>,
    delay: Duration,
    solid: bool,
    opens: Arc<AtomicUsize>,
    lists: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with entries. Names ending in
    /// `/` are directories (their data is ignored).
    ///
    /// Panics on an empty name. If test setup is wrong, then test should
    /// not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>) -> Self {
        let files = files
            .into_iter()
            .map(|(name, data)| {
                let name = name.into();
                if name.is_empty() {
                    // The panic here is DELIBERATE. MockBackend is intended to be
                    // used in tests; panics are expected. There is no error result.
                    panic!("MockBackend::with_files: empty entry name");
                }
                let data = (!name.ends_with('/')).then(|| data.into());
                MockFile { name, data, removed: false }
            })
            .collect();
        Self {
            format: ArchiveFormat::Zip,
            files: RwLock::new(files),
            modified: None,
            delay: Duration::ZERO,
            solid: false,
            opens: Arc::new(AtomicUsize::new(0)),
            lists: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report a different format (defaults to ZIP).
    pub fn with_format(mut self, format: ArchiveFormat) -> Self {
        self.format = format;
        self
    }

    /// Timestamp given to every entry.
    pub fn with_modified(mut self, modified: OffsetDateTime) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Sleep this long before every decode.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Pretend to be a solid archive, which makes pre-extraction worthwhile.
    pub fn with_solid(mut self, solid: bool) -> Self {
        self.solid = solid;
        self
    }

    /// Shared count of single-entry opens. Grab it before handing the
    /// backend to an archiver.
    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }

    /// Shared count of listings.
    pub fn list_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.lists)
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<()> {
        if self.delay.is_zero() {
            return ensure_active(cancel);
        }
        tokio::select! {
            _ = cancel.cancelled() => exn::bail!(ErrorKind::Canceled),
            _ = tokio::time::sleep(self.delay) => Ok(()),
        }
    }

    async fn payload(&self, entry: &Entry) -> Result<Vec<u8>> {
        let Instance::Index(index) = entry.instance() else {
            exn::bail!(ErrorKind::NotExtractable(entry.name().to_string()));
        };
        let files = self.files.read().await;
        let file = files
            .get(*index)
            .filter(|f| !f.removed)
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(entry.name().to_string())))?;
        if file.name != entry.raw_name() {
            exn::bail!(ErrorKind::Inconsistency { expected: entry.raw_name().to_string(), actual: file.name.clone() });
        }
        file.data.clone().ok_or_else(|| exn::Exn::from(ErrorKind::IsDirectory(entry.name().to_string())))
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, Vec<u8>); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl ArchiveBackend for MockBackend {
    fn format(&self) -> ArchiveFormat {
        self.format
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<EntryRecord>> {
        ensure_active(cancel)?;
        self.lists.fetch_add(1, Ordering::SeqCst);
        let files = self.files.read().await;
        Ok(files
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.removed)
            .map(|(index, f)| {
                let record = match &f.data {
                    Some(data) => EntryRecord::file(index as i64, f.name.clone(), data.len() as u64),
                    None => EntryRecord::directory(index as i64, f.name.clone()),
                };
                record.with_modified(self.modified).with_instance(Instance::Index(index))
            })
            .collect())
    }

    async fn open(&self, entry: &Entry, cancel: &CancellationToken) -> Result<EntryStream> {
        self.pause(cancel).await?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(EntryStream::memory(self.payload(entry).await?))
    }

    fn supports_pre_extract(&self) -> bool {
        self.solid
    }

    /// One pass over everything, like a solid decoder would do.
    async fn pre_extract(&self, entries: &[EntryHandle], sink: &PreExtractSink, cancel: &CancellationToken) -> Result<()> {
        for entry in entries {
            self.pause(cancel).await?;
            let data = self.payload(entry).await?;
            match sink.prefers_disk(data.len() as u64) {
                true => {
                    let path = sink.file_path(entry);
                    tokio::fs::write(&path, &data).await.map_err(|e| ErrorKind::io(e, &path))?;
                    sink.complete_file(entry, path);
                },
                false => sink.complete_memory(entry, data),
            }
        }
        Ok(())
    }

    fn can_delete(&self, _entries: &[EntryHandle]) -> bool {
        true
    }

    async fn delete(&self, entries: &[EntryHandle]) -> Result<()> {
        let mut files = self.files.write().await;
        for entry in entries {
            if let Instance::Index(index) = entry.instance()
                && let Some(file) = files.get_mut(*index)
            {
                file.removed = true;
            }
        }
        Ok(())
    }

    async fn exists(&self, entry: &Entry) -> Result<bool> {
        Ok(self.payload(entry).await.is_ok())
    }
}
