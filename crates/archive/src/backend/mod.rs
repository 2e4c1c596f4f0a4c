//! Archive backend trait and implementations.
//!
//! A backend knows how to enumerate and decode one container format. It
//! doesn't cache, filter, synthesize directories or coordinate
//! pre-extraction; the [`Archiver`](crate::Archiver) wrapping it does all of
//! that, so every backend gets the same behaviour for free.

mod folder;
mod media;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod pdf;
mod playlist;
mod plugin;
mod sevenzip;
mod zip;

pub use self::folder::FolderBackend;
pub(crate) use self::folder::stat_record;
pub use self::media::MediaBackend;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockBackend;
pub use self::pdf::{PdfBackend, PdfInfo, PdfRenderer};
pub use self::playlist::{Playlist, PlaylistBackend, PlaylistItem};
pub use self::plugin::{ArchivePlugin, PluginBackend, PluginHost, PluginRecord};
pub use self::sevenzip::SevenZipBackend;
pub use self::zip::ZipBackend;
use crate::context::ArchiveContext;
use crate::entry::{Entry, EntryHandle, EntryRecord};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::memory::MemoryBudget;
use crate::node::EntryResolver;
use crate::stream::EntryStream;
use async_trait::async_trait;
use exn::ResultExt;
use quire_format::{ArchiveFormat, extension_of};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Unified interface for container formats.
///
/// Entries passed in were produced by this backend's own
/// [`list`](Self::list) (the wrapper checks ownership before calling in).
/// Implementations that decode synchronously should do so inside
/// [`spawn_blocking`](tokio::task::spawn_blocking).
///
/// # Examples
///
/// ```no_run
/// use quire_archive::backend::ArchiveBackend;
/// use quire_archive::error::Result;
/// use tokio_util::sync::CancellationToken;
///
/// async fn count_files(backend: &dyn ArchiveBackend) -> Result<usize> {
///     let records = backend.list(&CancellationToken::new()).await?;
///     Ok(records.iter().filter(|r| r.length >= 0).count())
/// }
/// ```
#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    fn format(&self) -> ArchiveFormat;

    /// Enumerate the container in a stable order.
    ///
    /// Directories are only reported if the container stores them; missing
    /// ones are synthesized by the wrapper unless
    /// [`synthesizes_directories`](Self::synthesizes_directories) says
    /// otherwise.
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<EntryRecord>>;

    /// Decode one entry.
    async fn open(&self, entry: &Entry, cancel: &CancellationToken) -> Result<EntryStream>;

    /// Write one entry to `dest`.
    ///
    /// Default implementation streams [`open`](Self::open) into the file.
    async fn extract(&self, entry: &Entry, dest: &Path, overwrite: bool, cancel: &CancellationToken) -> Result<()> {
        check_overwrite(dest, overwrite).await?;
        let mut stream = self.open(entry, cancel).await?;
        let mut file = tokio::fs::File::create(dest).await.map_err(|e| ErrorKind::io(e, dest))?;
        tokio::io::copy(&mut stream, &mut file).await.map_err(|e| ErrorKind::io(e, dest))?;
        file.flush().await.map_err(|e| ErrorKind::io(e, dest))?;
        Ok(())
    }

    /// Whether the wrapper should add directory entries for names that
    /// only appear as path prefixes.
    fn synthesizes_directories(&self) -> bool {
        true
    }

    /// Whether bulk-decoding everything up front beats opening entries one
    /// at a time. Only asked after the first listing.
    fn supports_pre_extract(&self) -> bool {
        false
    }

    /// Decode every entry in `entries`, handing each payload to `sink`.
    ///
    /// Default implementation extracts entries one by one into the sink's
    /// directory. A failing entry is logged and skipped; it will simply be
    /// opened directly later on.
    async fn pre_extract(&self, entries: &[EntryHandle], sink: &PreExtractSink, cancel: &CancellationToken) -> Result<()> {
        for entry in entries {
            ensure_active(cancel)?;
            let dest = sink.file_path(entry);
            match self.extract(entry, &dest, true, cancel).await {
                Ok(()) => sink.complete_file(entry, dest),
                Err(err) if err.is_canceled() => return Err(err),
                Err(err) => tracing::warn!(entry = %entry.name(), error = %err, "pre-extract of entry failed"),
            }
        }
        Ok(())
    }

    /// Real path of an entry, if it has one.
    fn file_system_path(&self, _entry: &Entry) -> Option<PathBuf> {
        None
    }

    /// Does the entry still exist in the container?
    async fn exists(&self, entry: &Entry) -> Result<bool> {
        Ok(!entry.is_deleted())
    }

    fn can_delete(&self, _entries: &[EntryHandle]) -> bool {
        false
    }

    async fn delete(&self, _entries: &[EntryHandle]) -> Result<()> {
        exn::bail!(ErrorKind::Unsupported { format: self.format(), operation: "delete" })
    }

    fn can_rename(&self, _entry: &Entry) -> bool {
        false
    }

    /// Rename an entry, returning its new raw name.
    async fn rename(&self, _entry: &Entry, _name: &str) -> Result<String> {
        exn::bail!(ErrorKind::Unsupported { format: self.format(), operation: "rename" })
    }
}

pub type BackendHandle = Box<dyn ArchiveBackend>;

/// Build the backend for `format`.
///
/// `name` is what the container is called where it was found (it picks the
/// plugin, and names the single entry of a media file). Only root containers
/// on disk may be modified.
pub fn create(
    format: ArchiveFormat,
    path: &Path,
    name: &str,
    is_root: bool,
    context: &ArchiveContext,
    resolver: Option<Arc<dyn EntryResolver>>,
) -> Result<BackendHandle> {
    let config = context.config();
    let unavailable = || exn::Exn::from(ErrorKind::NotSupported(extension_of(name).unwrap_or_else(|| name.to_string())));
    let backend: BackendHandle = match format {
        ArchiveFormat::FileSystem => Box::new(FolderBackend::new(path)),
        ArchiveFormat::Zip => Box::new(ZipBackend::new(path, &config.zip, is_root)),
        ArchiveFormat::SevenZip => {
            Box::new(SevenZipBackend::new(path, config.sevenzip.pre_extract, Arc::clone(context.formats())))
        },
        ArchiveFormat::Pdf => {
            let renderer = context.pdf_renderer().ok_or_else(unavailable)?;
            Box::new(PdfBackend::new(path, Arc::clone(renderer)))
        },
        ArchiveFormat::Plugin => {
            let host = context.plugin_host().ok_or_else(unavailable)?;
            let plugin = host.find(name).ok_or_else(unavailable)?;
            Box::new(PluginBackend::new(path, plugin, Arc::clone(host)))
        },
        ArchiveFormat::Media => Box::new(MediaBackend::new(path, name)),
        ArchiveFormat::Playlist => {
            let resolver = resolver.ok_or_else(unavailable)?;
            Box::new(PlaylistBackend::new(path, resolver, Arc::clone(context.formats())))
        },
    };
    Ok(backend)
}

/// Where pre-extracted payloads go.
///
/// Payloads are kept in memory while the budget allows, otherwise written
/// under the archiver's private temp directory as `{id:06}{ext}`.
#[derive(Clone)]
pub struct PreExtractSink {
    directory: Arc<Path>,
    memory: MemoryBudget,
    progress: Arc<watch::Sender<u64>>,
}

impl PreExtractSink {
    pub(crate) fn new(directory: &Path, memory: MemoryBudget, progress: Arc<watch::Sender<u64>>) -> Self {
        Self { directory: Arc::from(directory), memory, progress }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn memory(&self) -> &MemoryBudget {
        &self.memory
    }

    /// Destination for an entry written to disk.
    pub fn file_path(&self, entry: &Entry) -> PathBuf {
        let ext = extension_of(entry.name()).unwrap_or_default();
        self.directory.join(format!("{:06}{}", entry.id(), ext))
    }

    /// Should this payload be written to disk rather than kept in memory?
    pub fn prefers_disk(&self, length: u64) -> bool {
        self.memory.is_full() || self.memory.would_exceed(length)
    }

    pub fn complete_memory(&self, entry: &Entry, bytes: Vec<u8>) {
        let slot = self.memory.acquire(bytes.len() as u64);
        entry.set_memory(Arc::from(bytes), Some(slot));
        self.bump();
    }

    pub fn complete_file(&self, entry: &Entry, path: PathBuf) {
        entry.set_file(path);
        self.bump();
    }

    fn bump(&self) {
        self.progress.send_modify(|count| *count += 1);
    }
}

/// Fail with [`AlreadyExists`](ErrorKind::AlreadyExists) unless overwriting.
pub(crate) async fn check_overwrite(dest: &Path, overwrite: bool) -> Result<()> {
    if !overwrite && tokio::fs::try_exists(dest).await.map_err(|e| ErrorKind::io(e, dest))? {
        exn::bail!(ErrorKind::AlreadyExists(dest.to_path_buf()));
    }
    Ok(())
}

/// Run a blocking decoder job off the async workers.
pub(crate) async fn blocking<T, F>(job: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job).await.or_raise(|| ErrorKind::Backend("decoder task panicked".to_string()))?
}
