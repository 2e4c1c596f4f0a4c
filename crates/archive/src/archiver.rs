//! The archiver: one opened container.
//!
//! Wraps a backend with everything backends shouldn't each reimplement:
//! the entry cache, exclusion filtering, directory synthesis, the payload
//! shortcut for pre-extracted entries, and pre-extraction itself.

use crate::backend::{self, BackendHandle, PreExtractSink, check_overwrite};
use crate::context::ArchiveContext;
use crate::entry::{Entry, EntryData, EntryHandle, EntryRecord};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::formats::FormatTable;
use crate::node::{EntryNode, EntryResolver};
use crate::path;
use crate::pre_extract::PreExtractor;
use crate::stream::EntryStream;
use crate::temp::TempFile;
use quire_format::ArchiveFormat;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

pub type ArchiverId = u64;
pub type ArchiverHandle = Arc<Archiver>;

tokio::task_local! {
    // Archivers being listed further up the current task.
    static LISTING: Vec<ArchiverId>;
}

/// What an entry needs to know about its owner.
///
/// Shared by the archiver and every entry it lists. Holding it doesn't keep
/// the archiver alive.
#[derive(Debug)]
pub struct ArchiverMeta {
    pub id: ArchiverId,
    pub format: ArchiveFormat,
    /// Backing file or directory (a temp file for nested containers).
    pub path: PathBuf,
    /// Name of the source entry in the parent, or the file name.
    pub entry_name: String,
    pub ident: String,
    pub system_path: String,
    pub is_root: bool,
    pub formats: Arc<FormatTable>,
}

pub struct Archiver {
    meta: Arc<ArchiverMeta>,
    backend: BackendHandle,
    context: Arc<ArchiveContext>,
    parent: Option<ArchiverHandle>,
    source: Option<EntryHandle>,
    length: i64,
    modified: Option<OffsetDateTime>,
    // Keeps a materialized nested container on disk for as long as we live.
    proxy: Option<Arc<TempFile>>,
    entries: tokio::sync::Mutex<Option<Arc<[EntryHandle]>>>,
    pre_extractor: PreExtractor,
    activations: AtomicUsize,
}

impl Archiver {
    /// Open `path` with the backend for `format`.
    ///
    /// `source` is the node this container was reached through (absent for
    /// containers on disk), `proxy` the temp file backing it if it had to be
    /// materialized. Playlists need a `resolver` to follow their items.
    pub fn open(
        context: &Arc<ArchiveContext>,
        format: ArchiveFormat,
        path: impl Into<PathBuf>,
        source: Option<&EntryNode>,
        proxy: Option<Arc<TempFile>>,
        resolver: Option<Arc<dyn EntryResolver>>,
    ) -> Result<ArchiverHandle> {
        let path = path.into();
        let name = match source {
            Some(node) => node.entry().name().to_string(),
            None => path::file_name(&path::from_system(&path)).to_string(),
        };
        let backend = backend::create(format, &path, &name, source.is_none(), context, resolver)?;
        Ok(Self::with_backend(context, backend, path, source, proxy))
    }

    /// Wrap an already constructed backend.
    pub fn with_backend(
        context: &Arc<ArchiveContext>,
        backend: BackendHandle,
        path: impl Into<PathBuf>,
        source: Option<&EntryNode>,
        proxy: Option<Arc<TempFile>>,
    ) -> ArchiverHandle {
        let path = path.into();
        let path_str = path::from_system(&path);
        let parent = source.map(|node| Arc::clone(node.archiver()));
        let source_entry = source.map(|node| Arc::clone(node.entry()));

        let (entry_name, length, modified) = match &source_entry {
            Some(entry) => (entry.name().to_string(), entry.length(), entry.modified()),
            None if path_str.is_empty() => (String::new(), -1, None),
            None => {
                let (length, modified) = stat(&path);
                (path::file_name(&path_str).to_string(), length, modified)
            },
        };
        let ident = match (&parent, &source_entry) {
            (Some(parent), Some(entry)) if parent.format() != ArchiveFormat::FileSystem => {
                path::join(parent.ident(), &format!("{}.{}", entry.id(), entry_name))
            },
            _ => path_str.clone(),
        };
        let system_path = match &parent {
            Some(parent) => path::join(parent.system_path(), &entry_name),
            None => path_str,
        };

        let meta = Arc::new(ArchiverMeta {
            id: context.next_archiver_id(),
            format: backend.format(),
            path,
            entry_name,
            ident,
            system_path,
            is_root: parent.is_none(),
            formats: Arc::clone(context.formats()),
        });
        tracing::debug!(id = meta.id, format = %meta.format, ident = %meta.ident, "archiver created");

        Arc::new(Self {
            meta,
            backend,
            context: Arc::clone(context),
            parent,
            source: source_entry,
            length,
            modified,
            proxy,
            entries: tokio::sync::Mutex::new(None),
            pre_extractor: PreExtractor::new(),
            activations: AtomicUsize::new(0),
        })
    }

    pub fn meta(&self) -> &Arc<ArchiverMeta> {
        &self.meta
    }

    pub fn id(&self) -> ArchiverId {
        self.meta.id
    }

    pub fn format(&self) -> ArchiveFormat {
        self.meta.format
    }

    pub fn path(&self) -> &Path {
        &self.meta.path
    }

    pub fn entry_name(&self) -> &str {
        &self.meta.entry_name
    }

    /// Unique key among live archivers.
    pub fn ident(&self) -> &str {
        &self.meta.ident
    }

    /// Logical path as a user would type it.
    pub fn system_path(&self) -> &str {
        &self.meta.system_path
    }

    pub fn is_root(&self) -> bool {
        self.meta.is_root
    }

    pub fn is_file_system(&self) -> bool {
        self.meta.format == ArchiveFormat::FileSystem
    }

    pub fn parent(&self) -> Option<&ArchiverHandle> {
        self.parent.as_ref()
    }

    pub fn source(&self) -> Option<&EntryHandle> {
        self.source.as_ref()
    }

    /// Size of the container itself (`-1` for directories).
    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn modified(&self) -> Option<OffsetDateTime> {
        self.modified
    }

    pub fn proxy(&self) -> Option<&Arc<TempFile>> {
        self.proxy.as_ref()
    }

    pub fn context(&self) -> &Arc<ArchiveContext> {
        &self.context
    }

    pub fn pre_extractor(&self) -> &PreExtractor {
        &self.pre_extractor
    }

    /// Outermost archiver of the nesting chain.
    pub fn root(self: &Arc<Self>) -> ArchiverHandle {
        match &self.parent {
            Some(parent) => parent.root(),
            None => Arc::clone(self),
        }
    }

    /// Where this archiver "lives": the path of the outermost container
    /// that isn't a plain directory.
    pub fn place(&self) -> String {
        match &self.parent {
            Some(parent) if !parent.is_file_system() => parent.place(),
            _ => path::from_system(&self.meta.path),
        }
    }

    /// The folder this archiver would be listed in.
    pub fn parent_place(&self) -> String {
        match &self.parent {
            Some(parent) => parent.system_path().to_string(),
            None => path::parent(&self.meta.system_path).to_string(),
        }
    }

    /// Real file on disk this archiver's bytes ultimately come from.
    pub fn source_file_system_path(&self) -> PathBuf {
        match &self.parent {
            Some(parent) if !parent.is_file_system() => parent.source_file_system_path(),
            _ => self.meta.path.clone(),
        }
    }

    /// Every entry, in backend order, with synthesized directories last.
    ///
    /// Listed once and cached until [`clear_entry_cache`](Self::clear_entry_cache).
    pub async fn list_entries(&self, cancel: &CancellationToken) -> Result<Arc<[EntryHandle]>> {
        ensure_active(cancel)?;
        let mut listing = LISTING.try_with(Clone::clone).unwrap_or_default();
        if listing.contains(&self.meta.id) {
            // Waiting for our own lock would never finish.
            exn::bail!(ErrorKind::Cycle(self.meta.ident.clone()));
        }
        listing.push(self.meta.id);
        LISTING.scope(listing, self.load_entries(cancel)).await
    }

    async fn load_entries(&self, cancel: &CancellationToken) -> Result<Arc<[EntryHandle]>> {
        let mut guard = self.entries.lock().await;
        if let Some(entries) = guard.as_ref() {
            return Ok(Arc::clone(entries));
        }
        ensure_active(cancel)?;

        let records = self.backend.list(cancel).await?;
        let total = records.len();
        let mut entries: Vec<EntryHandle> = records
            .into_iter()
            .filter(|record| !self.context.is_excluded(&record.raw_name))
            .map(|record| Arc::new(Entry::new(Arc::clone(&self.meta), record)))
            .collect();
        let excluded = total - entries.len();
        if self.backend.synthesizes_directories() {
            let directories = synthesize_directories(&self.meta, &entries);
            entries.extend(directories);
        }
        tracing::debug!(archiver = %self.meta.ident, count = entries.len(), excluded, "entries listed");

        let entries: Arc<[EntryHandle]> = entries.into();
        *guard = Some(Arc::clone(&entries));
        Ok(entries)
    }

    /// Entries below directory `dir` ("" for the top level).
    pub async fn list_entries_under(
        &self,
        dir: &str,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<EntryHandle>> {
        let dir = path::normalize(dir);
        let entries = self.list_entries(cancel).await?;
        Ok(entries
            .iter()
            .filter(|entry| match path::strip_prefix(entry.name(), &dir) {
                Some(rest) if !rest.is_empty() => recursive || !rest.contains(path::SEPARATOR),
                _ => false,
            })
            .cloned()
            .collect())
    }

    /// Look an entry up by (normalized) name.
    pub async fn find_entry(&self, name: &str, cancel: &CancellationToken) -> Result<Option<EntryHandle>> {
        let name = path::normalize(name);
        let entries = self.list_entries(cancel).await?;
        Ok(entries.iter().find(|entry| entry.name() == name).cloned())
    }

    /// Forget the cached listing. Entries already handed out stay valid.
    pub async fn clear_entry_cache(&self) {
        *self.entries.lock().await = None;
    }

    /// Drop in-memory pre-extracted payloads (files on disk stay).
    /// Returns the bytes released.
    pub async fn clear_raw_data(&self) -> u64 {
        let entries = self.entries.lock().await.clone();
        let Some(entries) = entries else {
            return 0;
        };
        let released: u64 = entries.iter().map(|entry| entry.reset_data()).sum();
        if released > 0 {
            tracing::debug!(archiver = %self.meta.ident, released, "raw data cleared");
        }
        released
    }

    /// Read an entry.
    ///
    /// Waits for pre-extraction if it's running, then serves the
    /// pre-extracted payload if there is one, otherwise decodes directly.
    pub async fn open_stream(self: &Arc<Self>, entry: &Entry, cancel: &CancellationToken) -> Result<EntryStream> {
        self.check_extractable(entry)?;
        self.wait_pre_extract(entry, cancel).await?;
        if let Some(data) = entry.data() {
            return EntryStream::from_data(data).await;
        }
        self.backend.open(entry, cancel).await
    }

    /// Write an entry to a real file.
    pub async fn extract_to_file(
        self: &Arc<Self>,
        entry: &Entry,
        dest: &Path,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.check_extractable(entry)?;
        self.wait_pre_extract(entry, cancel).await?;
        match entry.data() {
            Some(EntryData::File(src)) => {
                check_overwrite(dest, overwrite).await?;
                tokio::fs::copy(&src, dest).await.map_err(|e| ErrorKind::io(e, &src))?;
                Ok(())
            },
            Some(EntryData::Memory(bytes)) => {
                check_overwrite(dest, overwrite).await?;
                Ok(tokio::fs::write(dest, &bytes).await.map_err(|e| ErrorKind::io(e, dest))?)
            },
            None => self.backend.extract(entry, dest, overwrite, cancel).await,
        }
    }

    /// Entry for a real file or directory, named relative to this folder
    /// archiver's root (or by its full path if it isn't below the root).
    pub async fn file_system_entry(&self, real: &Path) -> Result<EntryHandle> {
        if !self.is_file_system() {
            exn::bail!(ErrorKind::Unsupported { format: self.meta.format, operation: "file system entries" });
        }
        let name = match real.strip_prefix(&self.meta.path) {
            Ok(relative) if !self.meta.path.as_os_str().is_empty() => path::from_system(relative),
            _ => path::from_system(real),
        };
        let record = backend::stat_record(0, name, real).await?;
        Ok(Arc::new(Entry::new(Arc::clone(&self.meta), record)))
    }

    /// Real path of an entry, if it has one.
    pub fn file_system_path(&self, entry: &Entry) -> Option<PathBuf> {
        self.backend.file_system_path(entry)
    }

    pub async fn exists(&self, entry: &Entry) -> Result<bool> {
        if !self.owns(entry) || entry.is_deleted() {
            return Ok(false);
        }
        self.backend.exists(entry).await
    }

    pub fn can_delete(&self, entries: &[EntryHandle]) -> bool {
        !entries.is_empty() && entries.iter().all(|entry| self.owns(entry)) && self.backend.can_delete(entries)
    }

    /// Remove entries from the container. The listing is refreshed on next use.
    pub async fn delete(&self, entries: &[EntryHandle]) -> Result<()> {
        if let Some(foreign) = entries.iter().find(|entry| !self.owns(entry)) {
            exn::bail!(ErrorKind::ForeignEntry(foreign.ident()));
        }
        self.clear_entry_cache().await;
        if let Err(err) = self.backend.delete(entries).await {
            // Whatever went before the failure is gone for good.
            for entry in entries {
                if let Ok(false) = self.backend.exists(entry).await {
                    entry.mark_deleted();
                }
            }
            return Err(err);
        }
        for entry in entries {
            entry.mark_deleted();
        }
        tracing::info!(archiver = %self.meta.ident, count = entries.len(), "entries deleted");
        Ok(())
    }

    pub fn can_rename(&self, entry: &Entry) -> bool {
        self.owns(entry) && self.backend.can_rename(entry)
    }

    /// Rename an entry, returning its new raw name.
    pub async fn rename(&self, entry: &Entry, name: &str) -> Result<String> {
        if !self.owns(entry) {
            exn::bail!(ErrorKind::ForeignEntry(entry.ident()));
        }
        self.clear_entry_cache().await;
        let renamed = self.backend.rename(entry, name).await?;
        tracing::info!(archiver = %self.meta.ident, from = %entry.name(), to = %renamed, "entry renamed");
        Ok(renamed)
    }

    /// Someone holds an activation.
    pub fn is_active(&self) -> bool {
        self.activations.load(Ordering::Acquire) > 0
    }

    /// Pre-extraction is allowed (someone activated us) and worth it.
    pub fn can_pre_extract(&self) -> bool {
        self.activations.load(Ordering::Acquire) > 0 && self.backend.supports_pre_extract()
    }

    /// Allow pre-extraction. Calls are counted; every `activate` needs a
    /// matching [`deactivate`](Self::deactivate).
    pub fn activate(&self) {
        if self.activations.fetch_add(1, Ordering::AcqRel) == 0 {
            self.pre_extractor.resume();
        }
    }

    /// Undo one [`activate`](Self::activate). The last one puts the
    /// pre-extractor to sleep, canceling any run in progress.
    pub fn deactivate(&self) {
        match self.activations.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
            Ok(1) => self.pre_extractor.sleep(),
            Ok(_) => {},
            Err(_) => tracing::warn!(archiver = %self.meta.ident, "deactivate without matching activate"),
        }
    }

    /// [`activate`](Self::activate) now, [`deactivate`](Self::deactivate) on drop.
    pub fn activation(self: &Arc<Self>) -> Activation {
        self.activate();
        Activation { archiver: Arc::clone(self) }
    }

    /// Start a pre-extraction run in the background if one is allowed and
    /// none has run yet. Returns `true` if a run was started.
    pub fn start_pre_extract(self: &Arc<Self>) -> bool {
        if !self.can_pre_extract() {
            return false;
        }
        let Some((token, generation)) = self.pre_extractor.try_begin() else {
            return false;
        };
        let archiver = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = archiver.run_pre_extract(&token).await;
            match &outcome {
                Ok(()) => tracing::debug!(archiver = %archiver.ident(), "pre-extract complete"),
                Err(err) if err.is_canceled() => tracing::debug!(archiver = %archiver.ident(), "pre-extract canceled"),
                Err(err) => tracing::warn!(archiver = %archiver.ident(), error = %err, "pre-extract failed"),
            }
            archiver.pre_extractor.finish(generation, &outcome);
        });
        true
    }

    async fn run_pre_extract(&self, token: &CancellationToken) -> Result<()> {
        let directory = self.pre_extractor.directory(self.context.temp())?;
        let entries = self.list_entries(token).await?;
        let targets: Vec<EntryHandle> = entries
            .iter()
            .filter(|entry| entry.id() >= 0 && !entry.is_directory() && !entry.has_data())
            .cloned()
            .collect();
        tracing::debug!(archiver = %self.meta.ident, count = targets.len(), directory = %directory.display(), "pre-extract started");
        let sink = PreExtractSink::new(&directory, self.context.memory().clone(), self.pre_extractor.progress_sender());
        self.backend.pre_extract(&targets, &sink, token).await
    }

    /// Block until `entry` has been pre-extracted, or pre-extraction can no
    /// longer provide it. Only the caller's own cancellation is an error;
    /// everything else means "open it directly".
    async fn wait_pre_extract(self: &Arc<Self>, entry: &Entry, cancel: &CancellationToken) -> Result<()> {
        if !self.can_pre_extract() || entry.has_data() {
            return Ok(());
        }
        let mut state = self.pre_extractor.subscribe();
        let mut progress = self.pre_extractor.subscribe_progress();
        loop {
            if entry.has_data() {
                return Ok(());
            }
            let current = *state.borrow_and_update();
            if current.is_ready() {
                if !self.start_pre_extract() {
                    break;
                }
                continue;
            }
            if current.is_terminal() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => exn::bail!(ErrorKind::Canceled),
                changed = state.changed() => if changed.is_err() { break },
                changed = progress.changed() => if changed.is_err() { break },
            }
        }
        tracing::trace!(entry = %entry.name(), state = %self.pre_extractor.state(), "no pre-extracted payload");
        Ok(())
    }

    fn owns(&self, entry: &Entry) -> bool {
        entry.owner().id == self.meta.id
    }

    fn check_extractable(&self, entry: &Entry) -> Result<()> {
        if !self.owns(entry) {
            exn::bail!(ErrorKind::ForeignEntry(entry.ident()));
        }
        if entry.id() < 0 {
            exn::bail!(ErrorKind::NotExtractable(entry.name().to_string()));
        }
        if entry.is_directory() {
            exn::bail!(ErrorKind::IsDirectory(entry.name().to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for Archiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archiver")
            .field("id", &self.meta.id)
            .field("format", &self.meta.format)
            .field("ident", &self.meta.ident)
            .field("path", &self.meta.path)
            .finish_non_exhaustive()
    }
}

/// Keeps an archiver's pre-extractor awake while held.
pub struct Activation {
    archiver: ArchiverHandle,
}

impl Activation {
    pub fn archiver(&self) -> &ArchiverHandle {
        &self.archiver
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.archiver.deactivate();
    }
}

/// Size and modification time of a real path; directories have length `-1`.
fn stat(path: &Path) -> (i64, Option<OffsetDateTime>) {
    // Sync on purpose: it's one metadata call at construction, and the
    // constructor isn't async.
    match std::fs::metadata(path) {
        Ok(meta) => {
            let length = match meta.is_dir() {
                true => -1,
                false => i64::try_from(meta.len()).unwrap_or(i64::MAX),
            };
            (length, meta.modified().ok().map(OffsetDateTime::from))
        },
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "archiver path not readable");
            (0, None)
        },
    }
}

/// Directory entries for every path prefix that isn't listed itself.
/// Each gets the newest timestamp found below it.
fn synthesize_directories(meta: &Arc<ArchiverMeta>, entries: &[EntryHandle]) -> Vec<EntryHandle> {
    let listed: HashSet<&str> = entries.iter().filter(|e| e.is_directory()).map(|e| e.name()).collect();
    let mut missing: BTreeMap<&str, Option<OffsetDateTime>> = BTreeMap::new();
    for entry in entries {
        let mut dir = path::parent(entry.name());
        while !dir.is_empty() && dir != "/" {
            if !listed.contains(dir) {
                let newest = missing.entry(dir).or_insert(None);
                *newest = (*newest).max(entry.modified());
            }
            dir = path::parent(dir);
        }
    }
    missing
        .into_iter()
        .map(|(name, modified)| {
            let record = EntryRecord::directory(-1, name).with_created(modified).with_modified(modified);
            Arc::new(Entry::new(Arc::clone(meta), record))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FolderBackend, MockBackend};
    use crate::pre_extract::PreExtractState;
    use crate::testing::{shared_context, shared_context_with};
    use std::time::Duration;

    fn names(entries: &[EntryHandle]) -> Vec<String> {
        entries.iter().map(|e| e.name().to_string()).collect()
    }

    #[tokio::test]
    async fn test_listing_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let mock = MockBackend::with_files([("001.jpg", b"a".to_vec()), ("002.jpg", b"b".to_vec())]);
        let lists = mock.list_counter();
        let archiver = Archiver::with_backend(&context, Box::new(mock), "/books/a.zip", None, None);
        let cancel = CancellationToken::new();

        let first = archiver.list_entries(&cancel).await.unwrap();
        let second = archiver.list_entries(&cancel).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(lists.load(Ordering::SeqCst), 1);

        archiver.clear_entry_cache().await;
        archiver.list_entries(&cancel).await.unwrap();
        assert_eq!(lists.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_directories_are_synthesized_after_real_entries() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let mock = MockBackend::with_files([
            ("a/b/1.jpg", b"1".to_vec()),
            ("a/2.jpg", b"2".to_vec()),
            ("c/", Vec::new()),
            ("c/3.jpg", b"3".to_vec()),
        ]);
        let archiver = Archiver::with_backend(&context, Box::new(mock), "/books/a.zip", None, None);
        let entries = archiver.list_entries(&CancellationToken::new()).await.unwrap();

        assert_eq!(names(&entries), ["a/b/1.jpg", "a/2.jpg", "c", "c/3.jpg", "a", "a/b"]);
        let synthesized: Vec<_> = entries.iter().filter(|e| e.id() < 0).collect();
        assert_eq!(synthesized.len(), 2);
        assert!(synthesized.iter().all(|e| e.is_directory() && e.length() == -1));
        // The explicit directory keeps its own id.
        assert_eq!(entries.iter().find(|e| e.name() == "c").unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_excluded_segments_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let mock = MockBackend::with_files([
            ("__MACOSX/._001.jpg", b"x".to_vec()),
            ("sub/.ds_store", b"x".to_vec()),
            ("sub/001.jpg", b"x".to_vec()),
        ]);
        let archiver = Archiver::with_backend(&context, Box::new(mock), "/books/a.zip", None, None);
        let entries = archiver.list_entries(&CancellationToken::new()).await.unwrap();
        assert_eq!(names(&entries), ["sub/001.jpg", "sub"]);
    }

    #[tokio::test]
    async fn test_list_entries_under() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let mock = MockBackend::with_files([
            ("top.jpg", b"x".to_vec()),
            ("sub/1.jpg", b"x".to_vec()),
            ("sub/deep/2.jpg", b"x".to_vec()),
            ("subway.jpg", b"x".to_vec()),
        ]);
        let archiver = Archiver::with_backend(&context, Box::new(mock), "/books/a.zip", None, None);
        let cancel = CancellationToken::new();

        let top = archiver.list_entries_under("", false, &cancel).await.unwrap();
        assert_eq!(names(&top), ["top.jpg", "subway.jpg", "sub"]);
        let sub = archiver.list_entries_under("sub/", false, &cancel).await.unwrap();
        assert_eq!(names(&sub), ["sub/1.jpg", "sub/deep"]);
        let all = archiver.list_entries_under("sub", true, &cancel).await.unwrap();
        assert_eq!(names(&all), ["sub/1.jpg", "sub/deep/2.jpg", "sub/deep"]);
    }

    #[tokio::test]
    async fn test_open_refuses_unopenable_entries() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let mock = MockBackend::with_files([("sub/1.jpg", b"x".to_vec())]);
        let archiver = Archiver::with_backend(&context, Box::new(mock), "/books/a.zip", None, None);
        let other = Archiver::with_backend(
            &context,
            Box::new(MockBackend::with_files([("1.jpg", b"x".to_vec())])),
            "/books/b.zip",
            None,
            None,
        );
        let cancel = CancellationToken::new();
        let entries = archiver.list_entries(&cancel).await.unwrap();
        let synthesized = entries.iter().find(|e| e.name() == "sub").unwrap();

        let err = archiver.open_stream(synthesized, &cancel).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotExtractable(_)));
        let err = other.open_stream(&entries[0], &cancel).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ForeignEntry(_)));

        let data = archiver.open_stream(&entries[0], &cancel).await.unwrap().read_all().await.unwrap();
        assert_eq!(data, b"x");
    }

    #[tokio::test]
    async fn test_nested_identity() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let outer = Archiver::with_backend(
            &context,
            Box::new(MockBackend::with_files([("x.txt", b"x".to_vec()), ("inner.zip", b"zip".to_vec())])),
            "/books/outer.zip",
            None,
            None,
        );
        let entries = outer.list_entries(&CancellationToken::new()).await.unwrap();
        let node = EntryNode::new(Arc::clone(&outer), Arc::clone(&entries[1]));
        let inner = Archiver::with_backend(
            &context,
            Box::new(MockBackend::with_files([("p.png", b"p".to_vec())])),
            "/tmp/quire/x123.zip",
            Some(&node),
            None,
        );

        assert!(outer.is_root());
        assert!(!inner.is_root());
        assert_eq!(outer.ident(), "/books/outer.zip");
        assert_eq!(inner.ident(), "/books/outer.zip/1.inner.zip");
        assert_eq!(inner.system_path(), "/books/outer.zip/inner.zip");
        assert_eq!(inner.place(), "/books/outer.zip");
        assert_eq!(inner.parent_place(), "/books/outer.zip");
        assert_eq!(inner.source_file_system_path(), PathBuf::from("/books/outer.zip"));
        assert!(Arc::ptr_eq(&inner.root(), &outer));
        assert_eq!(inner.length(), 3);

        let page = &inner.list_entries(&CancellationToken::new()).await.unwrap()[0];
        assert_eq!(page.system_path(), "/books/outer.zip/inner.zip/p.png");
        assert_eq!(page.ident(), "/books/outer.zip/1.inner.zip/0.p.png");
    }

    #[tokio::test]
    async fn test_pre_extract_serves_identical_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let files = [("1.png", b"one".to_vec()), ("2.png", b"two".to_vec()), ("d/3.png", b"three".to_vec())];
        let direct = Archiver::with_backend(&context, Box::new(MockBackend::with_files(files.clone())), "/a.7z", None, None);
        let mock = MockBackend::with_files(files).with_solid(true);
        let opens = mock.open_counter();
        let solid = Archiver::with_backend(&context, Box::new(mock), "/b.7z", None, None);
        let cancel = CancellationToken::new();

        let _active = solid.activation();
        let entries = solid.list_entries(&cancel).await.unwrap();
        assert!(solid.can_pre_extract());
        let data = solid.open_stream(&entries[2], &cancel).await.unwrap().read_all().await.unwrap();
        assert_eq!(data, b"three");

        let mut state = solid.pre_extractor().subscribe();
        state.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(solid.pre_extractor().state(), PreExtractState::Done);

        let reference = direct.list_entries(&cancel).await.unwrap();
        for (entry, expected) in entries.iter().zip(reference.iter()).filter(|(e, _)| !e.is_directory()) {
            assert!(entry.has_data(), "{} was not pre-extracted", entry.name());
            let got = solid.open_stream(entry, &cancel).await.unwrap().read_all().await.unwrap();
            let want = direct.open_stream(expected, &cancel).await.unwrap().read_all().await.unwrap();
            assert_eq!(got, want);
        }
        // One bulk pass, no per-entry decodes afterwards.
        assert_eq!(opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pre_extract_spills_to_disk_when_budget_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context_with(dir.path(), |config| config.pre_extract.memory_budget = 8);
        let mock = MockBackend::with_files([("1.png", b"12345".to_vec()), ("2.png", b"67890".to_vec())]).with_solid(true);
        let solid = Archiver::with_backend(&context, Box::new(mock), "/b.7z", None, None);
        let cancel = CancellationToken::new();

        let _active = solid.activation();
        let entries = solid.list_entries(&cancel).await.unwrap();
        solid.open_stream(&entries[1], &cancel).await.unwrap();
        solid.pre_extractor().subscribe().wait_for(|s| s.is_terminal()).await.unwrap();

        assert!(matches!(entries[0].data(), Some(EntryData::Memory(_))));
        let Some(EntryData::File(spilled)) = entries[1].data() else {
            panic!("second entry should have gone to disk");
        };
        assert_eq!(std::fs::read(&spilled).unwrap(), b"67890");
        assert!(spilled.file_name().unwrap().to_str().unwrap().starts_with("000001"));
        assert_eq!(context.memory().used(), 5);

        assert_eq!(solid.clear_raw_data().await, 5);
        assert_eq!(context.memory().used(), 0);
        assert!(!entries[0].has_data());
        // Disk payloads survive and keep serving reads.
        assert!(entries[1].has_data());
        let stream = solid.open_stream(&entries[1], &cancel).await.unwrap();
        assert!(!stream.is_memory());
        assert_eq!(stream.read_all().await.unwrap(), b"67890");
    }

    #[tokio::test]
    async fn test_deactivate_cancels_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let mock = MockBackend::with_files([("1.png", b"one".to_vec()), ("2.png", b"two".to_vec())])
            .with_solid(true)
            .with_delay(Duration::from_millis(200));
        let solid = Archiver::with_backend(&context, Box::new(mock), "/b.7z", None, None);
        let cancel = CancellationToken::new();

        solid.activate();
        let entries = solid.list_entries(&cancel).await.unwrap();
        assert!(solid.start_pre_extract());
        solid.deactivate();
        assert_eq!(solid.pre_extractor().state(), PreExtractState::Sleeping);
        assert!(!solid.can_pre_extract());

        // Sleeping: opens go straight to the backend.
        let data = solid.open_stream(&entries[0], &cancel).await.unwrap().read_all().await.unwrap();
        assert_eq!(data, b"one");
        // Unbalanced deactivate is tolerated.
        solid.deactivate();
    }

    #[tokio::test]
    async fn test_caller_cancellation_while_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let mock = MockBackend::with_files([("1.png", b"one".to_vec())])
            .with_solid(true)
            .with_delay(Duration::from_secs(5));
        let solid = Archiver::with_backend(&context, Box::new(mock), "/b.7z", None, None);
        let _active = solid.activation();
        let entries = solid.list_entries(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = solid.open_stream(&entries[0], &cancel).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_delete_refreshes_listing() {
        let dir = tempfile::tempdir().unwrap();
        let context = shared_context(dir.path());
        let mock = MockBackend::with_files([("1.png", b"one".to_vec()), ("2.png", b"two".to_vec())]);
        let archiver = Archiver::with_backend(&context, Box::new(mock), "/a.zip", None, None);
        let cancel = CancellationToken::new();
        let entries = archiver.list_entries(&cancel).await.unwrap();

        assert!(archiver.can_delete(&entries[..1]));
        archiver.delete(&entries[..1]).await.unwrap();
        assert!(entries[0].is_deleted());
        assert!(!archiver.exists(&entries[0]).await.unwrap());
        assert_eq!(names(&archiver.list_entries(&cancel).await.unwrap()), ["2.png"]);

        let err = archiver.rename(&entries[1], "3.png").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unsupported { operation: "rename", .. }));
    }

    #[tokio::test]
    async fn test_failed_delete_marks_removed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let books = dir.path().join("books");
        std::fs::create_dir(&books).unwrap();
        for name in ["a.png", "b.png", "c.png"] {
            std::fs::write(books.join(name), name).unwrap();
        }
        let context = shared_context(dir.path());
        let archiver = Archiver::with_backend(&context, Box::new(FolderBackend::new(&books)), &books, None, None);
        let cancel = CancellationToken::new();
        let entries = archiver.list_entries(&cancel).await.unwrap();
        // Gone behind our back: removing it fails halfway through the batch.
        std::fs::remove_file(books.join("b.png")).unwrap();

        archiver.delete(&entries).await.unwrap_err();
        assert!(!books.join("a.png").exists());
        assert!(entries[0].is_deleted());
        assert!(entries[1].is_deleted());
        assert!(books.join("c.png").exists());
        assert!(!entries[2].is_deleted());
        assert_eq!(names(&archiver.list_entries(&cancel).await.unwrap()), ["c.png"]);
    }
}
