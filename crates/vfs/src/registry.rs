//! The archiver registry.
//!
//! Owns every shared service of one session: the archive context, the
//! weak archiver cache and the extraction broker. Builds archivers on
//! demand and resolves virtual paths that cross container boundaries.

use crate::broker::Broker;
use crate::cache::ArchiverCache;
use crate::error::{ErrorKind, Result, ensure_active};
use async_trait::async_trait;
use quire_archive::backend::FolderBackend;
use quire_archive::error::Result as ArchiveResult;
use quire_archive::path;
use quire_archive::{ArchiveContext, ArchiveFormat, Archiver, ArchiverHandle, EntryNode, EntryResolver, Instance};
use quire_format::extension_of;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

pub struct Registry {
    this: Weak<Registry>,
    context: Arc<ArchiveContext>,
    cache: ArchiverCache,
    broker: Arc<Broker>,
    // Rootless folder archiver that owns entries made for arbitrary real paths.
    folders: ArchiverHandle,
    reclaiming: AtomicBool,
}

impl Registry {
    pub fn new(context: Arc<ArchiveContext>) -> Arc<Self> {
        let cache = ArchiverCache::new(context.config().cache.compaction_threshold);
        let broker = Broker::new(Arc::clone(&context));
        let folders = Archiver::with_backend(&context, Box::new(FolderBackend::new("")), "", None, None);
        let registry = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            context,
            cache,
            broker,
            folders,
            reclaiming: AtomicBool::new(false),
        });
        let this = Arc::downgrade(&registry);
        registry.context.memory().set_reclaim(move |released| {
            if let Some(registry) = this.upgrade() {
                registry.reclaim(released);
            }
        });
        registry
    }

    /// Runs after a large pre-extracted payload is released: drops dead
    /// cache keys and clears the in-memory payloads of archivers nobody has
    /// activated. One pass at a time.
    fn reclaim(&self, released: u64) {
        if self.reclaiming.swap(true, Ordering::AcqRel) {
            return;
        }
        let compacted = self.cache.compact();
        let idle: Vec<_> = self.cache.live().into_iter().filter(|archiver| !archiver.is_active()).collect();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(released, compacted, "no runtime to clear idle archivers on");
            self.reclaiming.store(false, Ordering::Release);
            return;
        };
        let this = self.this.clone();
        runtime.spawn(async move {
            let mut freed = 0;
            for archiver in &idle {
                freed += archiver.clear_raw_data().await;
            }
            tracing::debug!(released, compacted, archivers = idle.len(), freed, "reclaim pass finished");
            drop(idle);
            if let Some(registry) = this.upgrade() {
                registry.reclaiming.store(false, Ordering::Release);
            }
        });
    }

    pub fn context(&self) -> &Arc<ArchiveContext> {
        &self.context
    }

    pub fn cache(&self) -> &ArchiverCache {
        &self.cache
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// The format that would open `name`, trying enabled formats in order.
    pub fn detect_format(&self, name: &str) -> Option<ArchiveFormat> {
        self.context.detect(name, true)
    }

    fn resolver(&self) -> Option<Arc<dyn EntryResolver>> {
        self.this.upgrade().map(|registry| registry as Arc<dyn EntryResolver>)
    }

    /// Archiver over the container `node` points at.
    ///
    /// A live archiver built from the same source is reused as long as the
    /// source's length and modification time haven't changed. Links are
    /// followed to their target first.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %node.entry().system_path()))]
    pub async fn get_or_create(
        &self,
        node: &EntryNode,
        ignore_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<ArchiverHandle> {
        ensure_active(cancel)?;
        let mut node = node;
        while let Instance::Link(target) = node.entry().instance() {
            node = target;
        }
        let entry = node.entry();
        let key = entry.system_path();

        if !ignore_cache && let Some(cached) = self.cache.get(&key) {
            if cached.length() == entry.length() && cached.modified() == entry.modified() {
                tracing::trace!(id = cached.id(), "archiver cache hit");
                return Ok(cached);
            }
            tracing::debug!(id = cached.id(), "cached archiver is stale");
        }

        let archiver = self.create(node, cancel).await?;
        self.cache.insert(key, &archiver);
        Ok(archiver)
    }

    async fn create(&self, node: &EntryNode, cancel: &CancellationToken) -> Result<ArchiverHandle> {
        let entry = node.entry();
        let unsupported = || exn::Exn::from(ErrorKind::NotSupported(extension_of(entry.name()).unwrap_or_default()));

        if entry.is_file_system() {
            let real = node
                .archiver()
                .file_system_path(entry)
                .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(entry.system_path())))?;
            let format = match entry.is_directory() {
                true => ArchiveFormat::FileSystem,
                false => self.detect_format(entry.name()).ok_or_else(unsupported)?,
            };
            return Archiver::open(&self.context, format, real, None, None, self.resolver()).map_err(ErrorKind::archive);
        }

        if entry.is_directory() {
            exn::bail!(ErrorKind::NotSupported(entry.name().to_string()));
        }
        let format = self.detect_format(entry.name()).ok_or_else(unsupported)?;
        let proxy = self.broker.extract(node, cancel).await?;
        let path = proxy.path().to_path_buf();
        Archiver::open(&self.context, format, path, Some(node), Some(proxy), self.resolver()).map_err(ErrorKind::archive)
    }

    /// Node for a real file or directory.
    pub async fn file_system_node(&self, real: &Path) -> Result<EntryNode> {
        let entry = self.folders.file_system_entry(real).await.map_err(ErrorKind::archive)?;
        Ok(EntryNode::new(Arc::clone(&self.folders), entry))
    }

    /// Longest prefix of `path` that exists on disk.
    pub async fn existing_prefix(&self, path: &str) -> Option<String> {
        let path = path::normalize(path);
        let mut found = None;
        for prefix in path::prefixes(&path) {
            match tokio::fs::try_exists(prefix).await {
                Ok(true) => found = Some(prefix.to_string()),
                _ => break,
            }
        }
        found
    }

    /// Turn a virtual path into a node.
    ///
    /// Real paths resolve directly. Otherwise the innermost real file on the
    /// path is opened and the rest is looked up inside it, descending into
    /// nested containers as needed.
    #[tracing::instrument(level = "debug", skip(self, cancel))]
    pub async fn resolve(&self, path: &str, cancel: &CancellationToken) -> Result<EntryNode> {
        ensure_active(cancel)?;
        let requested = path::normalize(path);
        let not_found = || exn::Exn::from(ErrorKind::NotFound(requested.clone()));

        let Some(prefix) = self.existing_prefix(&requested).await else {
            return Err(not_found());
        };
        if prefix == requested {
            return self.file_system_node(Path::new(&prefix)).await;
        }
        // Below a real directory, a missing name is simply missing.
        if !tokio::fs::metadata(&prefix).await.is_ok_and(|meta| meta.is_file()) {
            return Err(not_found());
        }

        let mut node = self.file_system_node(Path::new(&prefix)).await?;
        let mut rest = path::strip_prefix(&requested, &prefix).unwrap_or_default().to_string();
        loop {
            let archiver = self.get_or_create(&node, false, cancel).await?;
            let entries = archiver.list_entries(cancel).await.map_err(ErrorKind::archive)?;
            if let Some(entry) = entries.iter().find(|e| e.name() == rest) {
                return Ok(EntryNode::new(archiver, Arc::clone(entry)));
            }

            let next = path::prefixes(&rest).find_map(|prefix| {
                let entry = entries.iter().find(|e| e.name() == prefix && e.is_archive())?;
                let remaining = path::strip_prefix(&rest, prefix)?;
                Some((Arc::clone(entry), remaining.to_string()))
            });
            let Some((entry, remaining)) = next else {
                return Err(not_found());
            };
            tracing::trace!(container = %entry.name(), rest = %remaining, "descending");
            node = EntryNode::new(archiver, entry);
            rest = remaining;
        }
    }

    /// Drop dead cache keys.
    pub fn compact(&self) -> usize {
        self.cache.compact()
    }
}

#[async_trait]
impl EntryResolver for Registry {
    async fn resolve(&self, path: &str, cancel: &CancellationToken) -> ArchiveResult<EntryNode> {
        Registry::resolve(self, path, cancel).await.map_err(ErrorKind::into_archive)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("context", &self.context)
            .field("cache", &self.cache.len())
            .field("broker", &self.broker)
            .finish()
    }
}
