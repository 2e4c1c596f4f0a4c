//! Formats handled by external plugins.
//!
//! Plugins are legacy, single-threaded and slow. Every call goes through the
//! host's lock, and both listing and extraction run on the blocking pool.

use super::{ArchiveBackend, blocking};
use crate::entry::{Entry, EntryRecord, Instance};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::path;
use crate::stream::EntryStream;
use async_trait::async_trait;
use quire_config::PluginConfig;
use quire_format::ArchiveFormat;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// One item as a plugin reports it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PluginRecord {
    /// Directory part, with either separator.
    pub path: String,
    pub filename: String,
    pub size: u64,
    pub modified: Option<OffsetDateTime>,
    pub is_directory: bool,
    /// Plugin-private locator handed back to [`ArchivePlugin::extract`].
    pub position: usize,
}

impl PluginRecord {
    /// `path` and `filename` joined, without a leading separator.
    pub fn full_name(&self) -> String {
        let dir = self.path.trim_end_matches(['\\', '/']);
        let joined = match dir.is_empty() {
            true => self.filename.clone(),
            false => format!("{dir}\\{}", self.filename),
        };
        joined.trim_start_matches(['\\', '/']).to_string()
    }
}

pub trait ArchivePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn list(&self, archive: &Path) -> Result<Vec<PluginRecord>>;

    fn extract(&self, archive: &Path, position: usize) -> Result<Vec<u8>>;
}

/// Registered plugins plus the lookup table from configuration.
pub struct PluginHost {
    config: PluginConfig,
    plugins: RwLock<HashMap<String, Arc<dyn ArchivePlugin>>>,
    lock: Mutex<()>,
}

impl PluginHost {
    pub fn new(config: PluginConfig) -> Self {
        Self { config, plugins: RwLock::new(HashMap::new()), lock: Mutex::new(()) }
    }

    pub fn register(&self, plugin: Arc<dyn ArchivePlugin>) {
        let name = plugin.name().to_string();
        tracing::debug!(plugin = %name, "plugin registered");
        self.plugins.write().unwrap_or_else(PoisonError::into_inner).insert(name, plugin);
    }

    /// Plugin configured for the extension of `name`, if it's registered.
    pub fn find(&self, name: &str) -> Option<Arc<dyn ArchivePlugin>> {
        let configured = self.config.plugin_for(name)?;
        let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
        plugins.get(&configured.name).cloned()
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ()>> {
        tokio::select! {
            _ = cancel.cancelled() => exn::bail!(ErrorKind::Canceled),
            guard = self.lock.lock() => Ok(guard),
        }
    }
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PluginHost").field("plugins", &plugins.keys().collect::<Vec<_>>()).finish()
    }
}

pub struct PluginBackend {
    path: PathBuf,
    plugin: Arc<dyn ArchivePlugin>,
    host: Arc<PluginHost>,
}

impl PluginBackend {
    pub fn new(path: impl Into<PathBuf>, plugin: Arc<dyn ArchivePlugin>, host: Arc<PluginHost>) -> Self {
        Self { path: path.into(), plugin, host }
    }
}

/// Plugins often report directories as empty files. A zero-size file whose
/// name is the directory of another item is dropped.
fn drop_directory_placeholders(records: Vec<EntryRecord>) -> Vec<EntryRecord> {
    let names: Vec<String> = records.iter().map(|r| path::normalize(&r.raw_name)).collect();
    records
        .into_iter()
        .enumerate()
        .filter(|(i, record)| {
            record.length != 0
                || !names.iter().enumerate().any(|(j, other)| j != *i && path::is_under(other, &names[*i]))
        })
        .map(|(_, record)| record)
        .collect()
}

#[async_trait]
impl ArchiveBackend for PluginBackend {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Plugin
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<EntryRecord>> {
        let _guard = self.host.acquire(cancel).await?;
        let plugin = Arc::clone(&self.plugin);
        let path = self.path.clone();
        let items = blocking(move || plugin.list(&path)).await?;
        ensure_active(cancel)?;

        let records = items
            .iter()
            .enumerate()
            .map(|(id, item)| {
                let record = match item.is_directory {
                    true => EntryRecord::directory(id as i64, item.full_name()),
                    false => EntryRecord::file(id as i64, item.full_name(), item.size),
                };
                record.with_modified(item.modified).with_instance(Instance::Index(item.position))
            })
            .collect();
        Ok(drop_directory_placeholders(records))
    }

    async fn open(&self, entry: &Entry, cancel: &CancellationToken) -> Result<EntryStream> {
        let Instance::Index(position) = *entry.instance() else {
            exn::bail!(ErrorKind::NotExtractable(entry.name().to_string()));
        };
        let _guard = self.host.acquire(cancel).await?;
        let plugin = Arc::clone(&self.plugin);
        let path = self.path.clone();
        let bytes = blocking(move || plugin.extract(&path, position)).await?;
        Ok(EntryStream::memory(bytes))
    }
}
