//! Playlists: a list of paths pointing anywhere in the virtual tree.
//!
//! ```json
//! { "items": [ { "path": "/books/a.zip/001.png", "name": "cover" }, { "path": "/books/b.cbz" } ] }
//! ```
//!
//! Each item is resolved through an [`EntryResolver`] while listing; items
//! that no longer resolve are skipped.

use super::ArchiveBackend;
use crate::entry::{Entry, EntryRecord, Instance};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::formats::FormatTable;
use crate::node::{EntryNode, EntryResolver};
use crate::path;
use crate::stream::EntryStream;
use async_trait::async_trait;
use quire_format::ArchiveFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    #[serde(default)]
    pub items: Vec<PlaylistItem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub path: String,
    /// Display name; defaults to the last segment of `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PlaylistItem {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| path::file_name(&self.path))
    }
}

impl Playlist {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| ErrorKind::io(e, path))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| exn::Exn::from(ErrorKind::Backend(format!("invalid playlist {}: {e}", path.display()))))
    }
}

pub struct PlaylistBackend {
    path: PathBuf,
    resolver: Arc<dyn EntryResolver>,
    formats: Arc<FormatTable>,
}

impl PlaylistBackend {
    pub fn new(path: impl Into<PathBuf>, resolver: Arc<dyn EntryResolver>, formats: Arc<FormatTable>) -> Self {
        Self { path: path.into(), resolver, formats }
    }

    /// Media books are sometimes saved as `/x/clip.mp4/clip.mp4`. If that
    /// doesn't exist but its parent is media, point at the parent.
    async fn target_path(&self, item: &PlaylistItem) -> String {
        let target = path::normalize(&item.path);
        if self.formats.detect_container(&target, true) != Some(ArchiveFormat::Media) {
            return target;
        }
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return target;
        }
        let parent = path::parent(&target);
        match self.formats.detect_container(parent, true) {
            Some(ArchiveFormat::Media) => parent.to_string(),
            _ => target,
        }
    }

    fn link_of(entry: &Entry) -> Result<&EntryNode> {
        match entry.instance() {
            Instance::Link(node) => Ok(node),
            _ => exn::bail!(ErrorKind::NotExtractable(entry.name().to_string())),
        }
    }
}

impl fmt::Debug for PlaylistBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaylistBackend").field("path", &self.path).finish_non_exhaustive()
    }
}

#[async_trait]
impl ArchiveBackend for PlaylistBackend {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Playlist
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<EntryRecord>> {
        ensure_active(cancel)?;
        let playlist = Playlist::load(&self.path).await?;
        let mut records = Vec::with_capacity(playlist.items.len());
        for item in &playlist.items {
            ensure_active(cancel)?;
            let target = self.target_path(item).await;
            let node = match self.resolver.resolve(&target, cancel).await {
                Ok(node) => node,
                Err(err) if err.is_canceled() => return Err(err),
                Err(err) => {
                    tracing::warn!(playlist = %self.path.display(), item = %target, error = %err, "skipping playlist item");
                    continue;
                },
            };
            let inner = node.entry();
            let id = records.len() as i64;
            let record = EntryRecord {
                id,
                raw_name: item.name().to_string(),
                length: inner.length(),
                created: inner.created(),
                modified: inner.modified(),
                link: Some(target),
                instance: Instance::Link(node.clone()),
            };
            records.push(record);
        }
        Ok(records)
    }

    async fn open(&self, entry: &Entry, cancel: &CancellationToken) -> Result<EntryStream> {
        Self::link_of(entry)?.open(cancel).await
    }

    async fn extract(&self, entry: &Entry, dest: &Path, overwrite: bool, cancel: &CancellationToken) -> Result<()> {
        Self::link_of(entry)?.extract_to_file(dest, overwrite, cancel).await
    }

    fn synthesizes_directories(&self) -> bool {
        false
    }

    fn file_system_path(&self, entry: &Entry) -> Option<PathBuf> {
        let node = Self::link_of(entry).ok()?;
        node.archiver().file_system_path(node.entry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let json = r#"{ "items": [ { "path": "/a/b.zip/001.png", "name": "cover" }, { "path": "/a/c.cbz" } ] }"#;
        let playlist: Playlist = serde_json::from_str(json).unwrap();
        assert_eq!(playlist.items.len(), 2);
        assert_eq!(playlist.items[0].name(), "cover");
        assert_eq!(playlist.items[1].name(), "c.cbz");
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.qpls");
        std::fs::write(&path, b"not json").unwrap();
        let err = Playlist::load(&path).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Backend(_)));
    }
}
