//! A single audio or video file presented as a one-entry container.

use super::{ArchiveBackend, check_overwrite};
use crate::entry::{Entry, EntryRecord, Instance};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::path;
use crate::stream::EntryStream;
use async_trait::async_trait;
use quire_format::ArchiveFormat;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct MediaBackend {
    path: PathBuf,
    name: String,
}

impl MediaBackend {
    /// `name` is what the file is called where it was found; it becomes the
    /// name of the only entry.
    pub fn new(path: impl Into<PathBuf>, name: &str) -> Self {
        Self { path: path.into(), name: path::file_name(name).to_string() }
    }
}

#[async_trait]
impl ArchiveBackend for MediaBackend {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Media
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<EntryRecord>> {
        ensure_active(cancel)?;
        let meta = tokio::fs::metadata(&self.path).await.map_err(|e| ErrorKind::io(e, &self.path))?;
        let record = EntryRecord::file(0, self.name.clone(), meta.len())
            .with_created(meta.created().ok().map(OffsetDateTime::from))
            .with_modified(meta.modified().ok().map(OffsetDateTime::from))
            .with_instance(Instance::Path(self.path.clone()));
        Ok(vec![record])
    }

    async fn open(&self, _entry: &Entry, cancel: &CancellationToken) -> Result<EntryStream> {
        ensure_active(cancel)?;
        EntryStream::file(&self.path).await
    }

    async fn extract(&self, _entry: &Entry, dest: &Path, overwrite: bool, _cancel: &CancellationToken) -> Result<()> {
        check_overwrite(dest, overwrite).await?;
        tokio::fs::copy(&self.path, dest).await.map_err(|e| ErrorKind::io(e, &self.path))?;
        Ok(())
    }

    fn synthesizes_directories(&self) -> bool {
        false
    }

    fn file_system_path(&self, _entry: &Entry) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}
