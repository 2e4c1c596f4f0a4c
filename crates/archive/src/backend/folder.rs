//! Plain directories on disk.

use super::{ArchiveBackend, check_overwrite};
use crate::entry::{Entry, EntryHandle, EntryRecord, Instance};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::path;
use crate::stream::EntryStream;
use async_trait::async_trait;
use quire_format::ArchiveFormat;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio_util::sync::CancellationToken;

/// Lists one directory level; subdirectories are entries, never recursed.
///
/// A backend with an empty root lists nothing. It exists to hand out entries
/// for arbitrary real paths (see [`Archiver::file_system_entry`](crate::Archiver::file_system_entry)).
#[derive(Clone, Debug)]
pub struct FolderBackend {
    root: PathBuf,
}

impl FolderBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn real_path(&self, entry: &Entry) -> PathBuf {
        match entry.instance() {
            Instance::Path(path) => path.clone(),
            _ => self.root.join(entry.raw_name()),
        }
    }
}

/// Describe a real file or directory as entry `id` called `name`.
pub(crate) async fn stat_record(id: i64, name: String, real: &Path) -> Result<EntryRecord> {
    let meta = fs::metadata(real).await.map_err(|e| ErrorKind::io(e, real))?;
    Ok(record_from_metadata(id, name, real, &meta))
}

fn record_from_metadata(id: i64, name: String, real: &Path, meta: &Metadata) -> EntryRecord {
    let record = match meta.is_dir() {
        true => EntryRecord::directory(id, name),
        false => EntryRecord::file(id, name, meta.len()),
    };
    record
        .with_created(meta.created().ok().map(OffsetDateTime::from))
        .with_modified(meta.modified().ok().map(OffsetDateTime::from))
        .with_instance(Instance::Path(real.to_path_buf()))
}

#[async_trait]
impl ArchiveBackend for FolderBackend {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::FileSystem
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<EntryRecord>> {
        if self.root.as_os_str().is_empty() {
            return Ok(Vec::new());
        }
        let mut dir = fs::read_dir(&self.root).await.map_err(|e| ErrorKind::io(e, &self.root))?;
        let mut found = Vec::new();
        while let Some(item) = dir.next_entry().await.map_err(|e| ErrorKind::io(e, &self.root))? {
            ensure_active(cancel)?;
            let real = item.path();
            // Follows symlinks; a dangling one is skipped rather than failing the listing.
            let meta = match fs::metadata(&real).await {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::debug!(path = %real.display(), error = %err, "skipping unreadable directory item");
                    continue;
                },
            };
            found.push((item.file_name().to_string_lossy().into_owned(), real, meta));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(found
            .into_iter()
            .enumerate()
            .map(|(id, (name, real, meta))| record_from_metadata(id as i64, name, &real, &meta))
            .collect())
    }

    async fn open(&self, entry: &Entry, _cancel: &CancellationToken) -> Result<EntryStream> {
        EntryStream::file(&self.real_path(entry)).await
    }

    async fn extract(&self, entry: &Entry, dest: &Path, overwrite: bool, _cancel: &CancellationToken) -> Result<()> {
        check_overwrite(dest, overwrite).await?;
        let src = self.real_path(entry);
        fs::copy(&src, dest).await.map_err(|e| ErrorKind::io(e, &src))?;
        Ok(())
    }

    fn synthesizes_directories(&self) -> bool {
        false
    }

    fn file_system_path(&self, entry: &Entry) -> Option<PathBuf> {
        Some(self.real_path(entry))
    }

    async fn exists(&self, entry: &Entry) -> Result<bool> {
        let real = self.real_path(entry);
        Ok(!entry.is_deleted() && fs::try_exists(&real).await.map_err(|e| ErrorKind::io(e, &real))?)
    }

    fn can_delete(&self, _entries: &[EntryHandle]) -> bool {
        true
    }

    async fn delete(&self, entries: &[EntryHandle]) -> Result<()> {
        for entry in entries {
            let real = self.real_path(entry);
            let result = match entry.is_directory() {
                true => fs::remove_dir_all(&real).await,
                false => fs::remove_file(&real).await,
            };
            result.map_err(|e| ErrorKind::io(e, &real))?;
            tracing::debug!(path = %real.display(), "removed");
        }
        Ok(())
    }

    fn can_rename(&self, _entry: &Entry) -> bool {
        true
    }

    async fn rename(&self, entry: &Entry, name: &str) -> Result<String> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            exn::bail!(ErrorKind::Backend(format!("invalid file name: {name}")));
        }
        let src = self.real_path(entry);
        let dest = src.with_file_name(name);
        if fs::try_exists(&dest).await.map_err(|e| ErrorKind::io(e, &dest))? {
            exn::bail!(ErrorKind::AlreadyExists(dest));
        }
        fs::rename(&src, &dest).await.map_err(|e| ErrorKind::io(e, &src))?;
        let parent = path::parent(entry.raw_name());
        Ok(path::join(parent, name))
    }
}
