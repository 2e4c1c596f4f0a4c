use crate::archiver::ArchiverHandle;
use crate::entry::EntryHandle;
use crate::error::Result;
use crate::path;
use crate::stream::EntryStream;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// An entry together with the archiver that listed it.
///
/// Holding a node keeps that archiver (and through it every archiver it was
/// nested in) alive. Nodes produced while recursing into a nested archive or
/// playlist remember the node they were reached through, so the full logical
/// path survives even when the inner archiver's own path doesn't say much.
#[derive(Clone)]
pub struct EntryNode {
    archiver: ArchiverHandle,
    entry: EntryHandle,
    parent: Option<Arc<EntryNode>>,
}

impl EntryNode {
    pub fn new(archiver: ArchiverHandle, entry: EntryHandle) -> Self {
        Self { archiver, entry, parent: None }
    }

    pub fn with_parent(mut self, parent: Arc<EntryNode>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn archiver(&self) -> &ArchiverHandle {
        &self.archiver
    }

    pub fn entry(&self) -> &EntryHandle {
        &self.entry
    }

    pub fn parent(&self) -> Option<&Arc<EntryNode>> {
        self.parent.as_ref()
    }

    /// Logical path through every parent node.
    pub fn full_path(&self) -> String {
        match &self.parent {
            Some(parent) => path::join(&parent.full_path(), self.entry.name()),
            None => self.entry.system_path(),
        }
    }

    pub async fn open(&self, cancel: &CancellationToken) -> Result<EntryStream> {
        self.archiver.open_stream(&self.entry, cancel).await
    }

    pub async fn extract_to_file(&self, dest: &Path, overwrite: bool, cancel: &CancellationToken) -> Result<()> {
        self.archiver.extract_to_file(&self.entry, dest, overwrite, cancel).await
    }
}

impl fmt::Debug for EntryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryNode")
            .field("archiver", &self.archiver.ident())
            .field("entry", &self.entry.name())
            .field("parent", &self.parent.as_ref().map(|p| p.full_path()))
            .finish()
    }
}

/// Turns a virtual path into a live node. Implemented by whatever owns the
/// archiver registry; playlists use it to follow their items.
#[async_trait]
pub trait EntryResolver: Send + Sync {
    async fn resolve(&self, path: &str, cancel: &CancellationToken) -> Result<EntryNode>;
}
