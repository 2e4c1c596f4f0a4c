use crate::entry::EntryData;
use crate::error::{ErrorKind, Result};
use pin_project_lite::pin_project;
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

pin_project! {
    /// Readable payload of an entry: either bytes already in memory or a
    /// file on disk.
    #[project = EntryStreamProj]
    pub enum EntryStream {
        Memory { #[pin] inner: Cursor<Arc<[u8]>> },
        File { #[pin] inner: tokio::fs::File },
    }
}

impl EntryStream {
    pub fn memory(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Memory { inner: Cursor::new(bytes.into()) }
    }

    pub async fn file(path: &Path) -> Result<Self> {
        let inner = tokio::fs::File::open(path).await.map_err(|e| ErrorKind::io(e, path))?;
        Ok(Self::File { inner })
    }

    pub(crate) async fn from_data(data: EntryData) -> Result<Self> {
        match data {
            EntryData::Memory(bytes) => Ok(Self::memory(bytes)),
            EntryData::File(path) => Self::file(&path).await,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory { .. })
    }

    /// Drain the stream into a buffer.
    pub async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf).await.map_err(ErrorKind::Io)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for EntryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory { inner } => f.debug_struct("Memory").field("len", &inner.get_ref().len()).finish(),
            Self::File { .. } => f.write_str("File"),
        }
    }
}

impl AsyncRead for EntryStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            EntryStreamProj::Memory { inner } => inner.poll_read(cx, buf),
            EntryStreamProj::File { inner } => inner.poll_read(cx, buf),
        }
    }
}
