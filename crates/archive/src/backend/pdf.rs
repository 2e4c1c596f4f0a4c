//! PDF documents, one entry per page.
//!
//! Rasterizing is left to a [`PdfRenderer`] supplied by the application; the
//! archive layer only turns its answers into entries.

use super::{ArchiveBackend, blocking};
use crate::entry::{Entry, EntryRecord, Instance};
use crate::error::{ErrorKind, Result, ensure_active};
use crate::stream::EntryStream;
use async_trait::async_trait;
use quire_format::ArchiveFormat;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Document facts reported by a renderer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PdfInfo {
    pub pages: u32,
    pub created: Option<OffsetDateTime>,
    pub modified: Option<OffsetDateTime>,
}

/// Rasterizes PDF pages. Called from the blocking pool, so implementations
/// may block freely.
pub trait PdfRenderer: Send + Sync {
    fn info(&self, path: &Path) -> Result<PdfInfo>;

    /// Render 1-based `page` as an encoded PNG.
    fn render_page(&self, path: &Path, page: u32) -> Result<Vec<u8>>;
}

pub struct PdfBackend {
    path: PathBuf,
    renderer: Arc<dyn PdfRenderer>,
}

impl PdfBackend {
    pub fn new(path: impl Into<PathBuf>, renderer: Arc<dyn PdfRenderer>) -> Self {
        Self { path: path.into(), renderer }
    }
}

impl fmt::Debug for PdfBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfBackend").field("path", &self.path).finish_non_exhaustive()
    }
}

/// `001.png`, `002.png`, ...
fn page_name(page: u32) -> String {
    format!("{page:03}.png")
}

#[async_trait]
impl ArchiveBackend for PdfBackend {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Pdf
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<EntryRecord>> {
        ensure_active(cancel)?;
        let path = self.path.clone();
        let renderer = Arc::clone(&self.renderer);
        let info = blocking(move || renderer.info(&path)).await?;
        ensure_active(cancel)?;
        Ok((1..=info.pages)
            .map(|page| {
                // Size isn't known until rendered.
                EntryRecord::file(i64::from(page - 1), page_name(page), 0)
                    .with_created(info.created)
                    .with_modified(info.modified)
                    .with_instance(Instance::Page(page))
            })
            .collect())
    }

    async fn open(&self, entry: &Entry, cancel: &CancellationToken) -> Result<EntryStream> {
        ensure_active(cancel)?;
        let Instance::Page(page) = *entry.instance() else {
            exn::bail!(ErrorKind::NotExtractable(entry.name().to_string()));
        };
        let path = self.path.clone();
        let renderer = Arc::clone(&self.renderer);
        let png = blocking(move || renderer.render_page(&path, page)).await?;
        Ok(EntryStream::memory(png))
    }
}
