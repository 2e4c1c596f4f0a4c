use crate::backend::{PdfRenderer, PluginHost};
use crate::error::Result;
use crate::formats::FormatTable;
use crate::memory::MemoryBudget;
use crate::path;
use crate::temp::TempRoot;
use quire_config::Config;
use quire_format::ArchiveFormat;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Services shared by every archiver: configuration, format detection, the
/// memory budget, the temp root and the optional external collaborators.
pub struct ArchiveContext {
    config: Config,
    formats: Arc<FormatTable>,
    memory: MemoryBudget,
    temp: TempRoot,
    excludes: Vec<String>,
    pdf: Option<Arc<dyn PdfRenderer>>,
    plugins: Option<Arc<PluginHost>>,
    next_id: AtomicU64,
}

impl ArchiveContext {
    /// Creates the temp root if it doesn't exist yet.
    pub fn new(config: &Config) -> Result<Self> {
        let temp = TempRoot::new(&config.temp.root)?;
        Ok(Self {
            config: config.clone(),
            formats: Arc::new(FormatTable::new(config, false, false)),
            memory: MemoryBudget::with_large_release(config.pre_extract.memory_budget, config.pre_extract.large_release),
            temp,
            excludes: config.excludes.iter().map(|e| e.to_lowercase()).collect(),
            pdf: None,
            plugins: None,
            next_id: AtomicU64::new(1),
        })
    }

    /// Enable PDF books.
    pub fn with_pdf_renderer(mut self, renderer: Arc<dyn PdfRenderer>) -> Self {
        self.pdf = Some(renderer);
        self.rebuild_formats();
        self
    }

    /// Enable plugin-handled formats.
    pub fn with_plugin_host(mut self, host: Arc<PluginHost>) -> Self {
        self.plugins = Some(host);
        self.rebuild_formats();
        self
    }

    fn rebuild_formats(&mut self) {
        self.formats = Arc::new(FormatTable::new(&self.config, self.pdf.is_some(), self.plugins.is_some()));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn formats(&self) -> &Arc<FormatTable> {
        &self.formats
    }

    pub fn memory(&self) -> &MemoryBudget {
        &self.memory
    }

    pub fn temp(&self) -> &TempRoot {
        &self.temp
    }

    pub fn pdf_renderer(&self) -> Option<&Arc<dyn PdfRenderer>> {
        self.pdf.as_ref()
    }

    pub fn plugin_host(&self) -> Option<&Arc<PluginHost>> {
        self.plugins.as_ref()
    }

    pub fn detect(&self, name: &str, allow_media: bool) -> Option<ArchiveFormat> {
        self.formats.detect(name, allow_media)
    }

    /// Any path segment matches an exclusion, ignoring case.
    pub fn is_excluded(&self, name: &str) -> bool {
        !self.excludes.is_empty()
            && path::split(&path::normalize(name)).any(|segment| {
                let segment = segment.to_lowercase();
                self.excludes.iter().any(|e| *e == segment)
            })
    }

    pub(crate) fn next_archiver_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for ArchiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveContext")
            .field("formats", &self.formats)
            .field("memory", &self.memory)
            .field("temp", &self.temp)
            .field("pdf", &self.pdf.is_some())
            .field("plugins", &self.plugins.is_some())
            .finish_non_exhaustive()
    }
}
