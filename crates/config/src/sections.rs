use quire_format::{ArchiveFormat, Extensions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How names inside ZIP archives are decoded when the UTF-8 flag is absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZipEncoding {
    /// Inspect the central directory; use UTF-8 if every name decodes.
    #[default]
    Auto,
    /// Always decode names as UTF-8.
    Utf8,
    /// Always use the legacy code page (IBM437).
    Local,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZipConfig {
    pub enabled: bool,
    pub extensions: Extensions,
    pub encoding: ZipEncoding,
    /// Allow entries to be removed from root archives on disk.
    pub allow_delete: bool,
}
impl Default for ZipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extensions: ArchiveFormat::Zip.default_extensions(),
            encoding: ZipEncoding::Auto,
            allow_delete: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SevenZipConfig {
    pub enabled: bool,
    pub extensions: Extensions,
    /// Bulk-decode solid archives instead of opening entries one at a time.
    pub pre_extract: bool,
}
impl Default for SevenZipConfig {
    fn default() -> Self {
        Self { enabled: true, extensions: ArchiveFormat::SevenZip.default_extensions(), pre_extract: true }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfConfig {
    pub enabled: bool,
    pub extensions: Extensions,
}
impl Default for PdfConfig {
    fn default() -> Self {
        Self { enabled: true, extensions: ArchiveFormat::Pdf.default_extensions() }
    }
}

/// Single audio/video files opened as one-entry books.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub enabled: bool,
    pub extensions: Extensions,
}
impl Default for MediaConfig {
    fn default() -> Self {
        Self { enabled: true, extensions: ArchiveFormat::Media.default_extensions() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistConfig {
    pub extensions: Extensions,
}
impl Default for PlaylistConfig {
    fn default() -> Self {
        Self { extensions: ArchiveFormat::Playlist.default_extensions() }
    }
}

/// One entry of the legacy plugin lookup table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    pub extensions: Extensions,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub enabled: bool,
    /// Try plugins before the built-in formats.
    pub first: bool,
    pub plugins: Vec<PluginSpec>,
}
impl PluginConfig {
    /// Union of every enabled plugin's extensions.
    pub fn extensions(&self) -> Extensions {
        self.plugins.iter().filter(|p| p.enabled).flat_map(|p| p.extensions.iter()).collect()
    }

    /// First enabled plugin that claims the extension of `name`.
    pub fn plugin_for(&self, name: &str) -> Option<&PluginSpec> {
        self.plugins.iter().find(|p| p.enabled && p.extensions.matches(name))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreExtractConfig {
    /// Bytes of decoded entries allowed in memory before spilling to disk.
    pub memory_budget: u64,
    /// Releasing a single payload at least this large asks for a reclaim pass.
    pub large_release: u64,
}
impl Default for PreExtractConfig {
    fn default() -> Self {
        Self { memory_budget: 100 * 1024 * 1024, large_release: 32 * 1024 * 1024 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempConfig {
    /// Every temp file and directory lives somewhere under here.
    pub root: PathBuf,
}
impl Default for TempConfig {
    fn default() -> Self {
        Self { root: std::env::temp_dir().join("quire") }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Dead weak references are swept once this many keys are held.
    pub compaction_threshold: usize,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self { compaction_threshold: 50 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long a finished, orphaned extraction waits to be re-claimed.
    pub orphan_grace_ms: u64,
    /// Materialized temp files kept for reuse.
    pub temp_cache_capacity: usize,
}
impl BrokerConfig {
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_millis(self.orphan_grace_ms)
    }
}
impl Default for BrokerConfig {
    fn default() -> Self {
        Self { orphan_grace_ms: 1000, temp_cache_capacity: 32 }
    }
}
