//! Configuration loading and validation.
//!
//! Values are layered with [`figment`]: built-in defaults, then an optional
//! file (TOML, YAML or JSON by extension), then `QUIRE_`-prefixed environment
//! variables. Nested keys are separated by a double underscore, so
//! `QUIRE_ZIP__ENCODING=utf8` sets `zip.encoding`.

pub mod error;
mod sections;

pub use crate::sections::{
    BrokerConfig, CacheConfig, MediaConfig, PdfConfig, PlaylistConfig, PluginConfig, PluginSpec, PreExtractConfig,
    SevenZipConfig, TempConfig, ZipConfig, ZipEncoding,
};
use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use quire_format::{DEFAULT_IMAGE_EXTENSIONS, Extensions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "QUIRE_";

/// Everything the archive layer can be told.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path segment names never shown in listings (case-insensitive).
    pub excludes: Vec<String>,
    /// Extensions that count as images (pages).
    pub images: Extensions,
    pub zip: ZipConfig,
    pub sevenzip: SevenZipConfig,
    pub pdf: PdfConfig,
    pub media: MediaConfig,
    pub playlist: PlaylistConfig,
    pub plugin: PluginConfig,
    pub pre_extract: PreExtractConfig,
    pub temp: TempConfig,
    pub cache: CacheConfig,
    pub broker: BrokerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            excludes: vec!["__MACOSX".to_string(), ".DS_Store".to_string()],
            images: Extensions::new(DEFAULT_IMAGE_EXTENSIONS.iter().copied()),
            zip: ZipConfig::default(),
            sevenzip: SevenZipConfig::default(),
            pdf: PdfConfig::default(),
            media: MediaConfig::default(),
            playlist: PlaylistConfig::default(),
            plugin: PluginConfig::default(),
            pre_extract: PreExtractConfig::default(),
            temp: TempConfig::default(),
            cache: CacheConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Config {
    /// Where the config file lives when nobody says otherwise.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "quire").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Build the provider stack without extracting it.
    ///
    /// A missing file is not an error (figment treats it as empty), but an
    /// unrecognised extension is.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            let ext = path.extension().and_then(|e| e.to_str()).map(str::to_lowercase);
            figment = match ext.as_deref() {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFile(path.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate.
    ///
    /// With no explicit path, the file at [`default_path`](Self::default_path)
    /// is used if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fallback = match path {
            Some(_) => None,
            None => Self::default_path().filter(|p| p.is_file()),
        };
        let path = path.or(fallback.as_deref());
        let config: Config = Self::figment(path)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(
            path = ?path.map(Path::display),
            temp_root = %config.temp.root.display(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Reject values that would load fine but can't work.
    pub fn validate(&self) -> Result<()> {
        if self.pre_extract.memory_budget == 0 {
            exn::bail!(ErrorKind::invalid("pre_extract.memory_budget", "must be greater than zero"));
        }
        if self.pre_extract.large_release == 0 {
            exn::bail!(ErrorKind::invalid("pre_extract.large_release", "must be greater than zero"));
        }
        if self.cache.compaction_threshold == 0 {
            exn::bail!(ErrorKind::invalid("cache.compaction_threshold", "must be greater than zero"));
        }
        if self.broker.temp_cache_capacity == 0 {
            exn::bail!(ErrorKind::invalid("broker.temp_cache_capacity", "must be greater than zero"));
        }
        if !self.temp.root.is_absolute() {
            exn::bail!(ErrorKind::invalid(
                "temp.root",
                format!("must be absolute, got `{}`", self.temp.root.display())
            ));
        }
        for (field, enabled, extensions) in [
            ("zip.extensions", self.zip.enabled, &self.zip.extensions),
            ("sevenzip.extensions", self.sevenzip.enabled, &self.sevenzip.extensions),
            ("pdf.extensions", self.pdf.enabled, &self.pdf.extensions),
            ("media.extensions", self.media.enabled, &self.media.extensions),
            ("playlist.extensions", true, &self.playlist.extensions),
            ("images", true, &self.images),
        ] {
            if enabled && extensions.is_empty() {
                exn::bail!(ErrorKind::invalid(field, "no extensions for an enabled format"));
            }
            if !extensions.is_well_formed() {
                exn::bail!(ErrorKind::invalid(field, "extensions must be a single suffix like `.zip`"));
            }
        }
        for plugin in &self.plugin.plugins {
            if plugin.name.trim().is_empty() {
                exn::bail!(ErrorKind::invalid("plugin.plugins", "plugin name is empty"));
            }
            if !plugin.extensions.is_well_formed() {
                exn::bail!(ErrorKind::invalid("plugin.plugins", format!("bad extensions for `{}`", plugin.name)));
            }
        }
        if self.excludes.iter().any(|e| e.contains(['/', '\\'])) {
            exn::bail!(ErrorKind::invalid("excludes", "entries are single path segments"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pre_extract.memory_budget, 100 * 1024 * 1024);
        assert!(config.zip.extensions.contains("cbz"));
        assert!(config.images.matches("001.JPG"));
        assert!(config.excludes.iter().any(|e| e == "__MACOSX"));
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quire.toml");
        std::fs::write(
            &path,
            r#"
            excludes = ["Thumbs.db"]

            [zip]
            encoding = "local"
            extensions = "zip;cbz;epub"

            [pre_extract]
            memory_budget = 4096
            "#,
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.excludes, vec!["Thumbs.db".to_string()]);
        assert_eq!(config.zip.encoding, ZipEncoding::Local);
        assert!(config.zip.extensions.contains("epub"));
        // Untouched keys in a touched section keep their defaults.
        assert!(config.zip.enabled);
        assert_eq!(config.pre_extract.memory_budget, 4096);
        assert_eq!(config.broker, BrokerConfig::default());
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("quire.yaml", "sevenzip:\n  pre_extract: false\nbroker:\n  orphan_grace_ms: 10\n")?;
            jail.set_env("QUIRE_BROKER__ORPHAN_GRACE_MS", "250");
            jail.set_env("QUIRE_MEDIA__ENABLED", "false");
            let config = Config::load(Some(Path::new("quire.yaml"))).unwrap();
            assert!(!config.sevenzip.pre_extract);
            assert_eq!(config.broker.orphan_grace_ms, 250);
            assert!(!config.media.enabled);
            Ok(())
        });
    }

    #[test]
    fn test_unsupported_file() {
        let err = Config::figment(Some(Path::new("quire.ini"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFile(_)));
    }

    #[rstest]
    #[case::zero_budget(|c: &mut Config| c.pre_extract.memory_budget = 0, "pre_extract.memory_budget")]
    #[case::zero_large_release(|c: &mut Config| c.pre_extract.large_release = 0, "pre_extract.large_release")]
    #[case::relative_root(|c: &mut Config| c.temp.root = PathBuf::from("tmp"), "temp.root")]
    #[case::empty_zip(|c: &mut Config| c.zip.extensions = Extensions::default(), "zip.extensions")]
    #[case::compound_ext(|c: &mut Config| c.images = Extensions::new(["tar.gz"]), "images")]
    #[case::bad_exclude(|c: &mut Config| c.excludes.push("a/b".to_string()), "excludes")]
    fn test_validate_rejects(#[case] mutate: fn(&mut Config), #[case] expected: &str) {
        let mut config = Config::default();
        mutate(&mut config);
        let err = config.validate().unwrap_err();
        match &*err {
            ErrorKind::Invalid { field, .. } => assert_eq!(*field, expected),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_disabled_format_may_have_no_extensions() {
        let mut config = Config::default();
        config.pdf.enabled = false;
        config.pdf.extensions = Extensions::default();
        config.validate().unwrap();
    }

    #[test]
    fn test_plugin_table() {
        let mut config = Config::default();
        config.plugin.plugins = vec![
            PluginSpec { name: "axrar".to_string(), extensions: Extensions::new(["rar", "cbr"]), enabled: true },
            PluginSpec { name: "axlzh".to_string(), extensions: Extensions::new(["lzh"]), enabled: false },
        ];
        assert!(config.plugin.extensions().contains("cbr"));
        assert!(!config.plugin.extensions().contains("lzh"));
        assert_eq!(config.plugin.plugin_for("a/b.RAR").map(|p| p.name.as_str()), Some("axrar"));
        assert!(config.plugin.plugin_for("a/b.lzh").is_none());
    }
}
