//! Name-based format detection.

use crate::path;
use quire_config::Config;
use quire_format::{ArchiveFormat, Extensions, extension_of};

/// Enabled formats in detection order, plus the image and playlist tables
/// entries consult for their derived facts.
#[derive(Clone, Debug)]
pub struct FormatTable {
    order: Vec<(ArchiveFormat, Extensions)>,
    images: Extensions,
}

impl FormatTable {
    /// Playlists are checked first, then ZIP, 7z, PDF and media. Plugin
    /// formats go either before everything or after everything.
    ///
    /// PDF is only offered when a renderer is available, and plugins only
    /// when a host is.
    pub fn new(config: &Config, has_pdf_renderer: bool, has_plugin_host: bool) -> Self {
        let mut order = vec![(ArchiveFormat::Playlist, config.playlist.extensions.clone())];
        if config.zip.enabled {
            order.push((ArchiveFormat::Zip, config.zip.extensions.clone()));
        }
        if config.sevenzip.enabled {
            order.push((ArchiveFormat::SevenZip, config.sevenzip.extensions.clone()));
        }
        if config.pdf.enabled && has_pdf_renderer {
            order.push((ArchiveFormat::Pdf, config.pdf.extensions.clone()));
        }
        if config.media.enabled {
            order.push((ArchiveFormat::Media, config.media.extensions.clone()));
        }
        if config.plugin.enabled && has_plugin_host {
            let plugin = (ArchiveFormat::Plugin, config.plugin.extensions());
            match config.plugin.first {
                true => order.insert(0, plugin),
                false => order.push(plugin),
            }
        }
        Self { order, images: config.images.clone() }
    }

    /// Which format handles `name`?
    ///
    /// A trailing separator means a directory. Media only counts when
    /// `allow_media` is set.
    pub fn detect(&self, name: &str, allow_media: bool) -> Option<ArchiveFormat> {
        if path::has_trailing_separator(name) {
            return Some(ArchiveFormat::FileSystem);
        }
        let ext = extension_of(name)?;
        self.order
            .iter()
            .filter(|(format, _)| allow_media || *format != ArchiveFormat::Media)
            .find(|(_, extensions)| extensions.contains(&ext))
            .map(|(format, _)| *format)
    }

    /// Like [`detect`](Self::detect) but never answers with a directory.
    pub fn detect_container(&self, name: &str, allow_media: bool) -> Option<ArchiveFormat> {
        self.detect(path::trim_end(name), allow_media)
    }

    pub fn is_image(&self, name: &str) -> bool {
        self.images.matches(name)
    }

    pub fn is_playlist(&self, name: &str) -> bool {
        self.detect_container(name, false) == Some(ArchiveFormat::Playlist)
    }

    pub fn formats(&self) -> impl Iterator<Item = ArchiveFormat> + '_ {
        self.order.iter().map(|(format, _)| *format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_config::PluginSpec;
    use rstest::rstest;

    fn table() -> FormatTable {
        FormatTable::new(&Config::default(), true, false)
    }

    #[rstest]
    #[case("a/book.zip", true, Some(ArchiveFormat::Zip))]
    #[case("BOOK.CBZ", false, Some(ArchiveFormat::Zip))]
    #[case("solid.7z", false, Some(ArchiveFormat::SevenZip))]
    #[case("doc.pdf", false, Some(ArchiveFormat::Pdf))]
    #[case("clip.mp4", true, Some(ArchiveFormat::Media))]
    #[case("clip.mp4", false, None)]
    #[case("list.qpls", false, Some(ArchiveFormat::Playlist))]
    #[case("folder/", false, Some(ArchiveFormat::FileSystem))]
    #[case("page.jpg", true, None)]
    #[case("noext", true, None)]
    fn test_detect(#[case] name: &str, #[case] allow_media: bool, #[case] expected: Option<ArchiveFormat>) {
        assert_eq!(table().detect(name, allow_media), expected);
    }

    #[test]
    fn test_disabled_formats_are_skipped() {
        let mut config = Config::default();
        config.zip.enabled = false;
        let table = FormatTable::new(&config, false, false);
        assert_eq!(table.detect("a.zip", true), None);
        // No renderer, no PDF.
        assert_eq!(table.detect("a.pdf", true), None);
    }

    #[test]
    fn test_plugin_order() {
        let mut config = Config::default();
        config.plugin.enabled = true;
        config.plugin.plugins =
            vec![PluginSpec { name: "axzip".to_string(), extensions: Extensions::new(["zip", "rar"]), enabled: true }];

        let last = FormatTable::new(&config, false, true);
        assert_eq!(last.detect("a.zip", false), Some(ArchiveFormat::Zip));
        assert_eq!(last.detect("a.rar", false), Some(ArchiveFormat::Plugin));

        config.plugin.first = true;
        let first = FormatTable::new(&config, false, true);
        assert_eq!(first.detect("a.zip", false), Some(ArchiveFormat::Plugin));
        assert_eq!(first.formats().next(), Some(ArchiveFormat::Plugin));

        // Plugin formats need a host.
        let hostless = FormatTable::new(&config, false, false);
        assert_eq!(hostless.detect("a.rar", false), None);
    }

    #[test]
    fn test_images_and_playlists() {
        let table = table();
        assert!(table.is_image("dir/001.PNG"));
        assert!(!table.is_image("dir/001.txt"));
        assert!(table.is_playlist("dir/list.qpls"));
        assert!(!table.is_playlist("dir/list.zip"));
    }
}
