//! Container format detection for the archive layer.
//!
//! This crate knows *what* a container is, never how to read it:
//!
//! - **Format detection** from magic bytes ([`ArchiveFormat::from_magic_bytes`])
//!   and default name tables ([`ArchiveFormat::default_extensions`])
//! - **Extension tables** ([`Extensions`]), normalized and case-insensitive,
//!   shared between configuration and the archiver registry
//! - **ZIP inspection** ([`zip::is_utf8_encoded`]) for guessing the name
//!   encoding of archives that predate the UTF-8 flag
//!
//! Decoding lives in `quire-archive`; this crate stays dependency-light so the
//! configuration crate can use it too.

mod construct;
pub mod error;
mod extensions;
mod util;
pub mod zip;

pub use crate::extensions::{Extensions, extension_of};

/// Default image extensions, used to decide whether an entry is a page.
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".jfif", ".png", ".gif", ".bmp", ".webp", ".avif", ".jxl", ".tif", ".tiff", ".ico",
];

/// A container format the archive layer can open.
///
/// Every variant maps onto one archiver backend. [`FileSystem`](Self::FileSystem)
/// is never detected from an extension; it is chosen when the path is a real
/// directory (or ends with a separator).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(rename_all = "lowercase"))]
pub enum ArchiveFormat {
    /// A plain directory on disk
    FileSystem,
    /// ZIP and its comic-book alias (.zip, .cbz)
    Zip,
    /// 7z containers (.7z, .cb7), possibly solid
    SevenZip,
    /// PDF documents, one entry per rendered page
    Pdf,
    /// Formats handled by an external legacy plugin host
    Plugin,
    /// A single audio/video file presented as a one-entry container
    Media,
    /// A list of paths pointing anywhere in the virtual tree
    Playlist,
}

#[cfg(test)]
mod tests {
    use crate::ArchiveFormat;

    #[test]
    fn filesystem_has_no_extensions() {
        assert!(ArchiveFormat::FileSystem.default_extensions().is_empty());
        assert!(ArchiveFormat::Plugin.default_extensions().is_empty());
    }
}
