use crate::ArchiveFormat;
use std::fmt::{Display, Formatter, Result as FmtResult};

impl Display for ArchiveFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl AsRef<str> for ArchiveFormat {
    fn as_ref(&self) -> &'static str {
        self.as_str()
    }
}

impl ArchiveFormat {
    /// Returns the short name for configuration (for displaying to user)
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::FileSystem => "folder",
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::Pdf => "pdf",
            ArchiveFormat::Plugin => "plugin",
            ArchiveFormat::Media => "media",
            ArchiveFormat::Playlist => "playlist",
        }
    }

    /// Verify that `bytes` start with the expected magic bytes for this format.
    ///
    /// Useful for cross-checking a format detected from a file extension
    /// against actual file contents. Formats without a signature always pass.
    #[must_use]
    pub fn check_magic_bytes(&self, bytes: &[u8]) -> bool {
        match self {
            ArchiveFormat::Zip | ArchiveFormat::SevenZip | ArchiveFormat::Pdf => {
                Self::from_magic_bytes(bytes) == Some(*self)
            },
            _ => true,
        }
    }
}
