use crate::error::{Error, ErrorKind};
use crate::{ArchiveFormat, Extensions};
use std::str::FromStr;

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const SEVENZIP_MAGIC: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];
const PDF_MAGIC: [u8; 5] = *b"%PDF-";

impl FromStr for ArchiveFormat {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "folder" | "filesystem" => Ok(ArchiveFormat::FileSystem),
            "zip" => Ok(ArchiveFormat::Zip),
            "7z" | "sevenzip" => Ok(ArchiveFormat::SevenZip),
            "pdf" => Ok(ArchiveFormat::Pdf),
            "plugin" => Ok(ArchiveFormat::Plugin),
            "media" => Ok(ArchiveFormat::Media),
            "playlist" => Ok(ArchiveFormat::Playlist),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(s.to_string())),
        }
    }
}

impl ArchiveFormat {
    /// Detect a container format from magic bytes.
    ///
    /// Only formats with a stable signature can be detected this way; media,
    /// playlists and plugin formats always return `None`.
    #[must_use]
    pub fn from_magic_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&ZIP_MAGIC) {
            return Some(ArchiveFormat::Zip);
        }
        if bytes.starts_with(&SEVENZIP_MAGIC) {
            return Some(ArchiveFormat::SevenZip);
        }
        if bytes.starts_with(&PDF_MAGIC) {
            return Some(ArchiveFormat::Pdf);
        }
        None
    }

    /// Built-in extension table for this format.
    ///
    /// Configuration starts from these and may replace them entirely.
    #[must_use]
    pub fn default_extensions(&self) -> Extensions {
        let list: &[&str] = match self {
            ArchiveFormat::FileSystem | ArchiveFormat::Plugin => &[],
            ArchiveFormat::Zip => &[".zip", ".cbz"],
            ArchiveFormat::SevenZip => &[".7z", ".cb7"],
            ArchiveFormat::Pdf => &[".pdf"],
            ArchiveFormat::Media => &[
                ".mp4", ".m4v", ".webm", ".mkv", ".avi", ".mov", ".wmv", ".mp3", ".m4a", ".wav", ".flac", ".ogg",
            ],
            ArchiveFormat::Playlist => &[".qpls"],
        };
        Extensions::new(list.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use crate::ArchiveFormat;
    use rstest::rstest;

    #[rstest]
    #[case(b"PK\x03\x04\x14\x00", Some(ArchiveFormat::Zip))]
    #[case(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04], Some(ArchiveFormat::SevenZip))]
    #[case(b"%PDF-1.7\n", Some(ArchiveFormat::Pdf))]
    #[case(b"PK\x05\x06", None)]
    #[case(b"", None)]
    fn test_from_magic_bytes(#[case] bytes: &[u8], #[case] expected: Option<ArchiveFormat>) {
        assert_eq!(ArchiveFormat::from_magic_bytes(bytes), expected);
    }

    #[rstest]
    #[case("zip", ArchiveFormat::Zip)]
    #[case("7Z", ArchiveFormat::SevenZip)]
    #[case("SevenZip", ArchiveFormat::SevenZip)]
    #[case("folder", ArchiveFormat::FileSystem)]
    #[case("playlist", ArchiveFormat::Playlist)]
    fn test_from_str(#[case] input: &str, #[case] expected: ArchiveFormat) {
        assert_eq!(input.parse::<ArchiveFormat>().unwrap(), expected);
    }

    #[test]
    fn test_from_str_unknown() {
        assert!("rar".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_default_extensions() {
        assert!(ArchiveFormat::Zip.default_extensions().matches("book.CBZ"));
        assert!(ArchiveFormat::SevenZip.default_extensions().matches("a/b/c.7z"));
        assert!(!ArchiveFormat::Zip.default_extensions().matches("book.7z"));
    }
}
