//! VFS Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Archive errors are re-raised under
//! the closest kind here, keeping the archive frame as a child.

use derive_more::{Display, Error};
use quire_archive::error::{Error as ArchiveError, ErrorKind as ArchiveErrorKind};
use tokio_util::sync::CancellationToken;

/// A VFS error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for VFS operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Nothing on disk or in any container matches the requested path.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// No enabled archiver handles this extension.
    #[display("unsupported file format: {_0}")]
    NotSupported(#[error(not(source))] String),
    #[display("operation canceled")]
    Canceled,
    /// Materializing an entry into a temp file failed. Every caller that
    /// joined the same extraction sees the same message.
    #[display("extraction of {ident} failed: {reason}")]
    Extraction {
        #[error(not(source))]
        ident: String,
        #[error(not(source))]
        reason: String,
    },
    /// Anything else the archive layer reported.
    #[display("archive error: {_0}")]
    Archive(#[error(not(source))] String),
}

impl ErrorKind {
    /// Re-raise an archive error, mapping it onto the kinds callers of this
    /// crate act on.
    #[track_caller]
    pub fn archive(err: ArchiveError) -> Error {
        let kind = match &*err {
            ArchiveErrorKind::Canceled => Self::Canceled,
            ArchiveErrorKind::NotFound(path) => Self::NotFound(path.clone()),
            ArchiveErrorKind::NotSupported(ext) => Self::NotSupported(ext.clone()),
            other => Self::Archive(other.to_string()),
        };
        err.raise(kind)
    }

    /// The reverse of [`archive`](Self::archive), for answering the archive
    /// layer (playlists resolve their items through us).
    #[track_caller]
    pub fn into_archive(err: Error) -> ArchiveError {
        let kind = match &*err {
            Self::Canceled => ArchiveErrorKind::Canceled,
            Self::NotFound(path) => ArchiveErrorKind::NotFound(path.clone()),
            Self::NotSupported(ext) => ArchiveErrorKind::NotSupported(ext.clone()),
            other => ArchiveErrorKind::Backend(other.to_string()),
        };
        err.raise(kind)
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Extraction { .. } | Self::Archive(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Bail out early if `cancel` has fired.
pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        exn::bail!(ErrorKind::Canceled);
    }
    Ok(())
}
