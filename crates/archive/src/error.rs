//! Archive Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use quire_format::ArchiveFormat;
use quire_format::error::{Error as FormatError, ErrorKind as FormatErrorKind};
use std::io::Error as IoError;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// An archive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No archiver claims this name (or the claiming one isn't available).
    #[display("unsupported file format: {_0}")]
    NotSupported(#[error(not(source))] String),
    /// Virtual path or real file does not exist.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The container changed underneath a cached listing.
    #[display("entry `{expected}` no longer matches `{actual}`")]
    Inconsistency {
        #[error(not(source))]
        expected: String,
        #[error(not(source))]
        actual: String,
    },
    /// The caller's cancellation token fired.
    #[display("operation canceled")]
    Canceled,
    /// Entry has no payload of its own (synthesized directory, dead link).
    #[display("entry cannot be opened: {_0}")]
    NotExtractable(#[error(not(source))] String),
    #[display("entry is a directory: {_0}")]
    IsDirectory(#[error(not(source))] String),
    /// An archiver was asked to list itself while already listing, which
    /// happens when playlists point into each other.
    #[display("listing of {_0} refers back to itself")]
    Cycle(#[error(not(source))] String),
    /// Entry was handed to an archiver that didn't list it.
    #[display("entry {_0} belongs to a different archiver")]
    ForeignEntry(#[error(not(source))] String),
    /// The backend doesn't implement this operation.
    #[display("{format} archives do not support {operation}")]
    Unsupported {
        #[error(not(source))]
        format: ArchiveFormat,
        #[error(not(source))]
        operation: &'static str,
    },
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Destination exists and overwriting wasn't asked for.
    #[display("file already exists: {}", _0.display())]
    AlreadyExists(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Decoder or external collaborator failed.
    #[display("backend error: {_0}")]
    Backend(#[error(not(source))] String),
    /// Container format inspection failed.
    #[display("format error: {_0}")]
    Format(FormatErrorKind),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}
impl ErrorKind {
    /// Convert a format error into an archive error, preserving the format
    /// crate's `Exn` frame as a child in this error tree.
    #[track_caller]
    pub fn format(err: FormatError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Format(inner))
    }

    /// Map an I/O error on a real path to the most specific kind.
    pub fn io(err: IoError, path: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_path_buf()),
            _ => Self::Io(err),
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Backend(_) | Self::Inconsistency { .. })
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
