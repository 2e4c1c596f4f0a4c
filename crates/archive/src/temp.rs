//! Temporary files and directories.
//!
//! Everything is created below one configured root so a crashed process
//! leaves its litter in a single, known place. Files and directories are
//! removed when their handle drops.

use crate::error::{ErrorKind, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{Builder, TempDir, TempPath};

#[derive(Clone, Debug)]
pub struct TempRoot {
    path: Arc<PathBuf>,
}

impl TempRoot {
    /// Use `path` as the root, creating it if needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        // Only happens once at startup; not worth going async for.
        std::fs::create_dir_all(&path).map_err(|e| ErrorKind::io(e, &path))?;
        Ok(Self { path: Arc::new(path) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh, empty directory such as `<root>/arcXXXXXX`.
    pub fn create_dir(&self, prefix: &str) -> Result<TempDir> {
        Ok(Builder::new().prefix(prefix).tempdir_in(self.path.as_path()).map_err(|e| ErrorKind::io(e, &self.path))?)
    }

    /// A fresh file (closed, zero length) whose name ends with `suffix`, so
    /// format detection by extension keeps working on it.
    pub fn create_file(&self, prefix: &str, suffix: &str) -> Result<TempFile> {
        let file = Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(self.path.as_path())
            .map_err(|e| ErrorKind::io(e, &self.path))?;
        Ok(TempFile { path: file.into_temp_path() })
    }

    /// Returns `true` for paths that were (or could have been) created here.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(self.path.as_path())
    }
}

/// A materialized file that is deleted once the last owner lets go.
pub struct TempFile {
    path: TempPath,
}

impl TempFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for TempFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TempFile").field(&self.path()).finish()
    }
}
