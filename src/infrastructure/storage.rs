//! Local filesystem source storage
//!
//! File references resolve strictly under a configured root directory;
//! a reference that escapes the root (via `..` or an absolute path) is
//! rejected before anything is opened.

use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::job::FileReference;
use crate::domain::services::{SourceStorage, StorageError};

pub struct LocalSourceStorage {
    root: PathBuf,
}

impl LocalSourceStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SourceStorage for LocalSourceStorage {
    fn resolve(&self, reference: &FileReference) -> Result<File, StorageError> {
        let relative = Path::new(reference.as_str());
        if relative.is_absolute() {
            return Err(StorageError::OutsideRoot {
                reference: reference.as_str().to_string(),
            });
        }

        let candidate = self.root.join(relative);
        let root = self
            .root
            .canonicalize()
            .map_err(|_| StorageError::NotFound {
                reference: reference.as_str().to_string(),
            })?;
        let resolved = candidate
            .canonicalize()
            .map_err(|_| StorageError::NotFound {
                reference: reference.as_str().to_string(),
            })?;
        if !resolved.starts_with(&root) {
            return Err(StorageError::OutsideRoot {
                reference: reference.as_str().to_string(),
            });
        }

        debug!(path = %resolved.display(), "resolved source file");
        Ok(File::open(resolved)?)
    }
}
