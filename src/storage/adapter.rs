//! Filesystem access behind a minimal trait.
//!
//! Every persistence layer (request store, transaction store, meter store,
//! configuration containers) goes through this interface, so the whole
//! runtime can run against a directory, flash-backed storage, or the
//! in-memory adapter used by tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::support::errors::PersistError;

/// Key/file get-put-enumerate-remove. Calls must not block beyond very short
/// stalls; the runtime issues them from its single poll thread.
pub trait FilesystemAdapter {
    /// Returns `Ok(None)` when the file does not exist.
    fn read(&self, name: &str) -> Result<Option<String>, PersistError>;

    fn write(&self, name: &str, contents: &str) -> Result<(), PersistError>;

    /// Removing a missing file is not an error.
    fn remove(&self, name: &str) -> Result<(), PersistError>;

    /// All stored file names, in no particular order.
    fn entries(&self) -> Result<Vec<String>, PersistError>;
}

pub type SharedFilesystem = Rc<dyn FilesystemAdapter>;

/// Directory-backed adapter for hosts with a real filesystem.
pub struct StdFilesystem {
    root: PathBuf,
}

impl StdFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PersistError::Write(e.to_string()))?;
        Ok(Self { root })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FilesystemAdapter for StdFilesystem {
    fn read(&self, name: &str) -> Result<Option<String>, PersistError> {
        match fs::read_to_string(self.path(name)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistError::Read(e.to_string())),
        }
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), PersistError> {
        fs::write(self.path(name), contents).map_err(|e| PersistError::Write(e.to_string()))
    }

    fn remove(&self, name: &str) -> Result<(), PersistError> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistError::Remove(e.to_string())),
        }
    }

    fn entries(&self) -> Result<Vec<String>, PersistError> {
        let mut names = Vec::new();
        let dir = fs::read_dir(&self.root).map_err(|e| PersistError::Read(e.to_string()))?;
        for entry in dir {
            let entry = entry.map_err(|e| PersistError::Read(e.to_string()))?;
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}
