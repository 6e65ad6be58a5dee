//! In-memory filesystem for tests and diskless development hosts.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use super::adapter::FilesystemAdapter;
use crate::support::errors::PersistError;

pub struct MemFilesystem {
    files: RefCell<BTreeMap<String, String>>,
    fail_writes: Cell<bool>,
}

impl MemFilesystem {
    pub fn new() -> Self {
        Self {
            files: RefCell::new(BTreeMap::new()),
            fail_writes: Cell::new(false),
        }
    }

    /// Make every subsequent write fail, to exercise the
    /// persistence-failure recovery paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.borrow().contains_key(name)
    }

    pub fn file_count(&self) -> usize {
        self.files.borrow().len()
    }

    /// Snapshot of all files, for reboot simulations.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.files.borrow().clone()
    }

    pub fn restore(dump: BTreeMap<String, String>) -> Self {
        Self {
            files: RefCell::new(dump),
            fail_writes: Cell::new(false),
        }
    }
}

impl Default for MemFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemAdapter for MemFilesystem {
    fn read(&self, name: &str) -> Result<Option<String>, PersistError> {
        Ok(self.files.borrow().get(name).cloned())
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), PersistError> {
        if self.fail_writes.get() {
            return Err(PersistError::Write("simulated write failure".into()));
        }
        self.files
            .borrow_mut()
            .insert(name.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), PersistError> {
        self.files.borrow_mut().remove(name);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<String>, PersistError> {
        Ok(self.files.borrow().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove() {
        let fs = MemFilesystem::new();
        fs.write("a.jsn", "{}").unwrap();
        assert_eq!(fs.read("a.jsn").unwrap().as_deref(), Some("{}"));
        fs.remove("a.jsn").unwrap();
        assert_eq!(fs.read("a.jsn").unwrap(), None);
    }

    #[test]
    fn simulated_write_failure() {
        let fs = MemFilesystem::new();
        fs.set_fail_writes(true);
        assert!(fs.write("a.jsn", "{}").is_err());
        fs.set_fail_writes(false);
        assert!(fs.write("a.jsn", "{}").is_ok());
    }
}
