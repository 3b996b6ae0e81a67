//! An exporter that collects everything it is handed.
//!
//! Great for asserting exactly what a restore produced.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Mutex;

use super::Exporter;
use crate::error::Result;
use crate::vfs::FileInfo;

#[derive(Debug, Default)]
pub struct Captured {
    pub directories: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub symlinks: BTreeMap<String, String>,
    pub hardlinks: BTreeMap<String, String>,
    pub modes: BTreeMap<String, u32>,
}

#[derive(Debug, Default)]
pub struct MemoryExporter {
    captured: Mutex<Captured>,
    support_hardlinks: bool,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hardlinks() -> Self {
        Self {
            captured: Mutex::default(),
            support_hardlinks: true,
        }
    }

    /// Hand the captured state over for assertions.
    pub fn into_captured(self) -> Captured {
        self.captured.into_inner().unwrap()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.captured.lock().unwrap().files.get(path).cloned()
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.captured.lock().unwrap().modes.get(path).copied()
    }
}

impl Exporter for MemoryExporter {
    fn root(&self) -> String {
        "/".to_owned()
    }

    fn create_directory(&self, path: &str) -> Result<()> {
        self.captured
            .lock()
            .unwrap()
            .directories
            .insert(path.to_owned());
        Ok(())
    }

    fn store_file(&self, path: &str, reader: &mut dyn Read, _size: u64) -> Result<()> {
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        self.captured
            .lock()
            .unwrap()
            .files
            .insert(path.to_owned(), content);
        Ok(())
    }

    fn set_permissions(&self, path: &str, file_info: &FileInfo) -> Result<()> {
        self.captured
            .lock()
            .unwrap()
            .modes
            .insert(path.to_owned(), file_info.mode & 0o7777);
        Ok(())
    }

    fn create_symlink(&self, path: &str, target: &str) -> Result<()> {
        self.captured
            .lock()
            .unwrap()
            .symlinks
            .insert(path.to_owned(), target.to_owned());
        Ok(())
    }

    fn create_hardlink(&self, path: &str, target: &str) -> Result<bool> {
        if !self.support_hardlinks {
            return Ok(false);
        }
        self.captured
            .lock()
            .unwrap()
            .hardlinks
            .insert(path.to_owned(), target.to_owned());
        Ok(true)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
