//! Where a restore lands: anything that accepts directories, files, and
//! symlinks being written back out.

use std::io::Read;

use crate::error::Result;
use crate::vfs::FileInfo;

pub mod fs;
pub mod memory;

pub trait Exporter: Send + Sync {
    fn root(&self) -> String;

    fn create_directory(&self, path: &str) -> Result<()>;

    fn store_file(&self, path: &str, reader: &mut dyn Read, size: u64) -> Result<()>;

    fn set_permissions(&self, path: &str, file_info: &FileInfo) -> Result<()>;

    fn create_symlink(&self, path: &str, target: &str) -> Result<()>;

    /// Optional: link `path` to the already-restored `target`.
    /// Returns false when unsupported, and the restore streams a second
    /// copy of the content instead.
    fn create_hardlink(&self, _path: &str, _target: &str) -> Result<bool> {
        Ok(false)
    }

    fn close(&self) -> Result<()>;
}
