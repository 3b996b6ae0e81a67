//! Restore into a local directory tree.

use std::fs;
use std::io::{self, Read};

use camino::Utf8PathBuf;
use tracing::*;

use super::Exporter;
use crate::error::{Error, Result};
use crate::vfs::FileInfo;

pub struct FsExporter {
    base: Utf8PathBuf,
}

impl FsExporter {
    pub fn new<P: Into<Utf8PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    fn resolve(&self, path: &str) -> Utf8PathBuf {
        let mut resolved = self.base.clone();
        for component in path.split('/').filter(|c| !c.is_empty() && *c != "..") {
            resolved.push(component);
        }
        resolved
    }
}

impl Exporter for FsExporter {
    fn root(&self) -> String {
        self.base.to_string()
    }

    fn create_directory(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve(path)).map_err(Error::Io)
    }

    fn store_file(&self, path: &str, reader: &mut dyn Read, size: u64) -> Result<()> {
        let to = self.resolve(path);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut fh = fs::File::create(&to)?;
        let written = io::copy(reader, &mut fh)?;
        if written != size {
            warn!("{to}: expected {size} bytes, wrote {written}");
        }
        Ok(())
    }

    #[cfg(unix)]
    fn set_permissions(&self, path: &str, file_info: &FileInfo) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(
            self.resolve(path),
            fs::Permissions::from_mode(file_info.mode & 0o7777),
        )
        .map_err(Error::Io)
    }

    #[cfg(not(unix))]
    fn set_permissions(&self, _path: &str, _file_info: &FileInfo) -> Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn create_symlink(&self, path: &str, target: &str) -> Result<()> {
        let to = self.resolve(path);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, to).map_err(Error::Io)
    }

    #[cfg(not(unix))]
    fn create_symlink(&self, path: &str, target: &str) -> Result<()> {
        // No symlinks here; leave a marker file so the restore is at least
        // inspectable.
        self.store_file(path, &mut target.as_bytes(), target.len() as u64)
    }

    fn create_hardlink(&self, path: &str, target: &str) -> Result<bool> {
        let to = self.resolve(path);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::hard_link(self.resolve(target), to)?;
        Ok(true)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
