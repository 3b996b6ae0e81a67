//! Scan a local directory tree.

use std::fs;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::*;

use super::{Importer, ScanError, ScanRecord, ScanResult};
use crate::error::{Error, Result};
use crate::vfs::FileInfo;

/// Records in flight between the walker and the backup workers.
const SCAN_DEPTH: usize = 64;

pub struct FsImporter {
    base: Utf8PathBuf,
}

impl FsImporter {
    pub fn new<P: Into<Utf8PathBuf>>(base: P) -> Result<Self> {
        let base = base.into();
        let base = base
            .canonicalize_utf8()
            .map_err(|e| Error::InvalidArgument(format!("{base}: {e}")))?;
        Ok(Self { base })
    }

    fn resolve(&self, pathname: &str) -> Utf8PathBuf {
        let mut path = self.base.clone();
        for component in pathname.split('/').filter(|c| !c.is_empty()) {
            path.push(component);
        }
        path
    }
}

#[cfg(unix)]
fn file_info(path: &Utf8Path) -> std::io::Result<FileInfo> {
    use std::os::unix::fs::MetadataExt;

    let meta = fs::symlink_metadata(path)?;
    Ok(FileInfo {
        name: path.file_name().unwrap_or("/").to_owned(),
        size: meta.size(),
        mode: meta.mode(),
        mtime: meta.mtime(),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink() as u32,
        dev: meta.dev(),
        ino: meta.ino(),
        username: String::new(),
        groupname: String::new(),
    })
}

#[cfg(not(unix))]
fn file_info(path: &Utf8Path) -> std::io::Result<FileInfo> {
    let meta = fs::symlink_metadata(path)?;
    let mode = if meta.is_dir() {
        0o040755
    } else if meta.file_type().is_symlink() {
        0o120777
    } else {
        0o100644
    };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(FileInfo {
        name: path.file_name().unwrap_or("/").to_owned(),
        size: meta.len(),
        mode,
        mtime,
        uid: 0,
        gid: 0,
        nlink: 1,
        dev: 0,
        ino: 0,
        username: String::new(),
        groupname: String::new(),
    })
}

fn walk(base: &Utf8Path, pathname: String, tx: &Sender<ScanResult>) {
    let on_disk = {
        let mut p = base.to_owned();
        for component in pathname.split('/').filter(|c| !c.is_empty()) {
            p.push(component);
        }
        p
    };

    let mut info = match file_info(&on_disk) {
        Ok(info) => info,
        Err(e) => {
            let _ = tx.send(ScanResult::Error(ScanError {
                pathname,
                error: e.to_string(),
            }));
            return;
        }
    };
    if pathname == "/" {
        info.name = "/".to_owned();
    }

    let is_dir = info.kind() == crate::vfs::EntryKind::Directory;
    let target = if info.kind() == crate::vfs::EntryKind::Symlink {
        match fs::read_link(&on_disk) {
            Ok(t) => Some(t.to_string_lossy().into_owned()),
            Err(e) => {
                let _ = tx.send(ScanResult::Error(ScanError {
                    pathname,
                    error: e.to_string(),
                }));
                return;
            }
        }
    } else {
        None
    };

    if tx
        .send(ScanResult::Record(ScanRecord {
            pathname: pathname.clone(),
            file_info: info,
            target,
            xattr_name: None,
            xattr_names: Vec::new(),
        }))
        .is_err()
    {
        return;
    }

    if !is_dir {
        return;
    }

    let entries = match fs::read_dir(&on_disk) {
        Ok(entries) => entries,
        Err(e) => {
            let _ = tx.send(ScanResult::Error(ScanError {
                pathname,
                error: e.to_string(),
            }));
            return;
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => match entry.file_name().into_string() {
                Ok(name) => Some(name),
                Err(bad) => {
                    warn!("Skipping non-UTF-8 name {bad:?} in {on_disk}");
                    None
                }
            },
            Err(e) => {
                let _ = tx.send(ScanResult::Error(ScanError {
                    pathname: pathname.clone(),
                    error: e.to_string(),
                }));
                None
            }
        })
        .collect();
    names.sort();

    for name in names {
        let child = if pathname == "/" {
            format!("/{name}")
        } else {
            format!("{pathname}/{name}")
        };
        walk(base, child, tx);
    }
}

impl Importer for FsImporter {
    fn kind(&self) -> &'static str {
        "fs"
    }

    fn origin(&self) -> String {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_owned())
    }

    fn root(&self) -> String {
        self.base.to_string()
    }

    fn scan(&self) -> Result<Receiver<ScanResult>> {
        let (tx, rx) = bounded(SCAN_DEPTH);
        let base = self.base.clone();
        std::thread::Builder::new()
            .name("fs-scan".to_owned())
            .spawn(move || walk(&base, "/".to_owned(), &tx))
            .map_err(Error::Io)?;
        Ok(rx)
    }

    fn reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(pathname);
        Ok(Box::new(fs::File::open(&path)?))
    }

    fn xattr_reader(&self, pathname: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        Err(Error::InvalidArgument(format!(
            "no extended attribute {name} recorded for {pathname}"
        )))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scans_a_tree_in_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let base = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir(base.join("sub"))?;
        fs::write(base.join("a.txt"), b"aaa")?;
        fs::write(base.join("sub/b.txt"), b"bbb")?;

        let importer = FsImporter::new(base)?;
        let records: Vec<String> = importer
            .scan()?
            .iter()
            .filter_map(|r| match r {
                ScanResult::Record(record) => Some(record.pathname),
                ScanResult::Error(_) => None,
            })
            .collect();

        assert_eq!(records, vec!["/", "/a.txt", "/sub", "/sub/b.txt"]);

        let mut content = String::new();
        importer.reader("/sub/b.txt")?.read_to_string(&mut content)?;
        assert_eq!(content, "bbb");
        Ok(())
    }
}
