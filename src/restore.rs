//! Walk a snapshot's VFS back out through an exporter.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::*;

use crate::cancel::CancelToken;
use crate::exporter::Exporter;
use crate::lock;
use crate::mac::Mac;
use crate::repository::Repository;
use crate::vfs::{EntryKind, Filesystem, VfsEntry, normalize_path};

#[derive(Debug)]
pub struct RestoreOptions {
    /// Subtree to restore ("/" for everything).
    pub base: String,
    /// Prefix stripped from every path before it reaches the exporter.
    pub strip: String,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            base: "/".to_owned(),
            strip: "/".to_owned(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    pub bytes: u64,
    /// (path, what went wrong); traversal continues past them.
    pub errors: Vec<(String, String)>,
}

pub fn restore(
    repo: &Arc<Repository>,
    snapshot_id: &Mac,
    exporter: &dyn Exporter,
    opts: &RestoreOptions,
    cancel: &CancelToken,
) -> Result<RestoreReport> {
    let _lock = lock::acquire_shared(repo)?;

    let header = repo.get_snapshot(snapshot_id)?;
    let mut report = RestoreReport::default();
    let strip = normalize_path(&opts.strip);

    for source in &header.sources {
        let fs = Filesystem::open(repo.clone(), &source.vfs, None);

        // First occurrence of each hard-linked inode, by destination path.
        let mut seen_inodes: HashMap<(u64, u64), String> = HashMap::new();
        // (dest, entry) of every directory, for a second permissions pass.
        let mut directories: Vec<(String, VfsEntry)> = Vec::new();

        for item in fs.walk(&opts.base)? {
            cancel.check()?;
            let (path, entry) = match item {
                Ok(pair) => pair,
                Err(e) => {
                    report.errors.push(("?".to_owned(), format!("VFS walk: {e}")));
                    continue;
                }
            };
            let dest = strip_prefix(&path, &strip);

            let outcome = restore_entry(
                &fs,
                exporter,
                &path,
                &dest,
                &entry,
                &mut seen_inodes,
                &mut report,
            );
            if let Err(e) = outcome {
                report.errors.push((path.clone(), format!("{e:#}")));
                continue;
            }
            if entry.kind() == EntryKind::Directory {
                directories.push((dest, entry));
            }
        }

        // Directory modes last, deepest first, so a read-only directory
        // doesn't brick the files being restored into it.
        for (dest, entry) in directories.iter().rev() {
            if let Err(e) = exporter.set_permissions(dest, &entry.file_info) {
                report.errors.push((dest.clone(), format!("{e:#}")));
            }
        }
    }

    exporter.close()?;
    info!(
        "Restored {} files, {} directories, {} bytes ({} errors)",
        report.files,
        report.directories,
        report.bytes,
        report.errors.len()
    );
    Ok(report)
}

fn strip_prefix(path: &str, strip: &str) -> String {
    if strip == "/" {
        return path.to_owned();
    }
    match path.strip_prefix(strip) {
        Some("") => "/".to_owned(),
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        _ => path.to_owned(),
    }
}

fn restore_entry(
    fs: &Filesystem,
    exporter: &dyn Exporter,
    path: &str,
    dest: &str,
    entry: &VfsEntry,
    seen_inodes: &mut HashMap<(u64, u64), String>,
    report: &mut RestoreReport,
) -> Result<()> {
    match entry.kind() {
        EntryKind::Directory => {
            exporter.create_directory(dest)?;
            report.directories += 1;
        }
        EntryKind::Symlink => {
            let target = entry
                .symlink_target
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("symlink without a target"))?;
            exporter.create_symlink(dest, target)?;
            report.symlinks += 1;
        }
        EntryKind::File => {
            let info = &entry.file_info;
            if info.nlink > 1 {
                let inode = (info.dev, info.ino);
                if let Some(first) = seen_inodes.get(&inode) {
                    if exporter.create_hardlink(dest, first)? {
                        debug!("{:>9} {dest} => {first}", "hardlink");
                        report.hardlinks += 1;
                        return Ok(());
                    }
                    // Exporter can't link; fall through and stream a copy.
                } else {
                    seen_inodes.insert(inode, dest.to_owned());
                }
            }

            let mut reader = fs.open_file(entry)?;
            let size = reader.len();
            exporter.store_file(dest, &mut reader, size)?;
            exporter.set_permissions(dest, info)?;
            debug!("{:>9} {path}", "restore");
            report.files += 1;
            report.bytes += size;
        }
        EntryKind::Device | EntryKind::Pipe | EntryKind::Socket => {
            // Special files don't restore through the exporter contract;
            // note and move on.
            debug!("{:>9} {path}", "special");
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_stripping() {
        assert_eq!(strip_prefix("/a/b/c", "/"), "/a/b/c");
        assert_eq!(strip_prefix("/a/b/c", "/a"), "/b/c");
        assert_eq!(strip_prefix("/a/b/c", "/a/b"), "/c");
        assert_eq!(strip_prefix("/a/b", "/a/b"), "/");
        // Not actually a prefix: leave the path alone.
        assert_eq!(strip_prefix("/a/bc", "/a/b"), "/a/bc");
        assert_eq!(strip_prefix("/x/y", "/a"), "/x/y");
    }
}
