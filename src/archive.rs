//! Stream a snapshot subtree out as tar, tar.gz, or zip.
//!
//! Built on the same walk and chunk reader as restore; nothing is
//! buffered beyond one chunk.

use std::io::{self, Seek, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use tracing::*;

use crate::cancel::CancelToken;
use crate::lock;
use crate::mac::Mac;
use crate::repository::Repository;
use crate::vfs::{EntryKind, Filesystem, VfsEntry};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

impl std::str::FromStr for ArchiveFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tar" => Ok(ArchiveFormat::Tar),
            "tar.gz" | "tgz" => Ok(ArchiveFormat::TarGz),
            "zip" => Ok(ArchiveFormat::Zip),
            other => anyhow::bail!("unknown archive format {other} (tar, tar.gz, zip)"),
        }
    }
}

pub fn archive<W: Write + Seek>(
    repo: &Arc<Repository>,
    snapshot_id: &Mac,
    base: &str,
    format: ArchiveFormat,
    out: W,
    cancel: &CancelToken,
) -> Result<()> {
    let _lock = lock::acquire_shared(repo)?;
    let header = repo.get_snapshot(snapshot_id)?;

    match format {
        ArchiveFormat::Tar => {
            let mut builder = tar::Builder::new(out);
            for source in &header.sources {
                let fs = Filesystem::open(repo.clone(), &source.vfs, None);
                tar_source(&fs, base, &mut builder, cancel)?;
            }
            builder.finish()?;
        }
        ArchiveFormat::TarGz => {
            let gz = GzEncoder::new(out, flate2::Compression::default());
            let mut builder = tar::Builder::new(gz);
            for source in &header.sources {
                let fs = Filesystem::open(repo.clone(), &source.vfs, None);
                tar_source(&fs, base, &mut builder, cancel)?;
            }
            builder.into_inner()?.finish()?;
        }
        ArchiveFormat::Zip => {
            let mut writer = zip::ZipWriter::new(out);
            for source in &header.sources {
                let fs = Filesystem::open(repo.clone(), &source.vfs, None);
                zip_source(&fs, base, &mut writer, cancel)?;
            }
            writer.finish()?;
        }
    }
    info!("Archived snapshot {}", snapshot_id.short_name());
    Ok(())
}

/// Archive member name: path without its leading slash.
fn member_name(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn tar_source<W: Write>(
    fs: &Filesystem,
    base: &str,
    builder: &mut tar::Builder<W>,
    cancel: &CancelToken,
) -> Result<()> {
    for item in fs.walk(base)? {
        cancel.check()?;
        let (path, entry) = item?;
        let name = member_name(&path);
        if name.is_empty() {
            continue;
        }

        let mut header = tar::Header::new_gnu();
        header.set_mode(entry.file_info.mode & 0o7777);
        header.set_mtime(entry.file_info.mtime.max(0) as u64);
        header.set_uid(entry.file_info.uid as u64);
        header.set_gid(entry.file_info.gid as u64);

        match entry.kind() {
            EntryKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, format!("{name}/"), io::empty())
                    .with_context(|| format!("Couldn't archive {path}"))?;
            }
            EntryKind::Symlink => {
                let target = entry.symlink_target.as_deref().unwrap_or("");
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                builder
                    .append_link(&mut header, name, target)
                    .with_context(|| format!("Couldn't archive {path}"))?;
            }
            EntryKind::File => {
                let reader = file_reader(fs, &entry)?;
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(reader.len());
                builder
                    .append_data(&mut header, name, reader)
                    .with_context(|| format!("Couldn't archive {path}"))?;
            }
            _ => debug!("{:>9} {path}", "special"),
        }
    }
    Ok(())
}

fn zip_source<W: Write + Seek>(
    fs: &Filesystem,
    base: &str,
    writer: &mut zip::ZipWriter<W>,
    cancel: &CancelToken,
) -> Result<()> {
    use zip::write::SimpleFileOptions;

    for item in fs.walk(base)? {
        cancel.check()?;
        let (path, entry) = item?;
        let name = member_name(&path);
        if name.is_empty() {
            continue;
        }
        let options =
            SimpleFileOptions::default().unix_permissions(entry.file_info.mode & 0o7777);

        match entry.kind() {
            EntryKind::Directory => {
                writer
                    .add_directory(name, options)
                    .with_context(|| format!("Couldn't archive {path}"))?;
            }
            EntryKind::Symlink => {
                let target = entry.symlink_target.as_deref().unwrap_or("");
                writer
                    .add_symlink(name, target, options)
                    .with_context(|| format!("Couldn't archive {path}"))?;
            }
            EntryKind::File => {
                writer
                    .start_file(name, options)
                    .with_context(|| format!("Couldn't archive {path}"))?;
                let mut reader = file_reader(fs, &entry)?;
                io::copy(&mut reader, writer)?;
            }
            _ => debug!("{:>9} {path}", "special"),
        }
    }
    Ok(())
}

fn file_reader(fs: &Filesystem, entry: &VfsEntry) -> Result<crate::vfs::ChunkReader> {
    fs.open_file(entry)
        .with_context(|| format!("Couldn't open {}", entry.path()))
}
