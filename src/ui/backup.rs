use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::backup::{self, BackupOptions};
use crate::cache::SqliteStore;
use crate::cancel::CancelToken;
use crate::importer::fs::FsImporter;
use crate::importer::Importer;

/// Create a snapshot of a directory tree.
#[derive(Debug, Parser)]
pub struct Args {
    /// A name for the snapshot (defaults to the path)
    #[clap(short, long)]
    name: Option<String>,

    /// Add a metadata tag (can be specified multiple times)
    #[clap(short = 't', long = "tag", name = "tag")]
    tags: Vec<String>,

    /// Skip anything whose path matches the given glob
    #[clap(short = 's', long = "skip", name = "glob")]
    excludes: Vec<String>,

    /// File workers (default: one per CPU)
    #[clap(short = 'j', long, default_value_t = 0)]
    concurrency: usize,

    /// Don't sign the snapshot even if an identity is configured.
    #[clap(long)]
    no_sign: bool,

    /// The path to back up
    path: Utf8PathBuf,
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let (repo, credentials) = super::open_repository(repository)?;
    let importer = FsImporter::new(args.path.clone())?;

    // Scratch state is per snapshot; the VFS cache persists per source so
    // the next run can skip unchanged files.
    let scan_cache = Arc::new(SqliteStore::in_memory()?);
    let cache_dir = repository.join("cache");
    std::fs::create_dir_all(&cache_dir)?;
    let source_tag = crate::mac::MacHasher::digest(
        repo.config().hashing,
        repo.codec().mac_key(),
        importer.root().as_bytes(),
    );
    let vfs_cache: Arc<dyn crate::cache::KvStore> = Arc::new(
        SqliteStore::open(&cache_dir.join(format!("vfs-{}.db", source_tag.short_name())))
            .context("Couldn't open the VFS cache")?,
    );

    let opts = BackupOptions {
        name: args.name.unwrap_or_else(|| args.path.to_string()),
        tags: args.tags,
        excludes: args.excludes,
        max_concurrency: args.concurrency,
        signer: if args.no_sign { None } else { credentials.signer },
        ..BackupOptions::default()
    };

    let snapshot = backup::backup(
        &repo,
        &importer,
        scan_cache,
        Some(vfs_cache),
        opts,
        CancelToken::new(),
    )?;

    println!("Snapshot {} done", snapshot.short_name());
    Ok(())
}
