use anyhow::{Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::cancel::CancelToken;
use crate::exporter::fs::FsExporter;
use crate::restore::{self, RestoreOptions};

/// Restore a snapshot (or a subtree of it) into a directory.
#[derive(Debug, Parser)]
pub struct Args {
    /// Snapshot ID prefix, or "latest"
    snapshot: String,

    /// Where to restore to
    #[clap(short, long)]
    output: Utf8PathBuf,

    /// Subtree to restore
    #[clap(default_value = "/")]
    path: String,

    /// Prefix stripped from restored paths (defaults to the subtree)
    #[clap(long)]
    strip: Option<String>,
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let (repo, _) = super::open_repository(repository)?;
    let snapshot = super::find_snapshot(&repo, &args.snapshot)?;

    let exporter = FsExporter::new(args.output.clone());
    let report = restore::restore(
        &repo,
        &snapshot,
        &exporter,
        &RestoreOptions {
            base: args.path.clone(),
            strip: args.strip.unwrap_or(args.path),
        },
        &CancelToken::new(),
    )?;

    println!(
        "Restored {} files, {} directories, {} symlinks into {}",
        report.files, report.directories, report.symlinks, args.output
    );
    if !report.errors.is_empty() {
        for (path, error) in &report.errors {
            eprintln!("{path}: {error}");
        }
        bail!("Restore finished with {} errors", report.errors.len());
    }
    Ok(())
}
