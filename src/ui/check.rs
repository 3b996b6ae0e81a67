use anyhow::{Result, bail};
use camino::Utf8Path;
use clap::Parser;

use crate::cancel::CancelToken;
use crate::check::{self, CheckOptions};

/// Check a snapshot for missing or corrupt blobs.
///
/// By default this only ensures every referenced blob can be found.
/// With --deep, every blob is fetched and re-hashed.
#[derive(Debug, Parser)]
pub struct Args {
    /// Snapshot ID prefix, or "latest"
    snapshot: String,

    /// Fetch and re-hash every blob
    #[clap(short, long)]
    deep: bool,

    /// Worker threads (default: one per CPU)
    #[clap(short = 'j', long, default_value_t = 0)]
    concurrency: usize,
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let (repo, _) = super::open_repository(repository)?;
    let snapshot = super::find_snapshot(&repo, &args.snapshot)?;

    let report = check::check(
        &repo,
        &snapshot,
        &CheckOptions {
            deep: args.deep,
            max_concurrency: args.concurrency,
        },
        &CancelToken::new(),
    )?;

    for issue in &report.issues {
        eprintln!("{}: {}", issue.path, issue.detail);
    }
    println!(
        "{} files, {} chunks checked",
        report.files_checked, report.chunks_checked
    );
    if !report.ok() {
        bail!("Check failed with {} issues", report.issues.len());
    }
    Ok(())
}
