use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::cancel::CancelToken;
use crate::sync;

/// Copy a snapshot into another repository, re-keying every blob.
#[derive(Debug, Parser)]
pub struct Args {
    /// Snapshot ID prefix, or "latest"
    snapshot: String,

    /// The destination repository
    #[clap(long)]
    to: Utf8PathBuf,
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let (src, _) = super::open_repository(repository)?;
    let (dst, _) = super::open_repository(&args.to)?;
    let snapshot = super::find_snapshot(&src, &args.snapshot)?;

    let copied = sync::synchronize(&src, &snapshot, &dst, &CancelToken::new())?;
    println!(
        "Snapshot {} synchronized as {}",
        snapshot.short_name(),
        copied.short_name()
    );
    Ok(())
}
