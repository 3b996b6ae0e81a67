use std::fs::File;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::archive::{self, ArchiveFormat};
use crate::cancel::CancelToken;

/// Export a snapshot subtree as a tar, tar.gz, or zip archive.
#[derive(Debug, Parser)]
pub struct Args {
    /// Snapshot ID prefix, or "latest"
    snapshot: String,

    /// Where to write the archive
    #[clap(short, long)]
    output: Utf8PathBuf,

    /// Archive format (tar, tar.gz, zip); inferred from --output if omitted
    #[clap(short, long)]
    format: Option<String>,

    /// Subtree to archive
    #[clap(default_value = "/")]
    path: String,
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let (repo, _) = super::open_repository(repository)?;
    let snapshot = super::find_snapshot(&repo, &args.snapshot)?;

    let format: ArchiveFormat = match &args.format {
        Some(name) => name.parse()?,
        None => infer_format(&args.output)?,
    };

    let out = File::create(&args.output)
        .with_context(|| format!("Couldn't create {}", args.output))?;
    archive::archive(&repo, &snapshot, &args.path, format, out, &CancelToken::new())?;

    println!("Archived snapshot {} to {}", snapshot.short_name(), args.output);
    Ok(())
}

fn infer_format(output: &Utf8Path) -> Result<ArchiveFormat> {
    let name = output.as_str();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(ArchiveFormat::TarGz)
    } else if name.ends_with(".tar") {
        Ok(ArchiveFormat::Tar)
    } else if name.ends_with(".zip") {
        Ok(ArchiveFormat::Zip)
    } else {
        anyhow::bail!("Couldn't infer an archive format from {output}; pass --format")
    }
}
