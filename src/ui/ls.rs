use anyhow::Result;
use camino::Utf8Path;
use clap::Parser;

use crate::vfs::{EntryKind, Filesystem};

/// Print a snapshot's tree.
#[derive(Debug, Parser)]
pub struct Args {
    /// Snapshot ID prefix, or "latest"
    snapshot: String,

    /// Subtree to list
    #[clap(default_value = "/")]
    path: String,

    /// Only direct children instead of the whole subtree
    #[clap(short, long)]
    flat: bool,
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let (repo, _) = super::open_repository(repository)?;
    let snapshot = super::find_snapshot(&repo, &args.snapshot)?;
    let header = repo.get_snapshot(&snapshot)?;

    for source in &header.sources {
        let fs = Filesystem::open(repo.clone(), &source.vfs, None);
        if args.flat {
            for entry in fs.children(&args.path)? {
                print_entry(&entry.path(), entry.kind(), entry.symlink_target.as_deref());
            }
        } else {
            for item in fs.walk(&args.path)? {
                let (path, entry) = item?;
                print_entry(&path, entry.kind(), entry.symlink_target.as_deref());
            }
        }
    }
    Ok(())
}

fn print_entry(path: &str, kind: EntryKind, target: Option<&str>) {
    match kind {
        EntryKind::Directory if path != "/" => println!("{path}/"),
        EntryKind::Symlink => println!("{path} -> {}", target.unwrap_or("?")),
        _ => println!("{path}"),
    }
}
