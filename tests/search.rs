//! Mime- and name-filtered search, with and without the content-type index.

mod common;

use anyhow::Result;
use globset::{Glob, GlobSetBuilder};

use kloset::importer::memory::MemoryImporter;
use kloset::vfs::SearchOpts;

use common::{open_fs, run_backup, test_repo};

// A minimal valid PNG header is enough for the extension to classify it.
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0];

fn fixture() -> MemoryImporter {
    MemoryImporter::new()
        .with_file("/a.txt", b"plain text\n", 0o644)
        .with_file("/pics/b.png", PNG, 0o644)
        .with_file("/pics/deep/c.png", PNG, 0o644)
}

#[test]
fn search_by_mime() -> Result<()> {
    let (repo, _) = test_repo();
    let snapshot = run_backup(&repo, &fixture())?;
    let fs = open_fs(&repo, &snapshot)?;

    let images = fs.search(&SearchOpts {
        mimes: vec!["image/".to_owned()],
        ..SearchOpts::default()
    })?;
    let paths: Vec<&str> = images.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["/pics/b.png", "/pics/deep/c.png"]);

    // The exact mime matches the same set.
    let exact = fs.search(&SearchOpts {
        mimes: vec!["image/png".to_owned()],
        ..SearchOpts::default()
    })?;
    assert_eq!(exact.len(), 2);

    let text = fs.search(&SearchOpts {
        mimes: vec!["text/".to_owned()],
        ..SearchOpts::default()
    })?;
    assert_eq!(text.len(), 1);
    assert_eq!(text[0].0, "/a.txt");
    Ok(())
}

#[test]
fn search_scoped_to_a_prefix() -> Result<()> {
    let (repo, _) = test_repo();
    let snapshot = run_backup(&repo, &fixture())?;
    let fs = open_fs(&repo, &snapshot)?;

    let scoped = fs.search(&SearchOpts {
        prefix: "/pics/deep".to_owned(),
        mimes: vec!["image/".to_owned()],
        ..SearchOpts::default()
    })?;
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].0, "/pics/deep/c.png");

    // Non-recursive stops at direct children.
    let flat = fs.search(&SearchOpts {
        prefix: "/pics".to_owned(),
        recursive: false,
        ..SearchOpts::default()
    })?;
    let paths: Vec<&str> = flat.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["/pics/b.png"]);
    Ok(())
}

#[test]
fn search_by_name_glob() -> Result<()> {
    let (repo, _) = test_repo();
    let snapshot = run_backup(&repo, &fixture())?;
    let fs = open_fs(&repo, &snapshot)?;

    let mut globs = GlobSetBuilder::new();
    globs.add(Glob::new("*.png")?);

    let found = fs.search(&SearchOpts {
        names: Some(globs.build()?),
        ..SearchOpts::default()
    })?;
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|(p, _)| p.ends_with(".png")));
    Ok(())
}
