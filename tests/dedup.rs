//! Deduplication: identical content is stored once, and backing the same
//! source up twice writes no new chunks.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;

use kloset::backup::BackupOptions;
use kloset::cache::MemoryStore;
use kloset::importer::memory::MemoryImporter;
use kloset::mac::Mac;
use kloset::resource::ResourceType;

use common::{noise, open_fs, run_backup, run_backup_with_cache, test_repo};

#[test]
fn identical_files_share_chunks() -> Result<()> {
    let (repo, _) = test_repo();
    let content = noise(200 * 1024, 3);
    let importer = MemoryImporter::new()
        .with_file("/a.bin", &content, 0o644)
        .with_file("/b.bin", &content, 0o644);

    let snapshot = run_backup(&repo, &importer)?;
    let fs = open_fs(&repo, &snapshot)?;

    let a = fs.open_object(&fs.get_entry("/a.bin")?)?;
    let b = fs.open_object(&fs.get_entry("/b.bin")?)?;

    let chunks_a: Vec<Mac> = a.chunks.iter().map(|c| c.content_mac).collect();
    let chunks_b: Vec<Mac> = b.chunks.iter().map(|c| c.content_mac).collect();
    assert_eq!(chunks_a, chunks_b);

    // The union across both files is no bigger than one file's chunk list.
    let distinct: BTreeSet<Mac> = chunks_a.iter().chain(chunks_b.iter()).copied().collect();
    assert_eq!(distinct.len(), chunks_a.len());

    // And the repository stored each exactly once.
    assert_eq!(
        repo.state().blobs_of(ResourceType::Chunk).len(),
        distinct.len()
    );
    Ok(())
}

#[test]
fn second_backup_writes_no_new_chunks() -> Result<()> {
    let (repo, _) = test_repo();
    let content = noise(150 * 1024, 11);
    let importer = MemoryImporter::new()
        .with_file("/data.bin", &content, 0o644)
        .with_file("/readme.txt", b"read me\n", 0o644);

    let vfs_cache = Arc::new(MemoryStore::new());
    let first = run_backup_with_cache(
        &repo,
        &importer,
        Some(vfs_cache.clone()),
        BackupOptions::default(),
    )?;
    let chunks_after_first = repo.state().blobs_of(ResourceType::Chunk);

    let second = run_backup_with_cache(
        &repo,
        &importer,
        Some(vfs_cache),
        BackupOptions::default(),
    )?;
    assert_ne!(first, second, "snapshots have distinct identifiers");

    // Same referenced chunk set, zero new chunk blobs.
    let chunks_after_second = repo.state().blobs_of(ResourceType::Chunk);
    assert_eq!(chunks_after_first, chunks_after_second);

    // Both snapshots read back the same bytes.
    for snapshot in [&first, &second] {
        let fs = open_fs(&repo, snapshot)?;
        let object = fs.open_object(&fs.get_entry("/data.bin")?)?;
        assert_eq!(object.size(), content.len() as u64);
    }
    Ok(())
}

#[test]
fn shifted_content_mostly_dedupes() -> Result<()> {
    let (repo, _) = test_repo();
    let content = noise(400 * 1024, 5);

    let importer = MemoryImporter::new().with_file("/log.bin", &content, 0o644);
    run_backup(&repo, &importer)?;
    let before = repo.state().blobs_of(ResourceType::Chunk).len();

    // Append a little; content-defined chunking should only add a few
    // chunks at the tail.
    let mut appended = content.clone();
    appended.extend_from_slice(b"one more log line\n");
    let importer = MemoryImporter::new().with_file("/log.bin", &appended, 0o644);
    run_backup(&repo, &importer)?;
    let after = repo.state().blobs_of(ResourceType::Chunk).len();

    let new_chunks = after - before;
    assert!(
        new_chunks <= 3,
        "appending one line should add a few chunks, not {new_chunks}"
    );
    Ok(())
}
