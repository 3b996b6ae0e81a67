//! Partial failures stay partial: unreadable files become error records,
//! and a crash between packfile write and state flush leaks a pack but
//! never a broken snapshot.

mod common;

use std::sync::Arc;

use anyhow::Result;

use kloset::backend::memory::MemoryBackend;
use kloset::cache::MemoryStore;
use kloset::cancel::CancelToken;
use kloset::exporter::memory::MemoryExporter;
use kloset::importer::memory::MemoryImporter;
use kloset::mac::Mac;
use kloset::packer::Packer;
use kloset::repository::{Repository, RepositoryKey};
use kloset::resource::ResourceType;
use kloset::restore::{self, RestoreOptions};

use common::{open_fs, run_backup, test_config, test_repo};

#[test]
fn unreadable_file_is_recorded_not_fatal() -> Result<()> {
    let (repo, _) = test_repo();
    let importer = MemoryImporter::new()
        .with_file("/ok.txt", b"fine\n", 0o644)
        .with_denied("/denied.txt");

    // The backup commits despite the unreadable file.
    let snapshot = run_backup(&repo, &importer)?;
    let fs = open_fs(&repo, &snapshot)?;

    let errors = fs.errors("/")?;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].name, "/denied.txt");
    assert!(errors[0].error.contains("permission"));

    // The failing file has no entry; the readable one restores fine.
    assert!(fs.get_entry("/denied.txt").is_err());
    let summary = fs.get_entry("/")?.summary.unwrap();
    assert_eq!(summary.below.errors, 1);
    assert_eq!(summary.directory.errors, 1);

    let exporter = MemoryExporter::new();
    let report = restore::restore(
        &repo,
        &snapshot,
        &exporter,
        &RestoreOptions::default(),
        &CancelToken::new(),
    )?;
    assert!(report.errors.is_empty());
    assert_eq!(exporter.file("/ok.txt"), Some(b"fine\n".to_vec()));
    Ok(())
}

#[test]
fn root_scan_failure_aborts() {
    let (repo, _) = test_repo();
    // An importer whose root can't be scanned at all.
    struct BrokenImporter;
    impl kloset::importer::Importer for BrokenImporter {
        fn kind(&self) -> &'static str {
            "broken"
        }
        fn origin(&self) -> String {
            "nowhere".to_owned()
        }
        fn root(&self) -> String {
            "/".to_owned()
        }
        fn scan(&self) -> kloset::Result<crossbeam_channel::Receiver<kloset::importer::ScanResult>>
        {
            let (tx, rx) = crossbeam_channel::bounded(1);
            tx.send(kloset::importer::ScanResult::Error(
                kloset::importer::ScanError {
                    pathname: "/".to_owned(),
                    error: "device not ready".to_owned(),
                },
            ))
            .unwrap();
            Ok(rx)
        }
        fn reader(&self, _: &str) -> kloset::Result<Box<dyn std::io::Read + Send>> {
            unreachable!()
        }
        fn xattr_reader(&self, _: &str, _: &str) -> kloset::Result<Box<dyn std::io::Read + Send>> {
            unreachable!()
        }
    }

    let result = common::run_backup(&repo, &BrokenImporter);
    assert!(result.is_err());
    assert!(repo.snapshots().is_empty());
}

/// A pack written durably whose state file never lands: the repository
/// reopens clean, the pack sits orphaned, nothing references it.
#[test]
fn leaked_packfile_is_harmless() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let key = RepositoryKey::generate();
    let repo = Arc::new(Repository::create(
        backend.clone(),
        test_config(),
        key.clone(),
    )?);

    let packer = Packer::spawn(
        repo.clone(),
        Arc::new(MemoryStore::new()),
        Mac::from_bytes([0xcc; 32]),
        CancelToken::new(),
    );
    let chunk_mac = repo.mac(b"doomed bytes");
    packer.put_blob(ResourceType::Chunk, chunk_mac, b"doomed bytes".to_vec())?;
    packer.finish()?;
    // Crash here: the pack is on the backend, the state flush never ran.
    drop(repo);

    let reopened = Arc::new(Repository::open(backend.clone(), key)?);
    assert!(reopened.snapshots().is_empty());
    assert!(!reopened.blob_exists(ResourceType::Chunk, &chunk_mac));

    // The leaked pack exists but no state references it.
    use kloset::backend::{Backend, Kind};
    let b: &dyn Backend = backend.as_ref();
    assert_eq!(b.list(Kind::Packfile)?.len(), 1);
    assert!(reopened.state().referenced_packfiles().is_empty());
    Ok(())
}

#[test]
fn canceled_backup_leaves_no_snapshot() -> Result<()> {
    let (repo, _) = test_repo();
    let importer = MemoryImporter::new().with_file("/x.txt", b"x", 0o644);

    let cancel = CancelToken::new();
    cancel.cancel();
    let result = kloset::backup::backup(
        &repo,
        &importer,
        Arc::new(MemoryStore::new()),
        None,
        kloset::backup::BackupOptions::default(),
        cancel,
    );
    assert!(result.is_err());
    assert!(kloset::error::was_canceled(&result.unwrap_err()));
    assert!(repo.snapshots().is_empty());
    Ok(())
}
