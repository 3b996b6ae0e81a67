//! Cross-repository copy: everything re-keys, round-trips, and a second
//! run is a no-op.

mod common;

use anyhow::Result;

use kloset::backend::Kind;
use kloset::cancel::CancelToken;
use kloset::exporter::memory::MemoryExporter;
use kloset::importer::memory::MemoryImporter;
use kloset::restore::{self, RestoreOptions};
use kloset::sync::synchronize;
use kloset::vfs::SearchOpts;

use common::{noise, open_fs, run_backup, test_repo};

#[test]
fn sync_round_trips_and_rekeys() -> Result<()> {
    let (src, _) = test_repo();
    let (dst, _) = test_repo();

    let content = noise(120 * 1024, 17);
    let importer = MemoryImporter::new()
        .with_file("/data.bin", &content, 0o640)
        .with_file("/notes/a.txt", b"alpha\n", 0o644)
        .with_symlink("/link", "data.bin")
        .with_xattr("/data.bin", "user.origin", b"synced");

    let snapshot = run_backup(&src, &importer)?;
    let copied = synchronize(&src, &snapshot, &dst, &CancelToken::new())?;

    // Different keys, different identifier space.
    assert_ne!(snapshot, copied);

    let src_fs = open_fs(&src, &snapshot)?;
    let dst_fs = open_fs(&dst, &copied)?;

    let src_object = src_fs.open_object(&src_fs.get_entry("/data.bin")?)?;
    let dst_object = dst_fs.open_object(&dst_fs.get_entry("/data.bin")?)?;
    assert_eq!(src_object.chunks.len(), dst_object.chunks.len());
    assert_ne!(
        src_object.content_mac, dst_object.content_mac,
        "content identity re-keys under the destination"
    );

    // The xattr came along, re-keyed.
    let item = dst_fs
        .xattr("/data.bin", "user.origin")?
        .expect("xattr synced");
    assert_eq!(item.size, 6);

    // And the bytes restore identically from the destination.
    let exporter = MemoryExporter::new();
    restore::restore(
        &dst,
        &copied,
        &exporter,
        &RestoreOptions::default(),
        &CancelToken::new(),
    )?;
    assert_eq!(exporter.file("/data.bin"), Some(content));
    assert_eq!(exporter.file("/notes/a.txt"), Some(b"alpha\n".to_vec()));
    Ok(())
}

#[test]
fn sync_is_idempotent() -> Result<()> {
    let (src, _) = test_repo();
    let (dst, dst_backend) = test_repo();

    let importer = MemoryImporter::new()
        .with_file("/a.txt", b"aaa\n", 0o644)
        .with_file("/b.bin", &noise(64 * 1024, 9), 0o644);
    let snapshot = run_backup(&src, &importer)?;

    let first = synchronize(&src, &snapshot, &dst, &CancelToken::new())?;
    let packs_after_first = dst_backend.bytes_stored(Kind::Packfile);
    let states_after_first = {
        use kloset::backend::Backend;
        let b: &dyn Backend = dst_backend.as_ref();
        b.list(Kind::State)?.len()
    };

    let second = synchronize(&src, &snapshot, &dst, &CancelToken::new())?;
    assert_eq!(first, second, "same source, same destination identifier");

    // Zero new blobs and zero new state files the second time.
    assert_eq!(dst_backend.bytes_stored(Kind::Packfile), packs_after_first);
    {
        use kloset::backend::Backend;
        let b: &dyn Backend = dst_backend.as_ref();
        assert_eq!(b.list(Kind::State)?.len(), states_after_first);
    }
    Ok(())
}

#[test]
fn sync_carries_the_content_type_index() -> Result<()> {
    let (src, _) = test_repo();
    let (dst, _) = test_repo();

    let importer = MemoryImporter::new().with_file("/readme.txt", b"text here\n", 0o644);
    let snapshot = run_backup(&src, &importer)?;
    let copied = synchronize(&src, &snapshot, &dst, &CancelToken::new())?;

    let dst_fs = open_fs(&dst, &copied)?;
    let found = dst_fs.search(&SearchOpts {
        mimes: vec!["text/".to_owned()],
        ..SearchOpts::default()
    })?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, "/readme.txt");
    Ok(())
}

#[test]
fn sync_drops_foreign_signatures() -> Result<()> {
    use kloset::backup::BackupOptions;
    use kloset::snapshot::SnapshotSigner;

    let (src, _) = test_repo();
    let (dst, _) = test_repo();

    let importer = MemoryImporter::new().with_file("/signed.txt", b"signed\n", 0o644);
    let opts = BackupOptions {
        signer: Some(SnapshotSigner::generate()),
        ..BackupOptions::default()
    };
    let snapshot = common::run_backup_with_cache(&src, &importer, None, opts)?;
    assert!(src.get_snapshot(&snapshot)?.identity.is_some());

    // The destination can't re-sign; the copied header carries no identity
    // rather than an unverifiable one.
    let copied = synchronize(&src, &snapshot, &dst, &CancelToken::new())?;
    assert!(dst.get_snapshot(&copied)?.identity.is_none());
    Ok(())
}
