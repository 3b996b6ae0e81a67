//! The backup pipeline: scan, chunk, deduplicate, pack, commit.
//!
//! ```text
//! Importer ──► scan channel ──► file workers ──► Packer ──► packfiles
//!                                   │                          │
//!                                   └──► scan cache ◄── deltas ┘
//! ```
//!
//! Per-file errors (unreadable files, chunking failures) land in the error
//! tree and the backup carries on; a failed packfile or state write is
//! fatal. The snapshot header is packed last, so a crash anywhere earlier
//! leaves at most orphaned packs, never a readable-but-broken snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::cache::{self, KvStore, namespaces};
use crate::cancel::CancelToken;
use crate::chunk;
use crate::counters;
use crate::error::Error;
use crate::importer::{Importer, ScanRecord, ScanResult};
use crate::lock;
use crate::mac::Mac;
use crate::object::{Chunk, Object, shannon_entropy};
use crate::packer::Packer;
use crate::repository::Repository;
use crate::resource::ResourceType;
use crate::snapshot::{ImporterInfo, IndexDescriptor, SnapshotHeader, SnapshotSigner, Source};
use crate::vfs::{self, EntryKind, ErrorItem, Summary, VfsEntry, VfsRoots, XattrItem};

/// Hook invoked per regular file; whatever labels it returns are recorded
/// on the entry and queryable later.
pub type Classifier = Box<dyn Fn(&str, &Object) -> Vec<String> + Send + Sync>;

pub struct BackupOptions {
    pub name: String,
    pub tags: Vec<String>,
    /// Glob patterns; a matching path (and everything under it) is skipped.
    pub excludes: Vec<String>,
    /// File workers; 0 means one per CPU.
    pub max_concurrency: usize,
    pub signer: Option<SnapshotSigner>,
    pub classifier: Option<Classifier>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            name: "untitled".to_owned(),
            tags: Vec::new(),
            excludes: Vec::new(),
            max_concurrency: 0,
            signer: None,
            classifier: None,
        }
    }
}

/// A non-directory entry as the scan cache remembers it: the entry itself
/// plus the content stats the directory rollup needs. This doubles as the
/// next backup's change-detection cache.
#[derive(Debug, Serialize, Deserialize)]
struct CachedFile {
    entry: VfsEntry,
    entry_mac: Mac,
    chunks: u64,
    entropy: f64,
    content_type: String,
}

/// A directory awaiting (then holding) its rolled-up summary.
#[derive(Debug, Serialize, Deserialize)]
struct CachedDir {
    entry: VfsEntry,
    entry_mac: Option<Mac>,
}

fn depth_of(path: &str) -> usize {
    if path == "/" {
        0
    } else {
        path.bytes().filter(|b| *b == b'/').count()
    }
}

/// Directory cache keys embed the depth so a reverse scan visits the
/// deepest directories first.
fn dir_key(path: &str) -> Vec<u8> {
    cache::namespaced(
        namespaces::DIRECTORY,
        format!("{:04}:{path}", depth_of(path)).as_bytes(),
    )
}

fn dir_path_of_key(key: &[u8]) -> &str {
    let raw = cache::strip_namespace(namespaces::DIRECTORY, key);
    // "NNNN:" prefix off.
    std::str::from_utf8(&raw[5..]).expect("directory keys are UTF-8")
}

struct PipelineCtx<'a> {
    repo: &'a Arc<Repository>,
    importer: &'a dyn Importer,
    /// Fresh per snapshot; owns the pipeline's scratch state.
    scan_cache: &'a Arc<dyn KvStore>,
    /// Persistent per source; previous entries drive change detection.
    vfs_cache: Option<&'a Arc<dyn KvStore>>,
    packer: &'a Packer,
    excludes: &'a GlobSet,
    classifier: Option<&'a Classifier>,
    cancel: &'a CancelToken,
    files: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl PipelineCtx<'_> {
    fn record_error(&self, pathname: &str, message: &str) -> Result<()> {
        warn!("{pathname}: {message}");
        let item = ErrorItem::new(pathname.to_owned(), message.to_owned());
        let bytes = item.to_bytes()?;
        let mac = self.repo.mac(&bytes);
        self.packer
            .put_blob_if_not_exists(ResourceType::ErrorEntry, mac, bytes)?;
        self.scan_cache.put(
            &cache::namespaced(namespaces::ERROR, pathname.as_bytes()),
            &rmp_serde::to_vec(&item).map_err(|e| Error::Internal(e.to_string()))?,
        )?;
        self.errors.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Is this failure about one file (record it, move on) or about the
/// backup itself?
fn recordable(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<Error>(),
        Some(Error::Io(_) | Error::NotFound(_) | Error::InvalidArgument(_))
    )
}

/// Run a full backup of `importer` into `repo`, returning the new
/// snapshot's identifier.
///
/// `scan_cache` must be fresh; the snapshot owns it for the duration.
/// `vfs_cache` is the source's persistent cache: hand the same one back
/// on the next run and unchanged files are reused without rechunking.
pub fn backup(
    repo: &Arc<Repository>,
    importer: &dyn Importer,
    scan_cache: Arc<dyn KvStore>,
    vfs_cache: Option<Arc<dyn KvStore>>,
    opts: BackupOptions,
    cancel: CancelToken,
) -> Result<Mac> {
    let _lock = lock::acquire_shared(repo)?;
    let started = Instant::now();
    let timestamp = jiff::Timestamp::now();

    let excludes = build_excludes(&opts.excludes)?;

    // The scan cache ties packs to the snapshot before its identifier is
    // knowable; a random transaction tag stands in for it.
    let txn = {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Mac::from_bytes(bytes)
    };
    let packer = Packer::spawn(repo.clone(), scan_cache.clone(), txn, cancel.clone());

    let ctx = PipelineCtx {
        repo,
        importer,
        scan_cache: &scan_cache,
        vfs_cache: vfs_cache.as_ref(),
        packer: &packer,
        excludes: &excludes,
        classifier: opts.classifier.as_ref(),
        cancel: &cancel,
        files: AtomicU64::new(0),
        bytes: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    };

    info!("Scanning {} ({})", importer.root(), importer.kind());
    let records = importer.scan()?;
    let worker_count = if opts.max_concurrency == 0 {
        num_cpus::get()
    } else {
        opts.max_concurrency
    };

    let walk_result: Result<()> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..worker_count)
            .map(|_| {
                let records = records.clone();
                let ctx = &ctx;
                s.spawn(move || worker_loop(ctx, records))
            })
            .collect();
        let mut failure = None;
        for handle in handles {
            if let Err(e) = handle.join().unwrap() {
                failure = Some(e);
            }
        }
        match failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    });
    if let Err(e) = walk_result {
        cancel.cancel();
        let _ = packer.finish();
        return Err(e);
    }

    // Everything scanned; roll summaries up from the deepest directories,
    // persist the index trees, and only then let the header exist.
    let outcome: Result<(Summary, VfsRoots, Option<IndexDescriptor>)> = (|| {
        let root_summary = rollup_directories(&ctx)?;
        let (roots, index) = persist_trees(&ctx)?;
        Ok((root_summary, roots, index))
    })();
    let (root_summary, roots, index) = match outcome {
        Ok(parts) => parts,
        Err(e) => {
            cancel.cancel();
            let _ = packer.finish();
            return Err(e);
        }
    };

    // ctx borrows the packer; pull the counters out before finish()
    // consumes it.
    let (files, bytes, errors) = (
        ctx.files.load(Ordering::Relaxed),
        ctx.bytes.load(Ordering::Relaxed),
        ctx.errors.load(Ordering::Relaxed),
    );
    drop(ctx);

    let mut header = SnapshotHeader::new(opts.name);
    header.timestamp = timestamp.as_nanosecond() as i64;
    header.duration_ms = started.elapsed().as_millis() as u64;
    header.tags = opts.tags;
    header.identity = opts.signer.as_ref().map(|s| s.identity().clone());
    header.sources.push(Source {
        importer: ImporterInfo {
            kind: importer.kind().to_owned(),
            origin: importer.origin(),
            directory: importer.root(),
        },
        context: Vec::new(),
        vfs: roots,
        indexes: index.into_iter().collect(),
        summary: root_summary,
    });

    let header_bytes = header.to_bytes()?;
    let identifier = repo.mac(&header_bytes);

    if let Some(signer) = &opts.signer {
        packer.put_blob(
            ResourceType::Signature,
            identifier,
            signer.sign(&identifier),
        )?;
    }
    packer.put_blob(ResourceType::Snapshot, identifier, header_bytes)?;

    // Commit: drain the packer, then push the final state file. The header
    // delta rides in it, so the snapshot becomes visible atomically.
    packer.finish()?;
    repo.flush_transaction()?;

    // Only after commit: promote this snapshot's entries into the
    // source's persistent cache for the next run's change detection.
    if let Some(vfs_cache) = &vfs_cache {
        let file_ns = cache::namespaced(namespaces::FILE, b"");
        for (key, value) in scan_cache.scan_prefix(&file_ns)? {
            vfs_cache.put(&key, &value)?;
        }
    }

    info!(
        "Snapshot {} done: {files} files, {bytes} bytes, {errors} errors in {:?}",
        identifier.short_name(),
        started.elapsed(),
    );
    Ok(identifier)
}

fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Bad exclude glob {pattern}"))?);
    }
    Ok(builder.build()?)
}

fn worker_loop(
    ctx: &PipelineCtx<'_>,
    records: crossbeam_channel::Receiver<ScanResult>,
) -> Result<()> {
    while let Ok(result) = records.recv() {
        ctx.cancel.check()?;
        match result {
            ScanResult::Error(scan_error) => {
                if scan_error.pathname == "/" {
                    // Can't scan the root: there is no backup to salvage.
                    bail!(
                        "failed to scan source root: {}",
                        scan_error.error
                    );
                }
                ctx.record_error(&scan_error.pathname, &scan_error.error)?;
            }
            ScanResult::Record(record) => {
                if ctx.excludes.is_match(&record.pathname) {
                    debug!("{:>9} {}", "skip", record.pathname);
                    continue;
                }
                process_record(ctx, record)?;
            }
        }
    }
    Ok(())
}

fn process_record(ctx: &PipelineCtx<'_>, record: ScanRecord) -> Result<()> {
    if record.xattr_name.is_some() {
        // Xattrs emitted as their own records ride the same path as the
        // ones listed on a file record.
        let name = record.xattr_name.clone().unwrap();
        if let Err(e) = store_xattr(ctx, &record.pathname, &name) {
            if recordable(&e) {
                return ctx.record_error(&record.pathname, &format!("xattr {name}: {e}"));
            }
            return Err(e);
        }
        return Ok(());
    }

    let (parent, _) = vfs::split_path(&record.pathname);
    let entry = VfsEntry::new(parent, record.file_info.clone());

    if entry.kind() == EntryKind::Directory {
        let cached = CachedDir {
            entry,
            entry_mac: None,
        };
        ctx.scan_cache.put(
            &dir_key(&record.pathname),
            &rmp_serde::to_vec(&cached).map_err(|e| Error::Internal(e.to_string()))?,
        )?;
        return Ok(());
    }

    match process_leaf(ctx, &record, entry) {
        Ok(()) => Ok(()),
        Err(e) if recordable(&e) => ctx.record_error(&record.pathname, &format!("{e:#}")),
        Err(e) => Err(e),
    }
}

fn process_leaf(ctx: &PipelineCtx<'_>, record: &ScanRecord, mut entry: VfsEntry) -> Result<()> {
    let pathname = &record.pathname;
    let mut chunks = 0u64;
    let mut entropy = 0.0f64;
    let mut content_type = String::new();

    match entry.kind() {
        EntryKind::File => {
            let stored = reuse_or_chunk(ctx, record)?;
            entry.object = Some(stored.object_mac);
            entry.classifications = stored.classifications;
            chunks = stored.chunks;
            entropy = stored.entropy;
            content_type = stored.content_type;
            ctx.files.fetch_add(1, Ordering::Relaxed);
            ctx.bytes
                .fetch_add(record.file_info.size, Ordering::Relaxed);
        }
        EntryKind::Symlink => {
            entry.symlink_target = record.target.clone();
        }
        _ => {}
    }

    for name in &record.xattr_names {
        match store_xattr(ctx, pathname, name) {
            Ok(()) => entry.xattr_names.push(name.clone()),
            Err(e) if recordable(&e) => {
                ctx.record_error(pathname, &format!("xattr {name}: {e}"))?;
            }
            Err(e) => return Err(e),
        }
    }

    let entry_bytes = entry.to_bytes()?;
    let entry_mac = ctx.repo.mac(&entry_bytes);
    ctx.packer
        .put_blob_if_not_exists(ResourceType::VfsEntry, entry_mac, entry_bytes)?;

    if !content_type.is_empty() {
        ctx.scan_cache.put(
            &cache::namespaced(
                namespaces::INDEX,
                format!("/{content_type}{pathname}").as_bytes(),
            ),
            entry_mac.as_bytes(),
        )?;
    }

    let cached = CachedFile {
        entry,
        entry_mac,
        chunks,
        entropy,
        content_type,
    };
    ctx.scan_cache.put(
        &cache::namespaced(namespaces::FILE, pathname.as_bytes()),
        &rmp_serde::to_vec(&cached).map_err(|e| Error::Internal(e.to_string()))?,
    )?;
    Ok(())
}

/// What a file contributed, whether chunked fresh or reused.
struct StoredContent {
    object_mac: Mac,
    chunks: u64,
    entropy: f64,
    content_type: String,
    classifications: Vec<String>,
}

/// Either reuse the previous backup's object for an unchanged file, or
/// open, chunk, and pack it.
fn reuse_or_chunk(ctx: &PipelineCtx<'_>, record: &ScanRecord) -> Result<StoredContent> {
    let pathname = &record.pathname;

    if let Some(vfs_cache) = ctx.vfs_cache {
        if let Some(previous) =
            vfs_cache.get(&cache::namespaced(namespaces::FILE, pathname.as_bytes()))?
        {
            if let Ok(cached) = rmp_serde::from_slice::<CachedFile>(&previous) {
                if let Some(object_mac) = cached.entry.object {
                    if cached.entry.file_info.same_content(&record.file_info)
                        && ctx.packer.blob_exists(ResourceType::Object, &object_mac)
                    {
                        counters::bump(counters::Op::EntryCacheHit);
                        debug!("{:>9} {pathname}", "unchanged");
                        return Ok(StoredContent {
                            object_mac,
                            chunks: cached.chunks,
                            entropy: cached.entropy,
                            content_type: cached.content_type,
                            classifications: cached.entry.classifications,
                        });
                    }
                }
            }
            counters::bump(counters::Op::EntryCacheMiss);
        }
    }

    let reader = ctx
        .importer
        .reader(pathname)
        .map_err(|e| anyhow::Error::from(e).context(format!("Can't open {pathname}")))?;

    let config = ctx.repo.config().chunking;
    let mut content_hasher = ctx.repo.codec().hasher();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut entropy_weighted = 0.0f64;
    let mut total_len = 0u64;
    let mut sniffed: Option<&'static str> = None;

    for chunk_bytes in chunk::chunks(reader, &config) {
        ctx.cancel.check()?;
        let bytes = chunk_bytes?;
        if sniffed.is_none() {
            sniffed = Some(sniff_text(&bytes));
        }
        content_hasher.update(&bytes);
        let mac = ctx.repo.mac(&bytes);
        let chunk_entropy = shannon_entropy(&bytes);
        let length = bytes.len() as u32;
        entropy_weighted += chunk_entropy * length as f64;
        total_len += length as u64;

        if ctx
            .packer
            .put_blob_if_not_exists(ResourceType::Chunk, mac, bytes)?
        {
            counters::bump(counters::Op::ChunkPacked);
        } else {
            counters::bump(counters::Op::ChunkDeduped);
        }
        chunks.push(Chunk::new(mac, length, chunk_entropy));
    }

    if chunks.is_empty() {
        // Empty files still carry exactly one (empty) chunk.
        let mac = ctx.repo.mac(b"");
        ctx.packer
            .put_blob_if_not_exists(ResourceType::Chunk, mac, Vec::new())?;
        chunks.push(Chunk::new(mac, 0, 0.0));
    }

    let content_mac = content_hasher.finalize();
    let entropy = if total_len > 0 {
        entropy_weighted / total_len as f64
    } else {
        0.0
    };
    let content_type = mime_guess::from_path(&record.file_info.name)
        .first_raw()
        .map(str::to_owned)
        .unwrap_or_else(|| sniffed.unwrap_or("application/octet-stream").to_owned());

    let object = Object::new(content_mac, content_type, entropy, chunks);
    let object_bytes = object.to_bytes()?;
    let object_mac = ctx.repo.mac(&object_bytes);
    let classifications = match ctx.classifier {
        Some(classify) => classify(pathname, &object),
        None => Vec::new(),
    };
    ctx.packer
        .put_blob_if_not_exists(ResourceType::Object, object_mac, object_bytes)?;

    debug!(
        "{:>9} {pathname} ({} chunks)",
        "backup",
        object.chunks.len()
    );
    Ok(StoredContent {
        object_mac,
        chunks: object.chunks.len() as u64,
        entropy: object.entropy,
        content_type: object.content_type,
        classifications,
    })
}

/// "Is it text?" from the first chunk, for files whose extension says
/// nothing. Tolerates a UTF-8 sequence cut at the chunk boundary.
fn sniff_text(sample: &[u8]) -> &'static str {
    let sample = &sample[..sample.len().min(4096)];
    if sample.is_empty() || sample.contains(&0) {
        return "application/octet-stream";
    }
    match std::str::from_utf8(sample) {
        Ok(_) => "text/plain",
        Err(e) if e.valid_up_to() + 3 >= sample.len() => "text/plain",
        Err(_) => "application/octet-stream",
    }
}

fn store_xattr(ctx: &PipelineCtx<'_>, pathname: &str, name: &str) -> Result<()> {
    let mut reader = ctx.importer.xattr_reader(pathname, name)?;
    let mut content = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut content)?;

    let chunk_mac = ctx.repo.mac(&content);
    let length = content.len() as u32;
    let chunk_entropy = shannon_entropy(&content);
    let content_mac = chunk_mac;
    ctx.packer
        .put_blob_if_not_exists(ResourceType::Chunk, chunk_mac, content)?;

    let object = Object::new(
        content_mac,
        "application/octet-stream".to_owned(),
        chunk_entropy,
        vec![Chunk::new(chunk_mac, length, chunk_entropy)],
    );
    let object_bytes = object.to_bytes()?;
    let object_mac = ctx.repo.mac(&object_bytes);
    ctx.packer
        .put_blob_if_not_exists(ResourceType::Object, object_mac, object_bytes)?;

    let item = XattrItem {
        version: crate::resource::current_version(ResourceType::XattrEntry),
        parent: pathname.to_owned(),
        name: name.to_owned(),
        kind: "extended".to_owned(),
        object: object_mac,
        size: length as u64,
    };
    let item_bytes = item.to_bytes()?;
    let item_mac = ctx.repo.mac(&item_bytes);
    ctx.packer
        .put_blob_if_not_exists(ResourceType::XattrEntry, item_mac, item_bytes)?;
    ctx.scan_cache.put(
        &cache::namespaced(
            namespaces::XATTR,
            vfs::xattr_key(pathname, name).as_bytes(),
        ),
        &rmp_serde::to_vec(&item).map_err(|e| Error::Internal(e.to_string()))?,
    )?;
    Ok(())
}

/// Deepest directories first: fold each directory's direct children into
/// its summary, then let its parent fold that in turn.
fn rollup_directories(ctx: &PipelineCtx<'_>) -> Result<Summary> {
    let mut root_summary = None;

    let dir_ns = cache::namespaced(namespaces::DIRECTORY, b"");
    for (key, value) in ctx.scan_cache.scan_prefix_rev(&dir_ns)? {
        ctx.cancel.check()?;
        let path = dir_path_of_key(&key).to_owned();
        let mut cached: CachedDir = rmp_serde::from_slice(&value)
            .map_err(|e| Error::Internal(format!("directory cache decoding: {e}")))?;

        let mut summary = Summary::default();
        let child_prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };

        // Direct leaf children.
        let file_ns = cache::namespaced(namespaces::FILE, child_prefix.as_bytes());
        for (file_key, file_value) in ctx.scan_cache.scan_prefix(&file_ns)? {
            let rest = &file_key[file_ns.len()..];
            if rest.contains(&b'/') {
                continue;
            }
            let child: CachedFile = rmp_serde::from_slice(&file_value)
                .map_err(|e| Error::Internal(format!("file cache decoding: {e}")))?;
            summary.directory.record_entry(&child.entry);
            if child.entry.object.is_some() {
                summary.directory.record_content(
                    child.chunks,
                    child.entropy,
                    &child.content_type,
                );
            }
        }

        // Direct subdirectories, already rolled up (they're deeper).
        let subdir_ns = cache::namespaced(
            namespaces::DIRECTORY,
            format!("{:04}:{child_prefix}", depth_of(&path) + 1).as_bytes(),
        );
        for (dir_key, dir_value) in ctx.scan_cache.scan_prefix(&subdir_ns)? {
            let rest = &dir_key[subdir_ns.len()..];
            if rest.contains(&b'/') {
                continue;
            }
            let child: CachedDir = rmp_serde::from_slice(&dir_value)
                .map_err(|e| Error::Internal(format!("directory cache decoding: {e}")))?;
            summary.directory.record_entry(&child.entry);
            let child_summary = child
                .entry
                .summary
                .as_ref()
                .ok_or_else(|| Error::Internal(format!("{} rolled up out of order", path)))?;
            summary.below.merge(&child_summary.directory);
            summary.below.merge(&child_summary.below);
        }

        // Errors recorded at paths directly inside this directory.
        let error_ns = cache::namespaced(namespaces::ERROR, child_prefix.as_bytes());
        for (error_key, _) in ctx.scan_cache.scan_prefix(&error_ns)? {
            let rest = &error_key[error_ns.len()..];
            if rest.contains(&b'/') {
                continue;
            }
            summary.directory.errors += 1;
            // `below` reports the subtree total, direct errors included.
            summary.below.errors += 1;
        }

        cached.entry.summary = Some(summary.clone());
        let entry_bytes = cached.entry.to_bytes()?;
        let entry_mac = ctx.repo.mac(&entry_bytes);
        ctx.packer
            .put_blob_if_not_exists(ResourceType::VfsEntry, entry_mac, entry_bytes)?;
        cached.entry_mac = Some(entry_mac);

        ctx.scan_cache.put(
            &key,
            &rmp_serde::to_vec(&cached).map_err(|e| Error::Internal(e.to_string()))?,
        )?;
        if path == "/" {
            root_summary = Some(summary);
        }
    }

    root_summary.ok_or_else(|| anyhow::anyhow!("the importer never scanned its root"))
}

/// Build and persist the entry/error/xattr trees and the content-type
/// index; everything flows through the packer as blobs.
fn persist_trees(ctx: &PipelineCtx<'_>) -> Result<(VfsRoots, Option<IndexDescriptor>)> {
    use crate::btree::{BTree, byte_order, path_order};

    let mut entries = BTree::new(path_order);
    let file_ns = cache::namespaced(namespaces::FILE, b"");
    for (key, value) in ctx.scan_cache.scan_prefix(&file_ns)? {
        let path = std::str::from_utf8(cache::strip_namespace(namespaces::FILE, &key))
            .expect("cache keys are UTF-8")
            .to_owned();
        let cached: CachedFile = rmp_serde::from_slice(&value)
            .map_err(|e| Error::Internal(format!("file cache decoding: {e}")))?;
        entries.insert(path, cached.entry_mac);
    }
    let dir_ns = cache::namespaced(namespaces::DIRECTORY, b"");
    for (key, value) in ctx.scan_cache.scan_prefix(&dir_ns)? {
        let path = dir_path_of_key(&key).to_owned();
        let cached: CachedDir = rmp_serde::from_slice(&value)
            .map_err(|e| Error::Internal(format!("directory cache decoding: {e}")))?;
        let mac = cached
            .entry_mac
            .ok_or_else(|| Error::Internal(format!("{path} never rolled up")))?;
        entries.insert(path, mac);
    }

    let mut errors = BTree::new(path_order);
    let error_ns = cache::namespaced(namespaces::ERROR, b"");
    for (key, value) in ctx.scan_cache.scan_prefix(&error_ns)? {
        let path = std::str::from_utf8(cache::strip_namespace(namespaces::ERROR, &key))
            .expect("cache keys are UTF-8")
            .to_owned();
        let item: ErrorItem = rmp_serde::from_slice(&value)
            .map_err(|e| Error::Internal(format!("error cache decoding: {e}")))?;
        errors.insert(path, ctx.repo.mac(&item.to_bytes()?));
    }

    let mut xattrs = BTree::new(byte_order::<String>);
    let xattr_ns = cache::namespaced(namespaces::XATTR, b"");
    for (key, value) in ctx.scan_cache.scan_prefix(&xattr_ns)? {
        let tree_key = std::str::from_utf8(cache::strip_namespace(namespaces::XATTR, &key))
            .expect("cache keys are UTF-8")
            .to_owned();
        let item: XattrItem = rmp_serde::from_slice(&value)
            .map_err(|e| Error::Internal(format!("xattr cache decoding: {e}")))?;
        xattrs.insert(tree_key, ctx.repo.mac(&item.to_bytes()?));
    }

    let mut content_types = BTree::new(byte_order::<String>);
    let index_ns = cache::namespaced(namespaces::INDEX, b"");
    for (key, value) in ctx.scan_cache.scan_prefix(&index_ns)? {
        let tree_key = std::str::from_utf8(cache::strip_namespace(namespaces::INDEX, &key))
            .expect("cache keys are UTF-8")
            .to_owned();
        let mut mac_bytes = [0u8; 32];
        mac_bytes.copy_from_slice(&value);
        content_types.insert(tree_key, Mac::from_bytes(mac_bytes));
    }

    let roots = VfsRoots {
        entries: persist_tree(ctx, &entries, ResourceType::VfsNode)?,
        errors: persist_tree(ctx, &errors, ResourceType::ErrorNode)?,
        xattrs: persist_tree(ctx, &xattrs, ResourceType::XattrNode)?,
    };

    let index = if content_types.is_empty() {
        None
    } else {
        let descriptor = persist_tree(ctx, &content_types, ResourceType::BtreeNode)?;
        let descriptor_bytes = descriptor.to_bytes()?;
        let descriptor_mac = ctx.repo.mac(&descriptor_bytes);
        ctx.packer.put_blob_if_not_exists(
            ResourceType::BtreeRoot,
            descriptor_mac,
            descriptor_bytes,
        )?;
        Some(IndexDescriptor {
            name: "content-type".to_owned(),
            kind: "btree".to_owned(),
            value: descriptor_mac,
        })
    };

    Ok((roots, index))
}

fn persist_tree(
    ctx: &PipelineCtx<'_>,
    tree: &crate::btree::BTree<String, Mac>,
    node_type: ResourceType,
) -> Result<crate::btree::TreeDescriptor> {
    let descriptor = tree.persist(&mut |node| {
        let bytes = rmp_serde::to_vec(node)
            .map_err(|e| Error::Internal(format!("tree node encoding: {e}")))?;
        let mac = ctx.repo.mac(&bytes);
        ctx.packer
            .put_blob_if_not_exists(node_type, mac, bytes)
            .map_err(|e| Error::Internal(format!("{e:#}")))?;
        Ok(mac)
    })?;
    Ok(descriptor)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sniffing() {
        assert_eq!(sniff_text(b"plain old text\n"), "text/plain");
        assert_eq!(sniff_text(&[0u8, 1, 2, 3]), "application/octet-stream");
        assert_eq!(sniff_text(b""), "application/octet-stream");

        // A multi-byte sequence cut at the boundary still reads as text.
        let mut cut = "déjà vu".as_bytes().to_vec();
        cut.pop();
        assert_eq!(sniff_text(&cut), "text/plain");
    }

    #[test]
    fn depth_keys_order_deepest_first() {
        let keys = ["/", "/a", "/a/b", "/a/b/c", "/z"];
        let mut cache_keys: Vec<Vec<u8>> = keys.iter().map(|k| dir_key(k)).collect();
        cache_keys.sort();
        cache_keys.reverse();
        let deepest_first: Vec<&str> = cache_keys
            .iter()
            .map(|k| dir_path_of_key(k))
            .collect();
        assert_eq!(deepest_first, vec!["/a/b/c", "/a/b", "/z", "/a", "/"]);
    }
}
