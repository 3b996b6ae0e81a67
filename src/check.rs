//! Verify that a snapshot's blobs are all present (fast) or all intact
//! (deep).
//!
//! Directories cost nothing; every regular file resolves its object and
//! chunks. Results are memoized by MAC so deduplicated chunks and
//! hard-linked files are validated once, and any single failure is an
//! event, not an abort: the report is the AND of everything checked.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use rustc_hash::FxHashMap;
use tracing::*;

use crate::cancel::CancelToken;
use crate::counters;
use crate::error::Error;
use crate::lock;
use crate::mac::Mac;
use crate::object::Object;
use crate::repository::Repository;
use crate::resource::ResourceType;
use crate::snapshot;
use crate::vfs::{Filesystem, VfsEntry};

#[derive(Debug, Default)]
pub struct CheckOptions {
    /// Fetch and re-MAC everything instead of trusting existence.
    pub deep: bool,
    /// File workers; 0 means one per CPU.
    pub max_concurrency: usize,
}

#[derive(Debug)]
pub struct CheckIssue {
    pub path: String,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub files_checked: u64,
    pub chunks_checked: u64,
    pub issues: Vec<CheckIssue>,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Scoped memo of per-blob verdicts, keyed by MAC.
#[derive(Default)]
struct CheckCache {
    verdicts: Mutex<FxHashMap<(ResourceType, Mac), bool>>,
}

impl CheckCache {
    /// Run `verify` once per blob; replay the verdict afterwards.
    fn once<F>(&self, kind: ResourceType, mac: &Mac, verify: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        if let Some(verdict) = self.verdicts.lock().unwrap().get(&(kind, *mac)) {
            counters::bump(counters::Op::CheckMemoized);
            return *verdict;
        }
        let verdict = verify();
        self.verdicts.lock().unwrap().insert((kind, *mac), verdict);
        verdict
    }
}

pub fn check(
    repo: &Arc<Repository>,
    snapshot_id: &Mac,
    opts: &CheckOptions,
    cancel: &CancelToken,
) -> Result<CheckReport> {
    let _lock = lock::acquire_shared(repo)?;

    let header = repo.get_snapshot(snapshot_id)?;
    let mut report = CheckReport::default();

    if let Some(identity) = &header.identity {
        match repo.get_blob(ResourceType::Signature, snapshot_id) {
            Ok(signature) => {
                if let Err(e) = snapshot::verify_signature(identity, snapshot_id, &signature) {
                    report.issues.push(CheckIssue {
                        path: "/".to_owned(),
                        detail: format!("snapshot signature: {e}"),
                    });
                }
            }
            Err(e) => report.issues.push(CheckIssue {
                path: "/".to_owned(),
                detail: format!("snapshot signature missing: {e}"),
            }),
        }
    }

    for source in &header.sources {
        let fs = Filesystem::open(
            repo.clone(),
            &source.vfs,
            None,
        );

        // Gather the regular files up front; directories are OK by
        // construction once their entry decoded.
        let mut files: Vec<(String, VfsEntry)> = Vec::new();
        for item in fs.walk("/")? {
            cancel.check()?;
            match item {
                Ok((path, entry)) => {
                    if entry.object.is_some() {
                        files.push((path, entry));
                    }
                }
                Err(e) => report.issues.push(CheckIssue {
                    path: "?".to_owned(),
                    detail: format!("VFS walk: {e}"),
                }),
            }
        }

        let workers = if opts.max_concurrency == 0 {
            num_cpus::get()
        } else {
            opts.max_concurrency
        };
        let cache = CheckCache::default();
        let shared_report = Mutex::new(&mut report);

        std::thread::scope(|s| {
            for slice in files.chunks(files.len().div_ceil(workers).max(1)) {
                let cache = &cache;
                let shared_report = &shared_report;
                s.spawn(move || {
                    let mut local = CheckReport::default();
                    for (path, entry) in slice {
                        if cancel.is_canceled() {
                            break;
                        }
                        check_file(repo.as_ref(), cache, opts.deep, path, entry, &mut local);
                    }
                    let mut report = shared_report.lock().unwrap();
                    report.files_checked += local.files_checked;
                    report.chunks_checked += local.chunks_checked;
                    report.issues.append(&mut local.issues);
                });
            }
        });
        cancel.check()?;
    }

    if report.ok() {
        info!(
            "Snapshot {} OK ({} files, {} chunks)",
            snapshot_id.short_name(),
            report.files_checked,
            report.chunks_checked
        );
    } else {
        error!(
            "Snapshot {} has {} issues",
            snapshot_id.short_name(),
            report.issues.len()
        );
    }
    Ok(report)
}

fn check_file(
    repo: &Repository,
    cache: &CheckCache,
    deep: bool,
    path: &str,
    entry: &VfsEntry,
    report: &mut CheckReport,
) {
    let object_mac = entry.object.expect("only content-bearing entries here");
    report.files_checked += 1;

    let object = if deep {
        match load_object_verified(repo, cache, &object_mac) {
            Ok(object) => object,
            Err(detail) => {
                report.issues.push(CheckIssue {
                    path: path.to_owned(),
                    detail,
                });
                return;
            }
        }
    } else {
        if !cache.once(ResourceType::Object, &object_mac, || {
            repo.blob_exists(ResourceType::Object, &object_mac)
        }) {
            report.issues.push(CheckIssue {
                path: path.to_owned(),
                detail: format!("object {object_mac} unreachable"),
            });
            return;
        }
        match Object::from_bytes(&match repo.get_blob(ResourceType::Object, &object_mac) {
            Ok(bytes) => bytes,
            Err(e) => {
                report.issues.push(CheckIssue {
                    path: path.to_owned(),
                    detail: format!("object {object_mac}: {e}"),
                });
                return;
            }
        }) {
            Ok(object) => object,
            Err(e) => {
                report.issues.push(CheckIssue {
                    path: path.to_owned(),
                    detail: format!("object {object_mac}: {e}"),
                });
                return;
            }
        }
    };

    if object.chunks.is_empty() {
        // Even an empty file has its one empty chunk.
        report.issues.push(CheckIssue {
            path: path.to_owned(),
            detail: format!("object {object_mac} has no chunks"),
        });
        return;
    }

    let mut content_hasher = deep.then(|| repo.codec().hasher());
    for chunk in &object.chunks {
        report.chunks_checked += 1;
        let ok = if deep {
            let verified = cache.once(ResourceType::Chunk, &chunk.content_mac, || {
                match repo.get_blob(ResourceType::Chunk, &chunk.content_mac) {
                    Ok(bytes) => {
                        repo.mac(&bytes) == chunk.content_mac
                            && bytes.len() == chunk.length as usize
                    }
                    Err(_) => false,
                }
            });
            // The whole-content MAC still needs every chunk's bytes, in
            // order, memoized or not.
            if verified {
                if let Some(hasher) = content_hasher.as_mut() {
                    match repo.get_blob(ResourceType::Chunk, &chunk.content_mac) {
                        Ok(bytes) => hasher.update(&bytes),
                        Err(e) => report.issues.push(CheckIssue {
                            path: path.to_owned(),
                            detail: format!(
                                "chunk {}: re-fetch for content hash failed: {e}",
                                chunk.content_mac
                            ),
                        }),
                    }
                }
            }
            verified
        } else {
            cache.once(ResourceType::Chunk, &chunk.content_mac, || {
                repo.blob_exists(ResourceType::Chunk, &chunk.content_mac)
            })
        };
        if !ok {
            report.issues.push(CheckIssue {
                path: path.to_owned(),
                detail: format!("chunk {} missing or corrupt", chunk.content_mac),
            });
        }
    }

    if let Some(hasher) = content_hasher {
        let computed = hasher.finalize();
        if computed != object.content_mac
            && report.issues.iter().all(|issue| issue.path != path)
        {
            report.issues.push(CheckIssue {
                path: path.to_owned(),
                detail: format!(
                    "content MAC mismatch: object says {}, chunks hash to {computed}",
                    object.content_mac
                ),
            });
        }
    }
}

fn load_object_verified(
    repo: &Repository,
    cache: &CheckCache,
    object_mac: &Mac,
) -> std::result::Result<Object, String> {
    let bytes = repo
        .get_blob(ResourceType::Object, object_mac)
        .map_err(|e| format!("object {object_mac}: {e}"))?;
    if !cache.once(ResourceType::Object, object_mac, || {
        repo.mac(&bytes) == *object_mac
    }) {
        return Err(format!("object {object_mac} hashes differently"));
    }
    Object::from_bytes(&bytes).map_err(|e: Error| format!("object {object_mac}: {e}"))
}
