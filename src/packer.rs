//! Turn an unbounded stream of blobs into size-bounded packfiles.
//!
//! One worker per CPU drains a bounded message channel, each building its
//! own pack; a single flusher serializes finished packs to the backend so
//! large writes never interleave. The flusher also owns the bookkeeping
//! that must follow a durable pack write: recording delta entries, mirroring
//! them into the scan cache, clearing the inflight set, and ticking the
//! periodic transaction flush.
//!
//! The inflight set is what stops two file workers from chunking and
//! packing the same content twice: a MAC is reserved before it is queued
//! and released only after its pack is durable *and* its delta entry is in
//! the live delta cache.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender, bounded};
use rand::{Rng, RngCore};
use rustc_hash::FxHashSet;
use tracing::*;

use crate::cache::{self, KvStore, namespaces};
use crate::cancel::CancelToken;
use crate::counters;
use crate::error::{self, Error};
use crate::mac::Mac;
use crate::packfile::{BlobEntry, PackWriter};
use crate::repository::Repository;
use crate::resource::{self, ResourceType};

/// How often the flusher commits a partial transaction, bounding how much
/// an interrupted backup can orphan.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60 * 60);

struct PutBlob {
    kind: ResourceType,
    mac: Mac,
    data: Vec<u8>,
}

struct ReadyPack {
    payload: Vec<u8>,
    entries: Vec<BlobEntry>,
}

struct Shared {
    repo: Arc<Repository>,
    scan_cache: Arc<dyn KvStore>,
    snapshot: Mac,
    inflight: Mutex<FxHashSet<(ResourceType, Mac)>>,
    cancel: CancelToken,
    flush_interval: Duration,
}

pub struct Packer {
    tx: Option<Sender<PutBlob>>,
    workers: Vec<JoinHandle<Result<()>>>,
    flusher: Option<JoinHandle<Result<()>>>,
    shared: Arc<Shared>,
}

impl Packer {
    pub fn spawn(
        repo: Arc<Repository>,
        scan_cache: Arc<dyn KvStore>,
        snapshot: Mac,
        cancel: CancelToken,
    ) -> Self {
        Self::spawn_with_interval(repo, scan_cache, snapshot, cancel, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn spawn_with_interval(
        repo: Arc<Repository>,
        scan_cache: Arc<dyn KvStore>,
        snapshot: Mac,
        cancel: CancelToken,
        flush_interval: Duration,
    ) -> Self {
        let worker_count = num_cpus::get();
        let (tx, rx) = bounded::<PutBlob>(2 * worker_count + 1);
        let (pack_tx, pack_rx) = bounded::<ReadyPack>(1);

        let shared = Arc::new(Shared {
            repo,
            scan_cache,
            snapshot,
            inflight: Mutex::new(FxHashSet::default()),
            cancel,
            flush_interval,
        });

        let workers = (0..worker_count)
            .map(|i| {
                let rx = rx.clone();
                let pack_tx = pack_tx.clone();
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("packer-{i}"))
                    .spawn(move || worker(rx, pack_tx, shared))
                    .expect("Couldn't spawn packer worker")
            })
            .collect();
        drop(pack_tx);

        let flusher = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("pack-flusher".to_owned())
                .spawn(move || flusher(pack_rx, shared))
                .expect("Couldn't spawn pack flusher")
        };

        Self {
            tx: Some(tx),
            workers,
            flusher: Some(flusher),
            shared,
        }
    }

    /// Queue a blob unconditionally.
    pub fn put_blob(&self, kind: ResourceType, mac: Mac, data: Vec<u8>) -> Result<()> {
        self.reserve_and_send(kind, mac, data, false).map(|_| ())
    }

    /// Queue a blob unless it is already stored, queued, or inflight.
    /// Returns whether it was queued.
    pub fn put_blob_if_not_exists(
        &self,
        kind: ResourceType,
        mac: Mac,
        data: Vec<u8>,
    ) -> Result<bool> {
        self.reserve_and_send(kind, mac, data, true)
    }

    fn reserve_and_send(
        &self,
        kind: ResourceType,
        mac: Mac,
        data: Vec<u8>,
        skip_existing: bool,
    ) -> Result<bool> {
        {
            // Check-and-reserve must be one critical section, or two file
            // workers could both decide to pack the same chunk.
            let mut inflight = self.shared.inflight.lock().unwrap();
            if skip_existing
                && (inflight.contains(&(kind, mac)) || self.shared.repo.blob_exists(kind, &mac))
            {
                return Ok(false);
            }
            inflight.insert((kind, mac));
        }
        self.tx
            .as_ref()
            .expect("put after finish")
            .send(PutBlob { kind, mac, data })
            .context("packer channel exited early")?;
        Ok(true)
    }

    /// True if the blob is stored, in the live delta, or queued for packing.
    pub fn blob_exists(&self, kind: ResourceType, mac: &Mac) -> bool {
        self.shared.inflight.lock().unwrap().contains(&(kind, *mac))
            || self.shared.repo.blob_exists(kind, mac)
    }

    /// Drain the channel, wait for every pack to land.
    /// The caller decides when to flush the final transaction so that the
    /// snapshot header's delta rides in it.
    pub fn finish(mut self) -> Result<()> {
        drop(self.tx.take());

        let mut errors: Vec<anyhow::Error> = Vec::new();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.join().unwrap() {
                errors.push(e);
            }
        }
        if let Err(e) = self.flusher.take().unwrap().join().unwrap() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.iter().all(error::was_canceled) {
            Err(Error::Canceled.into())
        } else {
            for e in &errors {
                error!("{e:?}");
            }
            bail!("packing failed");
        }
    }
}

fn worker(rx: Receiver<PutBlob>, pack_tx: Sender<ReadyPack>, shared: Arc<Shared>) -> Result<()> {
    let max_size = shared.repo.config().packfile.max_size;
    let mut writer = PackWriter::new();

    while let Ok(put) = rx.recv() {
        shared.cancel.check()?;

        let version = resource::current_version(put.kind);
        let encoded = shared
            .repo
            .codec()
            .encode_versioned(put.kind, version, &put.data)?;
        trace!("Packing {} blob {} ({} bytes)", put.kind, put.mac, put.data.len());
        writer.put(put.kind, version, put.mac, &encoded);

        if writer.size() >= max_size {
            writer = rotate(writer, &pack_tx, &shared)?;
        }
    }

    // A canceled backup must not flush its partial pack.
    shared.cancel.check()?;
    if !writer.is_empty() {
        rotate(writer, &pack_tx, &shared)?;
    }
    Ok(())
}

/// Pad the pack, finish it, and hand it to the flusher.
fn rotate(
    mut writer: PackWriter,
    pack_tx: &Sender<ReadyPack>,
    shared: &Shared,
) -> Result<PackWriter> {
    pad(&mut writer, shared)?;
    let (payload, entries) = writer.finish(
        shared.repo.codec(),
        jiff::Timestamp::now().as_second(),
    )?;
    debug!("Pack ready ({} blobs, {} bytes)", entries.len(), payload.len());
    pack_tx
        .send(ReadyPack { payload, entries })
        .context("packer -> flusher channel exited early")?;
    Ok(PackWriter::new())
}

/// A random-length throwaway blob at every pack boundary, so pack sizes
/// don't leak the shape of what was backed up.
fn pad(writer: &mut PackWriter, shared: &Shared) -> Result<()> {
    let max_pad = shared.repo.config().chunking.min_size.max(1);
    let mut rng = rand::rng();
    let mut padding = vec![0u8; rng.random_range(1..=max_pad) as usize];
    rng.fill_bytes(&mut padding);
    let mut fake_mac = [0u8; 32];
    rng.fill_bytes(&mut fake_mac);

    let version = resource::current_version(ResourceType::Random);
    let encoded = shared
        .repo
        .codec()
        .encode_versioned(ResourceType::Random, version, &padding)?;
    writer.put(
        ResourceType::Random,
        version,
        Mac::from_bytes(fake_mac),
        &encoded,
    );
    Ok(())
}

fn flusher(pack_rx: Receiver<ReadyPack>, shared: Arc<Shared>) -> Result<()> {
    let mut last_flush = Instant::now();

    while let Ok(pack) = pack_rx.recv() {
        shared.cancel.check()?;

        let packfile = shared.repo.store_packfile(&pack.payload)?;
        let recorded = shared.repo.record_deltas(packfile, &pack.entries)?;

        // Mirror the deltas into the scan cache and tie the pack to the
        // snapshot that caused it.
        for delta in &recorded {
            let key = cache::namespaced(
                namespaces::DELTA,
                format!("{}:{}", delta.kind, delta.blob).as_bytes(),
            );
            let value = rmp_serde::to_vec(delta)
                .map_err(|e| Error::Internal(format!("delta encoding: {e}")))?;
            shared.scan_cache.put(&key, &value)?;
        }
        shared.scan_cache.put(
            &cache::namespaced(namespaces::PACKFILE, packfile.to_string().as_bytes()),
            shared.snapshot.as_bytes(),
        )?;

        counters::bump(counters::Op::PackFlushed);

        // Only now may the reservations go: the pack is durable and its
        // deltas are resolvable through the live delta cache.
        {
            let mut inflight = shared.inflight.lock().unwrap();
            for entry in &pack.entries {
                inflight.remove(&(entry.kind, entry.mac));
            }
        }

        if last_flush.elapsed() >= shared.flush_interval {
            shared.repo.flush_transaction()?;
            last_flush = Instant::now();
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::cache::MemoryStore;
    use crate::config::RepositoryConfig;
    use crate::repository::RepositoryKey;

    fn small_pack_repo() -> Result<Arc<Repository>> {
        let mut config = RepositoryConfig::default();
        config.packfile.max_size = 4 * 1024;
        config.chunking.min_size = 64;
        Ok(Arc::new(Repository::create(
            Arc::new(MemoryBackend::new()),
            config,
            RepositoryKey::generate(),
        )?))
    }

    fn spawn_packer(repo: &Arc<Repository>, cancel: CancelToken) -> Packer {
        Packer::spawn(
            repo.clone(),
            Arc::new(MemoryStore::new()),
            Mac::from_bytes([0xaa; 32]),
            cancel,
        )
    }

    #[test]
    fn blobs_land_and_dedupe() -> Result<()> {
        let repo = small_pack_repo()?;
        let packer = spawn_packer(&repo, CancelToken::new());

        let mut macs = Vec::new();
        for i in 0..32u32 {
            let data = vec![i as u8; 512];
            let mac = repo.mac(&data);
            assert!(packer.put_blob_if_not_exists(ResourceType::Chunk, mac, data)?);
            macs.push(mac);
        }
        // The same content again: everything is stored or inflight.
        for i in 0..32u32 {
            let data = vec![i as u8; 512];
            let mac = repo.mac(&data);
            assert!(!packer.put_blob_if_not_exists(ResourceType::Chunk, mac, data)?);
            assert!(packer.blob_exists(ResourceType::Chunk, &mac));
        }
        packer.finish()?;
        repo.flush_transaction()?;

        for (i, mac) in macs.iter().enumerate() {
            assert_eq!(
                repo.get_blob(ResourceType::Chunk, mac)?,
                vec![i as u8; 512]
            );
        }
        Ok(())
    }

    #[test]
    fn canceled_packer_discards_in_flight_packs() -> Result<()> {
        let repo = small_pack_repo()?;
        let cancel = CancelToken::new();
        let packer = spawn_packer(&repo, cancel.clone());

        packer.put_blob(ResourceType::Chunk, repo.mac(b"doomed"), b"doomed".to_vec())?;
        cancel.cancel();

        let result = packer.finish();
        assert!(result.is_err());
        assert!(error::was_canceled(&result.unwrap_err()));
        Ok(())
    }
}
