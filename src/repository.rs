//! The repository handle: key, codec, aggregated state, and blob plumbing.
//!
//! Multiple `Repository` values can coexist in one process (synchronize
//! needs a source and a destination open at once), so nothing here is
//! global. The aggregated state is read-mostly; the delta state is the one
//! piece of shared mutable state, swapped wholesale by transaction flushes.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use rand::RngCore;
use tracing::*;
use uuid::Uuid;

use crate::backend::{Backend, Kind};
use crate::codec::{self, CipherKey, Codec};
use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::mac::{HashAlgorithm, Mac, MacKey};
use crate::packfile::BlobEntry;
use crate::resource::ResourceType;
use crate::snapshot::SnapshotHeader;
use crate::state::{AggregatedState, DeltaEntry, Location, StateFile};

/// How many decoded snapshot headers we keep around on read paths.
const SNAPCACHE_SIZE: usize = 32;

/// The secrets a repository is keyed with. The MAC key partitions the
/// identifier space; the cipher key seals resources at rest.
#[derive(Debug, Clone)]
pub struct RepositoryKey {
    pub mac: MacKey,
    pub cipher: Option<CipherKey>,
}

impl RepositoryKey {
    pub fn generate() -> Self {
        let mut mac = [0u8; 32];
        let mut cipher = [0u8; 32];
        rand::rng().fill_bytes(&mut mac);
        rand::rng().fill_bytes(&mut cipher);
        Self {
            mac: MacKey::from_bytes(mac),
            cipher: Some(CipherKey::from_bytes(cipher)),
        }
    }
}

#[derive(Default)]
struct DeltaState {
    file: StateFile,
    index: rustc_hash::FxHashMap<(ResourceType, Mac), Location>,
}

pub struct Repository {
    backend: Arc<dyn Backend>,
    codec: Codec,
    config: RepositoryConfig,
    state: RwLock<AggregatedState>,
    delta: RwLock<DeltaState>,
    snapcache: Mutex<LruCache<Mac, Arc<SnapshotHeader>>>,
}

/// The configuration blob can't describe its own framing, so it is always
/// framed the same way: HMAC-SHA256, no compression, no encryption.
fn bootstrap_codec(key: &MacKey) -> Codec {
    Codec::new(HashAlgorithm::HmacSha256, key.clone(), None, None)
}

impl Repository {
    pub fn create(
        backend: Arc<dyn Backend>,
        config: RepositoryConfig,
        key: RepositoryKey,
    ) -> Result<Self> {
        if config.encrypted && key.cipher.is_none() {
            return Err(Error::InvalidArgument(
                "configuration requires encryption but no cipher key was provided".to_owned(),
            ));
        }
        let framed = bootstrap_codec(&key.mac).encode(ResourceType::Config, &config.to_bytes()?)?;
        backend.create(&framed)?;
        info!("Created repository {}", config.repository_id);
        Self::assemble(backend, config, key)
    }

    pub fn open(backend: Arc<dyn Backend>, key: RepositoryKey) -> Result<Self> {
        let framed = backend.open()?;
        let (_, payload) = bootstrap_codec(&key.mac)
            .decode(ResourceType::Config, &framed)
            .map_err(|e| match e {
                // A wrong key and a corrupted config are indistinguishable;
                // blame the key, it's the common case.
                Error::Corrupt(_) => {
                    Error::Unauthorized("configuration MAC mismatch (wrong key?)".to_owned())
                }
                other => other,
            })?;
        let config = RepositoryConfig::from_bytes(&payload)?;
        if config.encrypted && key.cipher.is_none() {
            return Err(Error::Unauthorized(
                "repository is encrypted but no cipher key was provided".to_owned(),
            ));
        }

        let repo = Self::assemble(backend, config, key)?;
        repo.reload_states()?;
        Ok(repo)
    }

    fn assemble(
        backend: Arc<dyn Backend>,
        config: RepositoryConfig,
        key: RepositoryKey,
    ) -> Result<Self> {
        let cipher = config.encrypted.then(|| key.cipher.clone().unwrap());
        let codec = Codec::new(config.hashing, key.mac, config.compression, cipher);
        Ok(Self {
            backend,
            codec,
            config,
            state: RwLock::new(AggregatedState::default()),
            delta: RwLock::new(DeltaState::default()),
            snapcache: Mutex::new(LruCache::new(NonZeroUsize::new(SNAPCACHE_SIZE).unwrap())),
        })
    }

    /// Fetch and merge every state file the backend lists.
    fn reload_states(&self) -> Result<()> {
        let macs = self.backend.as_ref().states()?;
        debug!("Merging {} state files", macs.len());
        let mut aggregated = AggregatedState::default();
        for mac in macs {
            let framed = self.backend.as_ref().read_all(Kind::State, &mac)?;
            let (_, payload) = self.codec.decode(ResourceType::State, &framed)?;
            let state = StateFile::from_payload(&payload)?;
            aggregated.merge(&state)?;
            crate::counters::bump(crate::counters::Op::StateMerge);
        }
        *self.state.write().unwrap() = aggregated;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.backend.close()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn id(&self) -> Uuid {
        self.config.repository_id
    }

    /// MAC bytes under this repository's key.
    pub fn mac(&self, bytes: &[u8]) -> Mac {
        self.codec.mac(bytes)
    }

    /// Is this blob already stored, or queued in the live delta?
    /// (The packer layers its own inflight set on top of this.)
    pub fn blob_exists(&self, kind: ResourceType, mac: &Mac) -> bool {
        self.lookup_location(kind, mac).is_some()
    }

    pub fn lookup_location(&self, kind: ResourceType, mac: &Mac) -> Option<Location> {
        if let Some(entry) = self.state.read().unwrap().lookup(kind, mac) {
            return Some(entry.location);
        }
        self.delta.read().unwrap().index.get(&(kind, *mac)).copied()
    }

    /// Fetch and decode one blob via its packfile location.
    ///
    /// The blob's own frame authenticates the bytes; callers that need the
    /// content identity re-checked (deep check, sync) re-MAC the plaintext.
    pub fn get_blob(&self, kind: ResourceType, mac: &Mac) -> Result<Vec<u8>> {
        let location = self
            .lookup_location(kind, mac)
            .ok_or_else(|| Error::blob_not_found(kind, mac))?;
        let framed = self.backend.get_packfile_blob(
            &location.packfile,
            codec::HEADER_SIZE as u64 + location.offset,
            location.length,
        )?;
        let (_, plain) = self.codec.decode(kind, &framed)?;
        Ok(plain)
    }

    /// Frame a finished pack payload, MAC it, and store it durably.
    pub fn store_packfile(&self, payload: &[u8]) -> Result<Mac> {
        use std::io::Write;
        let mut writer =
            codec::FramedWriter::new(Vec::new(), &self.codec, ResourceType::Packfile)?;
        writer.write_all(payload)?;
        let (mac, framed) = writer.finalize()?;
        self.backend.put_bytes(Kind::Packfile, &mac, &framed)?;
        debug!("Packfile {} stored ({} bytes)", mac, framed.len());
        Ok(mac)
    }

    /// Fetch a whole pack's payload, verifying the outer frame.
    pub fn get_packfile(&self, mac: &Mac) -> Result<Vec<u8>> {
        use std::io::Read;
        let reader = self.backend.get(Kind::Packfile, mac)?;
        let mut framed =
            codec::FramedReader::new(reader, &self.codec, ResourceType::Packfile)?;
        let mut payload = Vec::new();
        framed.read_to_end(&mut payload)?;
        Ok(payload)
    }

    /// Record where a freshly stored pack put its blobs.
    /// Called only after the pack is durably accepted by the backend, so a
    /// crash in between leaks the pack but never dangles a reference.
    pub fn record_deltas(&self, packfile: Mac, entries: &[BlobEntry]) -> Result<Vec<DeltaEntry>> {
        let mut recorded = Vec::with_capacity(entries.len());
        let mut delta = self.delta.write().unwrap();
        for entry in entries {
            // Padding blobs pad; they are not addressable content.
            if entry.kind == ResourceType::Random {
                continue;
            }
            let new = DeltaEntry {
                kind: entry.kind,
                version: entry.version,
                blob: entry.mac,
                location: Location {
                    packfile,
                    offset: entry.offset,
                    length: entry.length,
                },
                flags: entry.flags,
            };
            delta.index.insert((entry.kind, entry.mac), new.location);
            delta.file.deltas.push(new);
            recorded.push(new);
        }
        Ok(recorded)
    }

    /// Swap out the live delta and persist it as one state file.
    /// Returns the state's MAC, or None if there was nothing to say.
    pub fn flush_transaction(&self) -> Result<Option<Mac>> {
        let file = {
            // Fold the delta into the aggregated state in the same critical
            // section that empties it, so no lookup sees the gap between.
            let mut state = self.state.write().unwrap();
            let mut delta = self.delta.write().unwrap();
            if delta.file.is_empty() {
                return Ok(None);
            }
            let file = std::mem::take(&mut *delta).file;
            state.merge(&file)?;
            file
        };

        let framed = self.codec.encode(ResourceType::State, &file.to_payload()?)?;
        let mac = self.codec.mac(&framed);
        self.backend.put_bytes(Kind::State, &mac, &framed)?;
        info!(
            "State {} flushed ({} deltas, {} deletions)",
            mac,
            file.deltas.len(),
            file.deleted.len()
        );
        Ok(Some(mac))
    }

    /// Every committed snapshot's identifier.
    pub fn snapshots(&self) -> Vec<Mac> {
        self.state.read().unwrap().blobs_of(ResourceType::Snapshot)
    }

    /// Load a snapshot header through the LRU of open snapshots.
    pub fn get_snapshot(&self, identifier: &Mac) -> Result<Arc<SnapshotHeader>> {
        if let Some(header) = self.snapcache.lock().unwrap().get(identifier) {
            crate::counters::bump(crate::counters::Op::SnapshotCacheHit);
            return Ok(header.clone());
        }
        crate::counters::bump(crate::counters::Op::SnapshotCacheMiss);
        let plain = self.get_blob(ResourceType::Snapshot, identifier)?;
        if &self.mac(&plain) != identifier {
            return Err(Error::Corrupt(format!(
                "snapshot header {identifier} hashes differently than its identifier"
            )));
        }
        let mut header = SnapshotHeader::from_bytes(&plain)?;
        header.identifier = *identifier;
        let header = Arc::new(header);
        self.snapcache
            .lock()
            .unwrap()
            .put(*identifier, header.clone());
        Ok(header)
    }

    /// Read-only view of the aggregated state, for traversals that
    /// enumerate blobs or packs wholesale.
    pub fn state(&self) -> std::sync::RwLockReadGuard<'_, AggregatedState> {
        self.state.read().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::packfile::PackWriter;
    use crate::resource::current_version;

    fn test_repo() -> Result<Repository> {
        let backend = Arc::new(MemoryBackend::new());
        Repository::create(backend, RepositoryConfig::default(), RepositoryKey::generate())
    }

    fn put_one_blob(repo: &Repository, plain: &[u8]) -> Result<Mac> {
        let mac = repo.mac(plain);
        let encoded = repo.codec().encode(ResourceType::Chunk, plain)?;
        let mut writer = PackWriter::new();
        writer.put(
            ResourceType::Chunk,
            current_version(ResourceType::Chunk),
            mac,
            &encoded,
        );
        let (payload, entries) = writer.finish(repo.codec(), 0)?;
        let packfile = repo.store_packfile(&payload)?;
        repo.record_deltas(packfile, &entries)?;
        Ok(mac)
    }

    #[test]
    fn blob_round_trip_through_delta() -> Result<()> {
        let repo = test_repo()?;
        let mac = put_one_blob(&repo, b"some chunk bytes")?;

        assert!(repo.blob_exists(ResourceType::Chunk, &mac));
        assert_eq!(repo.get_blob(ResourceType::Chunk, &mac)?, b"some chunk bytes");

        // Still resolvable after the delta becomes a state file.
        assert!(repo.flush_transaction()?.is_some());
        assert_eq!(repo.get_blob(ResourceType::Chunk, &mac)?, b"some chunk bytes");
        Ok(())
    }

    #[test]
    fn reopen_merges_states() -> Result<()> {
        let backend = Arc::new(MemoryBackend::new());
        let key = RepositoryKey::generate();
        let repo = Repository::create(
            backend.clone(),
            RepositoryConfig::default(),
            key.clone(),
        )?;
        let mac = put_one_blob(&repo, b"durable bytes")?;
        repo.flush_transaction()?;

        let reopened = Repository::open(backend, key)?;
        assert_eq!(reopened.get_blob(ResourceType::Chunk, &mac)?, b"durable bytes");
        Ok(())
    }

    #[test]
    fn wrong_key_is_unauthorized() -> Result<()> {
        let backend = Arc::new(MemoryBackend::new());
        Repository::create(
            backend.clone(),
            RepositoryConfig::default(),
            RepositoryKey::generate(),
        )?;

        assert!(matches!(
            Repository::open(backend, RepositoryKey::generate()),
            Err(Error::Unauthorized(_))
        ));
        Ok(())
    }

    #[test]
    fn missing_blob_is_not_found() -> Result<()> {
        let repo = test_repo()?;
        assert!(matches!(
            repo.get_blob(ResourceType::Chunk, &Mac::from_bytes([1; 32])),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn empty_flush_is_a_noop() -> Result<()> {
        let repo = test_repo()?;
        assert!(repo.flush_transaction()?.is_none());
        Ok(())
    }
}
