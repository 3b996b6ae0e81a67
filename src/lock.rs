//! Advisory locks, stored as blobs on the backend.
//!
//! A shared lock (backup, check, restore) coexists with other shared locks;
//! an exclusive lock (maintenance) is incompatible with everything.
//! Acquisition is compare-and-scan: write ours, list all, and if an
//! incompatible lock exists, delete ours and fail. Stale locks past their
//! TTL are garbage-collected by whoever trips over them, and every holder
//! refreshes its own on a half-TTL cadence.

use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use tracing::*;
use uuid::Uuid;

use crate::backend::Kind;
use crate::error::{Error, Result};
use crate::mac::Mac;
use crate::repository::Repository;
use crate::resource::{self, ResourceType, Version};

pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Truthy `PLAKAR_LOCKLESS` disables locking entirely, for stores where
/// writing lock blobs is more trouble than the safety is worth.
pub fn lockless() -> bool {
    match std::env::var("PLAKAR_LOCKLESS") {
        Ok(v) => !v.is_empty() && v != "0" && v.to_lowercase() != "false",
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub version: Version,
    pub owner: Uuid,
    pub hostname: String,
    pub exclusive: bool,
    /// Seconds since the epoch; refreshed on a half-TTL cadence.
    pub created: i64,
    pub ttl_secs: u64,
}

impl LockInfo {
    fn new(exclusive: bool, ttl: Duration) -> Self {
        Self {
            version: resource::current_version(ResourceType::Lock),
            owner: Uuid::new_v4(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_owned()),
            exclusive,
            created: jiff::Timestamp::now().as_second(),
            ttl_secs: ttl.as_secs(),
        }
    }

    fn is_stale(&self, now: i64) -> bool {
        now.saturating_sub(self.created) > self.ttl_secs as i64
    }
}

/// Held for the duration of an operation; releases (and stops refreshing)
/// on drop.
pub struct LockGuard {
    repo: Option<Arc<Repository>>,
    mac: Mac,
    stop: Option<Sender<()>>,
    refresher: Option<JoinHandle<()>>,
}

impl LockGuard {
    fn lockless() -> Self {
        Self {
            repo: None,
            mac: Mac::ZERO,
            stop: None,
            refresher: None,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(refresher) = self.refresher.take() {
            let _ = refresher.join();
        }
        if let Some(repo) = self.repo.take() {
            if let Err(e) = repo.backend().delete(Kind::Lock, &self.mac) {
                warn!("Couldn't release lock {}: {e}", self.mac);
            }
        }
    }
}

pub fn acquire_shared(repo: &Arc<Repository>) -> Result<LockGuard> {
    acquire(repo, false, DEFAULT_TTL)
}

pub fn acquire_exclusive(repo: &Arc<Repository>) -> Result<LockGuard> {
    acquire(repo, true, DEFAULT_TTL)
}

pub fn acquire(repo: &Arc<Repository>, exclusive: bool, ttl: Duration) -> Result<LockGuard> {
    if lockless() {
        debug!("PLAKAR_LOCKLESS set, skipping lock acquisition");
        return Ok(LockGuard::lockless());
    }

    let info = LockInfo::new(exclusive, ttl);
    let mut mac_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut mac_bytes);
    let mac = Mac::from_bytes(mac_bytes);

    write_lock(repo, &mac, &info)?;

    // Now scan: did we lose to someone we can't share with?
    let now = jiff::Timestamp::now().as_second();
    for other_mac in repo.backend().as_ref().locks()? {
        if other_mac == mac {
            continue;
        }
        let other = match read_lock(repo, &other_mac) {
            Ok(info) => info,
            Err(e) => {
                warn!("Ignoring undecodable lock {other_mac}: {e}");
                continue;
            }
        };
        if other.is_stale(now) {
            info!("Garbage-collecting stale lock {other_mac} from {}", other.hostname);
            repo.backend().delete(Kind::Lock, &other_mac)?;
            continue;
        }
        if other.exclusive || exclusive {
            repo.backend().delete(Kind::Lock, &mac)?;
            return Err(Error::InUse(format!(
                "{} lock held by {} ({})",
                if other.exclusive { "exclusive" } else { "shared" },
                other.hostname,
                other.owner
            )));
        }
    }

    // Refresh on a half-TTL cadence until the guard drops.
    let (stop, stopped) = channel();
    let refresher = {
        let repo = repo.clone();
        let mut info = info;
        std::thread::Builder::new()
            .name("lock-refresh".to_owned())
            .spawn(move || {
                let cadence = Duration::from_secs((info.ttl_secs / 2).max(1));
                loop {
                    match stopped.recv_timeout(cadence) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    info.created = jiff::Timestamp::now().as_second();
                    if let Err(e) = write_lock(&repo, &mac, &info) {
                        warn!("Couldn't refresh lock {mac}: {e}");
                    }
                }
            })
            .expect("Couldn't spawn lock refresher")
    };

    Ok(LockGuard {
        repo: Some(repo.clone()),
        mac,
        stop: Some(stop),
        refresher: Some(refresher),
    })
}

fn write_lock(repo: &Arc<Repository>, mac: &Mac, info: &LockInfo) -> Result<()> {
    let payload = rmp_serde::to_vec(info)
        .map_err(|e| Error::Internal(format!("lock encoding: {e}")))?;
    let framed = repo.codec().encode(ResourceType::Lock, &payload)?;
    // Refreshes rewrite the same key; delete first since puts of an
    // existing MAC are no-ops.
    repo.backend().delete(Kind::Lock, mac)?;
    repo.backend().put_bytes(Kind::Lock, mac, &framed)
}

fn read_lock(repo: &Arc<Repository>, mac: &Mac) -> Result<LockInfo> {
    let framed = repo.backend().as_ref().read_all(Kind::Lock, mac)?;
    let (_, payload) = repo.codec().decode(ResourceType::Lock, &framed)?;
    rmp_serde::from_slice(&payload).map_err(|e| Error::Corrupt(format!("lock decoding: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::config::RepositoryConfig;
    use crate::repository::RepositoryKey;

    fn test_repo() -> Result<Arc<Repository>> {
        Ok(Arc::new(Repository::create(
            Arc::new(MemoryBackend::new()),
            RepositoryConfig::default(),
            RepositoryKey::generate(),
        )?))
    }

    #[test]
    fn shared_locks_coexist() -> Result<()> {
        let repo = test_repo()?;
        let a = acquire(&repo, false, DEFAULT_TTL)?;
        let b = acquire(&repo, false, DEFAULT_TTL)?;
        drop(a);
        drop(b);
        assert!(repo.backend().as_ref().locks()?.is_empty());
        Ok(())
    }

    #[test]
    fn exclusive_conflicts_both_ways() -> Result<()> {
        let repo = test_repo()?;

        let shared = acquire(&repo, false, DEFAULT_TTL)?;
        assert!(matches!(
            acquire(&repo, true, DEFAULT_TTL),
            Err(Error::InUse(_))
        ));
        drop(shared);

        let exclusive = acquire(&repo, true, DEFAULT_TTL)?;
        assert!(matches!(
            acquire(&repo, false, DEFAULT_TTL),
            Err(Error::InUse(_))
        ));
        drop(exclusive);

        // Failed acquisitions cleaned up after themselves.
        assert!(repo.backend().as_ref().locks()?.is_empty());
        Ok(())
    }

    #[test]
    fn stale_locks_are_collected() -> Result<()> {
        let repo = test_repo()?;

        // Plant a lock that expired an hour ago.
        let mut expired = LockInfo::new(true, Duration::from_secs(60));
        expired.created -= 3600;
        let mac = Mac::from_bytes([0x55; 32]);
        write_lock(&repo, &mac, &expired)?;

        let guard = acquire(&repo, false, DEFAULT_TTL)?;
        assert_eq!(repo.backend().as_ref().locks()?.len(), 1);
        drop(guard);
        Ok(())
    }
}
