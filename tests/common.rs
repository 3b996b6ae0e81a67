#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;

use kloset::backup::{self, BackupOptions};
use kloset::backend::memory::MemoryBackend;
use kloset::btree::TreeDescriptor;
use kloset::cache::{KvStore, MemoryStore};
use kloset::cancel::CancelToken;
use kloset::config::{ChunkingConfig, RepositoryConfig};
use kloset::importer::Importer;
use kloset::mac::Mac;
use kloset::repository::{Repository, RepositoryKey};
use kloset::resource::ResourceType;
use kloset::vfs::Filesystem;

/// Small chunks and packs so a few hundred KB of fixture data exercises
/// chunking, pack rotation, and dedup.
pub fn test_config() -> RepositoryConfig {
    let mut config = RepositoryConfig::default();
    config.chunking = ChunkingConfig {
        min_size: 4 * 1024,
        normal_size: 16 * 1024,
        max_size: 64 * 1024,
    };
    config.packfile.max_size = 256 * 1024;
    config
}

pub fn test_repo() -> (Arc<Repository>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let repo = Repository::create(
        backend.clone(),
        test_config(),
        RepositoryKey::generate(),
    )
    .expect("Couldn't create test repository");
    (Arc::new(repo), backend)
}

pub fn run_backup(repo: &Arc<Repository>, importer: &dyn Importer) -> Result<Mac> {
    run_backup_with_cache(repo, importer, None, BackupOptions::default())
}

pub fn run_backup_with_cache(
    repo: &Arc<Repository>,
    importer: &dyn Importer,
    vfs_cache: Option<Arc<dyn KvStore>>,
    opts: BackupOptions,
) -> Result<Mac> {
    backup::backup(
        repo,
        importer,
        Arc::new(MemoryStore::new()),
        vfs_cache,
        opts,
        CancelToken::new(),
    )
}

/// Open the first source's filesystem view, content-type index included.
pub fn open_fs(repo: &Arc<Repository>, snapshot: &Mac) -> Result<Filesystem> {
    let header = repo.get_snapshot(snapshot)?;
    let source = header.sources.first().expect("snapshot has a source");
    let index = source
        .indexes
        .iter()
        .find(|ix| ix.name == "content-type")
        .map(|ix| -> Result<TreeDescriptor> {
            let bytes = repo.get_blob(ResourceType::BtreeRoot, &ix.value)?;
            Ok(TreeDescriptor::from_bytes(&bytes)?)
        })
        .transpose()?;
    Ok(Filesystem::open(repo.clone(), &source.vfs, index.as_ref()))
}

/// Deterministic pseudo-random bytes, seeded so fixtures are stable.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).max(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}
