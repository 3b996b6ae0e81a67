use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;
use clap::Parser;

use crate::backend::fs::FilesystemBackend;
use crate::codec::Compression;
use crate::config::RepositoryConfig;
use crate::mac::HashAlgorithm;
use crate::repository::{Repository, RepositoryKey};
use crate::snapshot::SnapshotSigner;

/// Create a new repository.
#[derive(Debug, Parser)]
pub struct Args {
    /// Store resources unencrypted.
    #[clap(long)]
    plaintext: bool,

    /// Skip generating a snapshot-signing identity.
    #[clap(long)]
    no_identity: bool,

    /// Hashing algorithm (hmac-sha256 or blake3)
    #[clap(long, default_value = "hmac-sha256")]
    hashing: String,

    /// Compression (lz4, zstd, gzip, none)
    #[clap(long, default_value = "lz4")]
    compression: String,
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let mut config = RepositoryConfig::default();
    config.encrypted = !args.plaintext;
    config.hashing = match args.hashing.as_str() {
        "hmac-sha256" => HashAlgorithm::HmacSha256,
        "blake3" => HashAlgorithm::Blake3,
        other => anyhow::bail!("unknown hashing algorithm {other}"),
    };
    config.compression = match args.compression.as_str() {
        "lz4" => Some(Compression::Lz4),
        "zstd" => Some(Compression::Zstd),
        "gzip" => Some(Compression::Gzip),
        "none" => None,
        other => anyhow::bail!("unknown compression algorithm {other}"),
    };

    let mut key = RepositoryKey::generate();
    if args.plaintext {
        key.cipher = None;
    }
    let signer = (!args.no_identity).then(SnapshotSigner::generate);

    std::fs::create_dir_all(repository)?;
    let backend = Arc::new(FilesystemBackend::new(repository));
    Repository::create(backend, config, key.clone())?;
    super::save_credentials(repository, &key, signer.as_ref())?;

    println!("Repository initialized at {repository}");
    println!("Keys written to {}; keep them safe.", repository.join(super::KEY_FILE));
    Ok(())
}
