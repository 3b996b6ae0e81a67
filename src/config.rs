//! The repository configuration blob.
//!
//! Written once at `init` under a well-known backend key and read back on
//! every open; everything that must agree between writers lives here
//! (algorithms, chunking bounds, pack sizing), and nothing secret does.

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::Compression;
use crate::error::{Error, Result};
use crate::mac::HashAlgorithm;
use crate::resource::{self, ResourceType, Version};

pub const KIB: u32 = 1024;
pub const MIB: u32 = 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub min_size: u32,
    pub normal_size: u32,
    pub max_size: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_size: 64 * KIB,
            normal_size: MIB,
            max_size: 4 * MIB,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackfileConfig {
    pub max_size: u64,
}

impl Default for PackfileConfig {
    fn default() -> Self {
        Self {
            max_size: 20 * MIB as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub version: Version,
    pub repository_id: Uuid,
    pub hashing: HashAlgorithm,
    pub compression: Option<Compression>,
    pub encrypted: bool,
    pub packfile: PackfileConfig,
    pub chunking: ChunkingConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            version: resource::current_version(ResourceType::Config),
            repository_id: Uuid::new_v4(),
            hashing: HashAlgorithm::default(),
            compression: Some(Compression::default()),
            encrypted: true,
            packfile: PackfileConfig::default(),
            chunking: ChunkingConfig::default(),
        }
    }
}

impl RepositoryConfig {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Internal(format!("config encoding: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Corrupt(format!("config decoding: {e}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() -> Result<()> {
        let config = RepositoryConfig::default();
        let bytes = config.to_bytes()?;
        assert_eq!(RepositoryConfig::from_bytes(&bytes)?, config);
        Ok(())
    }

    #[test]
    fn defaults() {
        let config = RepositoryConfig::default();
        assert_eq!(config.chunking.min_size, 64 * KIB);
        assert_eq!(config.chunking.normal_size, MIB);
        assert_eq!(config.chunking.max_size, 4 * MIB);
        assert_eq!(config.packfile.max_size, 20 * MIB as u64);
        assert!(config.encrypted);
    }
}
