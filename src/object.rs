//! Chunks and the objects that stitch them back into files.
//!
//! A [`Chunk`] describes one content-defined slice of a file; an [`Object`]
//! is the ordered chunk list plus the metadata needed to reconstitute and
//! classify the whole file. The object's `content_mac` is computed over the
//! concatenation of all chunk plaintexts, which ties a file's content
//! identity to its chunk list.

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mac::Mac;
use crate::resource::{self, ResourceType, Version};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub version: Version,
    pub content_mac: Mac,
    pub length: u32,
    pub entropy: f64,
    pub flags: u32,
}

impl Chunk {
    pub fn new(content_mac: Mac, length: u32, entropy: f64) -> Self {
        Self {
            version: resource::current_version(ResourceType::Chunk),
            content_mac,
            length,
            entropy,
            flags: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub version: Version,
    pub content_mac: Mac,
    pub content_type: String,
    pub entropy: f64,
    pub chunks: Vec<Chunk>,
    pub flags: u32,
}

impl Object {
    pub fn new(content_mac: Mac, content_type: String, entropy: f64, chunks: Vec<Chunk>) -> Self {
        Self {
            version: resource::current_version(ResourceType::Object),
            content_mac,
            content_type,
            entropy,
            chunks,
            flags: 0,
        }
    }

    /// Total plaintext length of the file this object reconstitutes.
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.length as u64).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Internal(format!("object encoding: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Corrupt(format!("object decoding: {e}")))
    }
}

/// Shannon entropy (bits per byte) of the given buffer.
///
/// Recorded per chunk and rolled up per directory so that maintenance and
/// search can spot already-compressed or encrypted regions.
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for b in bytes {
        counts[*b as usize] += 1;
    }
    let len = bytes.len() as f64;
    let mut entropy = 0.0;
    for count in counts {
        if count == 0 {
            continue;
        }
        let p = count as f64 / len;
        entropy -= p * p.log2();
    }
    entropy
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entropy_bounds() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[0u8; 1024]), 0.0);

        // One of each symbol is maximally surprising.
        let uniform: Vec<u8> = (0..=255u8).collect();
        assert!((shannon_entropy(&uniform) - 8.0).abs() < 1e-9);

        let text = shannon_entropy(b"hello, world: a typical line of text");
        assert!(text > 0.0 && text < 8.0);
    }

    #[test]
    fn round_trip() -> Result<()> {
        let object = Object::new(
            Mac::from_bytes([1; 32]),
            "text/plain".to_owned(),
            3.5,
            vec![
                Chunk::new(Mac::from_bytes([2; 32]), 1024, 3.4),
                Chunk::new(Mac::from_bytes([3; 32]), 512, 3.6),
            ],
        );
        assert_eq!(object.size(), 1536);

        let bytes = object.to_bytes()?;
        assert_eq!(Object::from_bytes(&bytes)?, object);
        Ok(())
    }

    #[test]
    fn garbage_is_corrupt() {
        assert!(matches!(
            Object::from_bytes(b"not msgpack at all"),
            Err(Error::Corrupt(_))
        ));
    }
}
