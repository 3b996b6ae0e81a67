//! Build and parse packs: size-bounded concatenations of blobs with an
//! encrypted index and footer.
//!
//! On-disk layout of a pack's payload (before the outer frame):
//!
//! ```text
//! offset | content
//! 0      | blob bytes concatenated (each blob individually framed/sealed)
//! D      | encrypted(msgpack(index: [BlobEntry]))
//! D+I    | encrypted(msgpack(Footer))
//! D+I+F  | u32 LE encrypted-footer-length
//! ```
//!
//! The index and footer are sealed with separate AEAD invocations so the
//! footer can be read from the tail without touching the index, and the
//! index without touching any data.

use rustc_hash::FxHashSet;
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::mac::Mac;
use crate::resource::{self, ResourceType, Version};

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobEntry {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub version: Version,
    pub mac: Mac,
    pub offset: u64,
    pub length: u32,
    pub flags: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footer {
    pub version: Version,
    pub timestamp: i64,
    pub count: u32,
    pub index_offset: u64,
    pub index_length: u32,
    pub index_mac: Mac,
    pub flags: u32,
}

/// Accumulates encoded blobs until the packer decides the pack is full.
pub struct PackWriter {
    data: Vec<u8>,
    index: Vec<BlobEntry>,
    seen: FxHashSet<(ResourceType, Mac)>,
}

impl Default for PackWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PackWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            index: Vec::new(),
            seen: FxHashSet::default(),
        }
    }

    /// Append an already-encoded blob. Returns false (and stores nothing)
    /// if this pack already holds a blob with the same type and MAC.
    pub fn put(&mut self, kind: ResourceType, version: Version, mac: Mac, encoded: &[u8]) -> bool {
        if !self.seen.insert((kind, mac)) {
            trace!("{kind} blob {mac} already in this pack");
            return false;
        }
        assert!(encoded.len() <= u32::MAX as usize);
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(encoded);
        self.index.push(BlobEntry {
            kind,
            version,
            mac,
            offset,
            length: encoded.len() as u32,
            flags: 0,
        });
        true
    }

    /// Payload bytes accumulated so far; what the packer bounds.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn blob_count(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Serialize into the final pack payload. The outer frame (and the
    /// pack's MAC) is the caller's business, since the MAC covers it.
    pub fn finish(self, codec: &Codec, timestamp: i64) -> Result<(Vec<u8>, Vec<BlobEntry>)> {
        let index_bytes = rmp_serde::to_vec(&self.index)
            .map_err(|e| Error::Internal(format!("pack index encoding: {e}")))?;
        let index_mac = codec.mac(&index_bytes);
        let sealed_index = codec.encrypt(&index_bytes)?;

        let footer = Footer {
            version: resource::current_version(ResourceType::Packfile),
            timestamp,
            count: self.index.len() as u32,
            index_offset: self.data.len() as u64,
            index_length: sealed_index.len() as u32,
            index_mac,
            flags: 0,
        };
        let footer_bytes = rmp_serde::to_vec(&footer)
            .map_err(|e| Error::Internal(format!("pack footer encoding: {e}")))?;
        let sealed_footer = codec.encrypt(&footer_bytes)?;

        let mut out = self.data;
        out.extend_from_slice(&sealed_index);
        out.extend_from_slice(&sealed_footer);
        out.extend_from_slice(&(sealed_footer.len() as u32).to_le_bytes());
        Ok((out, self.index))
    }
}

/// Read the footer from the tail of a pack payload.
pub fn read_footer(codec: &Codec, payload: &[u8]) -> Result<Footer> {
    if payload.len() < 4 {
        return Err(Error::Corrupt("pack shorter than its footer length".into()));
    }
    let (rest, len_bytes) = payload.split_at(payload.len() - 4);
    let footer_length = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    if rest.len() < footer_length {
        return Err(Error::Corrupt(format!(
            "pack footer claims {footer_length} bytes, {} available",
            rest.len()
        )));
    }
    let sealed_footer = &rest[rest.len() - footer_length..];
    let footer_bytes = codec.decrypt(sealed_footer)?;
    let footer: Footer = rmp_serde::from_slice(&footer_bytes)
        .map_err(|e| Error::Corrupt(format!("pack footer decoding: {e}")))?;
    Ok(footer)
}

/// Read and verify the index, returning it with its footer.
pub fn read_index(codec: &Codec, payload: &[u8]) -> Result<(Footer, Vec<BlobEntry>)> {
    let footer = read_footer(codec, payload)?;
    let start = footer.index_offset as usize;
    let end = start + footer.index_length as usize;
    if end > payload.len() {
        return Err(Error::Corrupt(format!(
            "pack index at {start}..{end} out of bounds"
        )));
    }
    let index_bytes = codec.decrypt(&payload[start..end])?;
    if codec.mac(&index_bytes) != footer.index_mac {
        return Err(Error::Corrupt("pack index MAC mismatch".into()));
    }
    let index: Vec<BlobEntry> = rmp_serde::from_slice(&index_bytes)
        .map_err(|e| Error::Corrupt(format!("pack index decoding: {e}")))?;
    if index.len() != footer.count as usize {
        return Err(Error::Corrupt(format!(
            "pack footer counts {} blobs, index holds {}",
            footer.count,
            index.len()
        )));
    }
    Ok((footer, index))
}

/// Slice one blob's encoded bytes out of a full pack payload.
pub fn blob_bytes<'a>(payload: &'a [u8], entry: &BlobEntry) -> Result<&'a [u8]> {
    let start = entry.offset as usize;
    let end = start + entry.length as usize;
    if end > payload.len() {
        return Err(Error::Corrupt(format!(
            "pack blob {} at {start}..{end} out of bounds",
            entry.mac
        )));
    }
    Ok(&payload[start..end])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{CipherKey, Compression};
    use crate::mac::{HashAlgorithm, MacKey};

    fn test_codec() -> Codec {
        Codec::new(
            HashAlgorithm::HmacSha256,
            MacKey::from_bytes([3; 32]),
            Some(Compression::Lz4),
            Some(CipherKey::from_bytes([4; 32])),
        )
    }

    #[test]
    fn round_trip() -> Result<()> {
        let codec = test_codec();
        let mut writer = PackWriter::new();

        let first = codec.encode(ResourceType::Chunk, b"first chunk")?;
        let second = codec.encode(ResourceType::Chunk, b"second chunk")?;
        let first_mac = codec.mac(b"first chunk");
        let second_mac = codec.mac(b"second chunk");

        assert!(writer.put(
            ResourceType::Chunk,
            resource::current_version(ResourceType::Chunk),
            first_mac,
            &first
        ));
        assert!(writer.put(
            ResourceType::Chunk,
            resource::current_version(ResourceType::Chunk),
            second_mac,
            &second
        ));
        assert_eq!(writer.blob_count(), 2);

        let (payload, entries) = writer.finish(&codec, 1_700_000_000)?;

        let (footer, index) = read_index(&codec, &payload)?;
        assert_eq!(footer.count, 2);
        assert_eq!(footer.timestamp, 1_700_000_000);
        assert_eq!(index, entries);

        let encoded = blob_bytes(&payload, &index[1])?;
        let (_, plain) = codec.decode(ResourceType::Chunk, encoded)?;
        assert_eq!(plain, b"second chunk");
        Ok(())
    }

    #[test]
    fn within_pack_dedup() -> Result<()> {
        let codec = test_codec();
        let mut writer = PackWriter::new();
        let encoded = codec.encode(ResourceType::Chunk, b"same bytes")?;
        let mac = codec.mac(b"same bytes");
        let version = resource::current_version(ResourceType::Chunk);

        assert!(writer.put(ResourceType::Chunk, version, mac, &encoded));
        assert!(!writer.put(ResourceType::Chunk, version, mac, &encoded));
        assert_eq!(writer.blob_count(), 1);
        Ok(())
    }

    #[test]
    fn truncated_footer_is_corrupt() -> Result<()> {
        let codec = test_codec();
        let mut writer = PackWriter::new();
        let encoded = codec.encode(ResourceType::Chunk, b"bytes")?;
        writer.put(
            ResourceType::Chunk,
            resource::current_version(ResourceType::Chunk),
            codec.mac(b"bytes"),
            &encoded,
        );
        let (payload, _) = writer.finish(&codec, 0)?;

        assert!(matches!(
            read_footer(&codec, &payload[..3]),
            Err(Error::Corrupt(_))
        ));
        // Chopping into the sealed footer breaks the AEAD open.
        assert!(read_index(&codec, &payload[1..]).is_err());
        Ok(())
    }
}
