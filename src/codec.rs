//! Frame, seal, and unseal every resource we persist.
//!
//! The wire shape of a resource is
//!
//! ```text
//! [ 8B magic | 4B LE resource type | 4B LE version | payload ... | 32B MAC ]
//! ```
//!
//! where the MAC covers magic, type, version, and payload. Above the frame,
//! optional layers compose: the payload is compressed, then AEAD-sealed, then
//! framed. Reading mirrors that, and a trailing-MAC mismatch surfaces as
//! [`Error::Corrupt`] before a single payload byte is trusted... well, the
//! streaming reader hands bytes out as it goes, so *callers* that need
//! all-or-nothing semantics should buffer before acting.

use std::io;
use std::io::prelude::*;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mac::{HashAlgorithm, Mac, MacHasher, MacKey, MAC_SIZE};
use crate::resource::{self, ResourceType, Version};

pub const MAGIC: &[u8; 8] = b"_KLOSET_";
/// Accepted on read for repositories written before the rename.
pub const LEGACY_MAGIC: &[u8; 8] = b"_PLAKAR_";

pub const HEADER_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Lz4,
    Zstd,
    Gzip,
}

/// The AEAD secret. Distinct from the MAC key so that rotating one
/// doesn't force rewriting everything keyed by the other.
#[derive(Clone)]
pub struct CipherKey([u8; 32]);

impl CipherKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CipherKey(..)")
    }
}

/// Everything needed to turn a plaintext resource into repository bytes
/// and back: the keyed hasher plus the optional compression and
/// encryption layers from the repository configuration.
#[derive(Debug, Clone)]
pub struct Codec {
    pub hashing: HashAlgorithm,
    key: MacKey,
    pub compression: Option<Compression>,
    cipher: Option<CipherKey>,
}

impl Codec {
    pub fn new(
        hashing: HashAlgorithm,
        key: MacKey,
        compression: Option<Compression>,
        cipher: Option<CipherKey>,
    ) -> Self {
        Self {
            hashing,
            key,
            compression,
            cipher,
        }
    }

    pub fn mac_key(&self) -> &MacKey {
        &self.key
    }

    /// MAC the given bytes under the repository key.
    pub fn mac(&self, bytes: &[u8]) -> Mac {
        MacHasher::digest(self.hashing, &self.key, bytes)
    }

    pub fn hasher(&self) -> MacHasher {
        MacHasher::new(self.hashing, &self.key)
    }

    /// payload -> compress -> encrypt -> frame
    pub fn encode(&self, rt: ResourceType, plain: &[u8]) -> Result<Vec<u8>> {
        self.encode_versioned(rt, resource::current_version(rt), plain)
    }

    pub fn encode_versioned(
        &self,
        rt: ResourceType,
        version: Version,
        plain: &[u8],
    ) -> Result<Vec<u8>> {
        let sealed = self.seal(plain)?;

        let mut out = Vec::with_capacity(HEADER_SIZE + sealed.len() + MAC_SIZE);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(rt as u32).to_le_bytes());
        out.extend_from_slice(&version.raw().to_le_bytes());
        out.extend_from_slice(&sealed);

        let mac = self.mac(&out);
        out.extend_from_slice(mac.as_bytes());
        Ok(out)
    }

    /// Mirror of [`encode`](Self::encode): unframe, decrypt, decompress.
    pub fn decode(&self, rt: ResourceType, bytes: &[u8]) -> Result<(Version, Vec<u8>)> {
        let (found, version, sealed) = self.unframe(bytes)?;
        if found != rt {
            return Err(Error::Corrupt(format!(
                "expected a {rt} resource, found {found}"
            )));
        }
        Ok((version, self.unseal(sealed)?))
    }

    /// Unframe without insisting on a particular resource type.
    pub fn decode_any(&self, bytes: &[u8]) -> Result<(ResourceType, Version, Vec<u8>)> {
        let (rt, version, sealed) = self.unframe(bytes)?;
        Ok((rt, version, self.unseal(sealed)?))
    }

    fn unframe<'a>(&self, bytes: &'a [u8]) -> Result<(ResourceType, Version, &'a [u8])> {
        if bytes.len() < HEADER_SIZE + MAC_SIZE {
            return Err(Error::Corrupt(format!(
                "framed resource truncated at {} bytes",
                bytes.len()
            )));
        }
        let magic = &bytes[..8];
        if magic != MAGIC && magic != LEGACY_MAGIC {
            return Err(Error::Corrupt(format!(
                "bad magic {}",
                String::from_utf8_lossy(magic)
            )));
        }
        let rt =
            ResourceType::try_from(u32::from_le_bytes(bytes[8..12].try_into().unwrap()))?;
        let version = Version::from_raw(u32::from_le_bytes(bytes[12..16].try_into().unwrap()));

        let (covered, trailer) = bytes.split_at(bytes.len() - MAC_SIZE);
        let expected = self.mac(covered);
        if trailer != expected.as_bytes() {
            return Err(Error::Corrupt(format!("MAC mismatch on {rt} resource")));
        }
        Ok((rt, version, &covered[HEADER_SIZE..]))
    }

    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let compressed = match self.compression {
            None => plain.to_vec(),
            Some(c) => compress(c, plain)?,
        };
        self.encrypt(&compressed)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.decrypt(sealed)?;
        match self.compression {
            None => Ok(compressed),
            Some(c) => decompress(c, &compressed),
        }
    }

    /// AEAD-seal bytes without the frame or compression.
    /// Packfile indexes and footers are sealed this way, each with its
    /// own nonce, so that one can be read without the other.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher_key) = &self.cipher else {
            return Ok(plain.to_vec());
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(cipher_key.as_bytes()));
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| Error::Internal("AEAD encryption failed".to_owned()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher_key) = &self.cipher else {
            return Ok(bytes.to_vec());
        };
        if bytes.len() < NONCE_SIZE {
            return Err(Error::Corrupt("sealed resource shorter than its nonce".into()));
        }
        let (nonce, sealed) = bytes.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(cipher_key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::Corrupt("AEAD open failed".into()))
    }
}

fn compress(algorithm: Compression, plain: &[u8]) -> Result<Vec<u8>> {
    let out = match algorithm {
        Compression::Lz4 => {
            let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
            enc.write_all(plain)?;
            enc.finish().map_err(io::Error::other)?
        }
        Compression::Zstd => zstd::stream::encode_all(plain, 0)?,
        Compression::Gzip => {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(plain)?;
            enc.finish()?
        }
    };
    Ok(out)
}

fn decompress(algorithm: Compression, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match algorithm {
        Compression::Lz4 => {
            lz4_flex::frame::FrameDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| Error::Corrupt(format!("lz4 stream: {e}")))?;
        }
        Compression::Zstd => {
            out = zstd::stream::decode_all(bytes)
                .map_err(|e| Error::Corrupt(format!("zstd stream: {e}")))?;
        }
        Compression::Gzip => {
            flate2::read::GzDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| Error::Corrupt(format!("gzip stream: {e}")))?;
        }
    }
    Ok(out)
}

/// Streaming framer: emits the header, forwards writes while MACing them,
/// appends the trailing MAC on [`finalize`](Self::finalize).
pub struct FramedWriter<W> {
    inner: W,
    hasher: Option<MacHasher>,
}

impl<W: Write> FramedWriter<W> {
    pub fn new(mut inner: W, codec: &Codec, rt: ResourceType) -> Result<Self> {
        let version = resource::current_version(rt);
        let mut header = [0u8; HEADER_SIZE];
        header[..8].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&(rt as u32).to_le_bytes());
        header[12..16].copy_from_slice(&version.raw().to_le_bytes());
        inner.write_all(&header)?;

        let mut hasher = codec.hasher();
        hasher.update(&header);
        Ok(Self {
            inner,
            hasher: Some(hasher),
        })
    }

    /// Write the trailing MAC; returns it along with the inner writer.
    pub fn finalize(mut self) -> Result<(Mac, W)> {
        let mac = self.hasher.take().expect("finalize called once").finalize();
        self.inner.write_all(mac.as_bytes())?;
        Ok((mac, self.inner))
    }
}

impl<W: Write> Write for FramedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher
            .as_mut()
            .expect("write after finalize")
            .update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming unframer: validates the header up front, then hands payload
/// bytes out while withholding the final 32 so the trailing MAC can be
/// compared against the running hasher at EOF.
pub struct FramedReader<R> {
    inner: R,
    hasher: Option<MacHasher>,
    rt: ResourceType,
    version: Version,
    pending: Vec<u8>,
    saw_eof: bool,
    verified: bool,
}

impl<R: Read> FramedReader<R> {
    pub fn new(mut inner: R, codec: &Codec, expected: ResourceType) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE];
        inner
            .read_exact(&mut header)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    Error::Corrupt("framed resource shorter than its header".into())
                }
                _ => Error::Io(e),
            })?;

        let magic = &header[..8];
        if magic != MAGIC && magic != LEGACY_MAGIC {
            return Err(Error::Corrupt(format!(
                "bad magic {}",
                String::from_utf8_lossy(magic)
            )));
        }
        let rt =
            ResourceType::try_from(u32::from_le_bytes(header[8..12].try_into().unwrap()))?;
        if rt != expected {
            return Err(Error::Corrupt(format!(
                "expected a {expected} resource, found {rt}"
            )));
        }
        let version = Version::from_raw(u32::from_le_bytes(header[12..16].try_into().unwrap()));

        let mut hasher = codec.hasher();
        hasher.update(&header);
        Ok(Self {
            inner,
            hasher: Some(hasher),
            rt,
            version,
            pending: Vec::new(),
            saw_eof: false,
            verified: false,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    fn verify_trailer(&mut self) -> io::Result<()> {
        if self.verified {
            return Ok(());
        }
        if self.pending.len() != MAC_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                Error::Corrupt(format!("{} resource truncated", self.rt)),
            ));
        }
        let computed = self.hasher.take().expect("trailer verified once").finalize();
        if self.pending != computed.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                Error::Corrupt(format!("MAC mismatch on {} resource", self.rt)),
            ));
        }
        self.verified = true;
        Ok(())
    }
}

impl<R: Read> Read for FramedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // Anything beyond a held-back trailer's worth is deliverable.
            let deliverable = self.pending.len().saturating_sub(MAC_SIZE);
            if deliverable > 0 {
                let n = deliverable.min(buf.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.hasher
                    .as_mut()
                    .expect("hasher lives until the trailer check")
                    .update(&self.pending[..n]);
                self.pending.drain(..n);
                return Ok(n);
            }
            if self.saw_eof {
                self.verify_trailer()?;
                return Ok(0);
            }

            let mut scratch = [0u8; 8192];
            let n = self.inner.read(&mut scratch)?;
            if n == 0 {
                self.saw_eof = true;
            } else {
                self.pending.extend_from_slice(&scratch[..n]);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_codec(compression: Option<Compression>, encrypted: bool) -> Codec {
        Codec::new(
            HashAlgorithm::HmacSha256,
            MacKey::from_bytes([7; 32]),
            compression,
            encrypted.then(|| CipherKey::from_bytes([9; 32])),
        )
    }

    const PAYLOAD: &[u8] = b"the quick brown fox jumps over the lazy dog";

    #[test]
    fn round_trip_plain() -> Result<()> {
        let codec = test_codec(None, false);
        let framed = codec.encode(ResourceType::Chunk, PAYLOAD)?;
        let (version, plain) = codec.decode(ResourceType::Chunk, &framed)?;
        assert_eq!(version, resource::current_version(ResourceType::Chunk));
        assert_eq!(plain, PAYLOAD);
        Ok(())
    }

    #[test]
    fn round_trip_all_layers() -> Result<()> {
        for compression in [Compression::Lz4, Compression::Zstd, Compression::Gzip] {
            let codec = test_codec(Some(compression), true);
            let framed = codec.encode(ResourceType::Object, PAYLOAD)?;
            let (_, plain) = codec.decode(ResourceType::Object, &framed)?;
            assert_eq!(plain, PAYLOAD);
        }
        Ok(())
    }

    #[test]
    fn flipped_bit_is_corrupt() -> Result<()> {
        let codec = test_codec(Some(Compression::Lz4), false);
        let mut framed = codec.encode(ResourceType::Chunk, PAYLOAD)?;
        let middle = framed.len() / 2;
        framed[middle] ^= 0x01;
        assert!(matches!(
            codec.decode(ResourceType::Chunk, &framed),
            Err(Error::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn wrong_type_is_corrupt() -> Result<()> {
        let codec = test_codec(None, false);
        let framed = codec.encode(ResourceType::Chunk, PAYLOAD)?;
        assert!(matches!(
            codec.decode(ResourceType::Object, &framed),
            Err(Error::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn legacy_magic_accepted() -> Result<()> {
        let codec = test_codec(None, false);
        // Hand-roll a legacy frame: same layout, older magic.
        let mut framed = Vec::new();
        framed.extend_from_slice(LEGACY_MAGIC);
        framed.extend_from_slice(&(ResourceType::Chunk as u32).to_le_bytes());
        framed.extend_from_slice(
            &resource::current_version(ResourceType::Chunk).raw().to_le_bytes(),
        );
        framed.extend_from_slice(PAYLOAD);
        let mac = codec.mac(&framed);
        framed.extend_from_slice(mac.as_bytes());

        let (_, plain) = codec.decode(ResourceType::Chunk, &framed)?;
        assert_eq!(plain, PAYLOAD);
        Ok(())
    }

    #[test]
    fn streaming_round_trip() -> Result<()> {
        let codec = test_codec(None, false);

        let mut w = FramedWriter::new(Vec::new(), &codec, ResourceType::State)?;
        w.write_all(PAYLOAD)?;
        let (mac, framed) = w.finalize()?;
        assert_eq!(mac, codec.mac(&framed[..framed.len() - MAC_SIZE]));

        let mut r = FramedReader::new(framed.as_slice(), &codec, ResourceType::State)?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        assert_eq!(out, PAYLOAD);
        Ok(())
    }

    #[test]
    fn streaming_reader_catches_truncation() -> Result<()> {
        let codec = test_codec(None, false);
        let mut w = FramedWriter::new(Vec::new(), &codec, ResourceType::State)?;
        w.write_all(PAYLOAD)?;
        let (_, mut framed) = w.finalize()?;
        framed.truncate(framed.len() - 1);

        let mut r = FramedReader::new(framed.as_slice(), &codec, ResourceType::State)?;
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).is_err());
        Ok(())
    }

    #[test]
    fn encrypt_detached_round_trip() -> Result<()> {
        let codec = test_codec(None, true);
        let sealed = codec.encrypt(PAYLOAD)?;
        assert_ne!(sealed, PAYLOAD);
        assert_eq!(codec.decrypt(&sealed)?, PAYLOAD);

        // Every invocation gets its own nonce.
        assert_ne!(codec.encrypt(PAYLOAD)?, sealed);
        Ok(())
    }
}
