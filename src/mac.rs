//! Keyed MACs that identify everything in the repository.
//!
//! Every persisted unit of data is addressed by a 32-byte tag computed with
//! the repository's keyed hasher, so the tag doubles as an integrity witness:
//! two repositories with different keys produce disjoint identifier spaces.

use std::fmt;
use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use data_encoding::BASE32_DNSSEC as BASE32HEX;
use hmac::Mac as _;
use serde_derive::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = hmac::Hmac<Sha256>;

pub const MAC_SIZE: usize = 32;

/// The keyed tag (HMAC-SHA256 or keyed BLAKE3) identifying all blobs.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Mac([u8; MAC_SIZE]);

impl Mac {
    pub const ZERO: Mac = Mac([0; MAC_SIZE]);

    pub fn from_bytes(bytes: [u8; MAC_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MAC_SIZE] {
        &self.0
    }

    /// A git-like shortened version of the tag, unique enough for most UI uses.
    pub fn short_name(&self) -> String {
        let mut full = format!("{self}");
        let _rest = full.split_off(12);
        full
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ mac: {} }}", BASE32HEX.encode(&self.0))
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE32HEX.encode(&self.0))
    }
}

impl std::str::FromStr for Mac {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE32HEX
            .decode(s.as_bytes())
            .with_context(|| format!("Couldn't decode {s} as base32"))?;
        ensure!(bytes.len() == MAC_SIZE, "Expected a {MAC_SIZE}-byte MAC");
        let mut arr = [0; MAC_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Mac(arr))
    }
}

impl serde::Serialize for Mac {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Mac {
    fn deserialize<D>(deserializer: D) -> Result<Mac, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        if bytes.len() != MAC_SIZE {
            return Err(serde::de::Error::invalid_length(bytes.len(), &"32 bytes"));
        }
        let mut arr = [0; MAC_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Mac(arr))
    }
}

/// The secret the repository MACs everything with.
#[derive(Clone)]
pub struct MacKey([u8; MAC_SIZE]);

impl MacKey {
    pub fn from_bytes(bytes: [u8; MAC_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MAC_SIZE] {
        &self.0
    }
}

// Don't leak key material into logs.
impl fmt::Debug for MacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacKey(..)")
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
    Blake3,
}

/// A streaming keyed hasher. Feed it bytes, get a [`Mac`].
pub enum MacHasher {
    HmacSha256(HmacSha256),
    Blake3(Box<blake3::Hasher>),
}

impl MacHasher {
    pub fn new(algorithm: HashAlgorithm, key: &MacKey) -> Self {
        match algorithm {
            HashAlgorithm::HmacSha256 => {
                // A 32-byte key is always acceptable to HMAC.
                let h = HmacSha256::new_from_slice(&key.0).expect("HMAC accepts any key length");
                MacHasher::HmacSha256(h)
            }
            HashAlgorithm::Blake3 => {
                MacHasher::Blake3(Box::new(blake3::Hasher::new_keyed(&key.0)))
            }
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            MacHasher::HmacSha256(h) => h.update(bytes),
            MacHasher::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    pub fn finalize(self) -> Mac {
        match self {
            MacHasher::HmacSha256(h) => {
                let digest = h.finalize().into_bytes();
                let mut arr = [0; MAC_SIZE];
                arr.copy_from_slice(&digest);
                Mac(arr)
            }
            MacHasher::Blake3(h) => Mac(*h.finalize().as_bytes()),
        }
    }

    /// One-shot convenience for in-memory buffers.
    pub fn digest(algorithm: HashAlgorithm, key: &MacKey, bytes: &[u8]) -> Mac {
        let mut h = Self::new(algorithm, key);
        h.update(bytes);
        h.finalize()
    }
}

pub struct MacReader<R> {
    inner: R,
    hasher: MacHasher,
}

impl<R: Read> MacReader<R> {
    pub fn new(inner: R, algorithm: HashAlgorithm, key: &MacKey) -> Self {
        Self {
            inner,
            hasher: MacHasher::new(algorithm, key),
        }
    }

    pub fn finalize(self) -> (Mac, R) {
        (self.hasher.finalize(), self.inner)
    }
}

impl<R: Read> Read for MacReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

pub struct MacWriter<W> {
    inner: W,
    hasher: MacHasher,
}

impl<W: Write> MacWriter<W> {
    pub fn new(inner: W, algorithm: HashAlgorithm, key: &MacKey) -> Self {
        Self {
            inner,
            hasher: MacHasher::new(algorithm, key),
        }
    }

    pub fn finalize(self) -> (Mac, W) {
        (self.hasher.finalize(), self.inner)
    }
}

impl<W: Write> Write for MacWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
