//! A backend that stores everything as MAC-addressed buffers.
//!
//! Great for testing

use std::collections::HashMap;
use std::io::{self, prelude::*};
use std::sync::{Arc, RwLock};

use super::{Backend, Kind};
use crate::error::{Error, Result};
use crate::mac::Mac;

#[derive(Default)]
pub struct MemoryBackend {
    config: RwLock<Option<Vec<u8>>>,
    blobs: RwLock<HashMap<(&'static str, Mac), Arc<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes stored across a namespace. Handy for dedup assertions.
    pub fn bytes_stored(&self, kind: Kind) -> u64 {
        self.blobs
            .read()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| *ns == kind.namespace())
            .map(|(_, v)| v.len() as u64)
            .sum()
    }
}

impl Backend for MemoryBackend {
    fn create(&self, config: &[u8]) -> Result<()> {
        let mut slot = self.config.write().unwrap();
        if slot.is_some() {
            return Err(Error::InvalidArgument(
                "memory backend already holds a repository".to_owned(),
            ));
        }
        *slot = Some(config.to_vec());
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        self.config
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::NotFound("memory repository".to_owned()))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn list(&self, kind: Kind) -> Result<Vec<Mac>> {
        let mut macs: Vec<Mac> = self
            .blobs
            .read()
            .unwrap()
            .keys()
            .filter(|(ns, _)| *ns == kind.namespace())
            .map(|(_, mac)| *mac)
            .collect();
        macs.sort();
        Ok(macs)
    }

    fn put(&self, kind: Kind, mac: &Mac, from: &mut dyn Read) -> Result<()> {
        let mut buf = Vec::new();
        io::copy(from, &mut buf)?;
        // Duplicate puts of the same MAC carry the same bytes; keep the first.
        self.blobs
            .write()
            .unwrap()
            .entry((kind.namespace(), *mac))
            .or_insert_with(|| Arc::new(buf));
        Ok(())
    }

    fn get(&self, kind: Kind, mac: &Mac) -> Result<Box<dyn Read + Send>> {
        let blob = self
            .blobs
            .read()
            .unwrap()
            .get(&(kind.namespace(), *mac))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}/{mac}", kind.namespace())))?;
        Ok(Box::new(ArcCursor { blob, pos: 0 }))
    }

    fn delete(&self, kind: Kind, mac: &Mac) -> Result<()> {
        self.blobs.write().unwrap().remove(&(kind.namespace(), *mac));
        Ok(())
    }

    fn get_packfile_blob(&self, mac: &Mac, offset: u64, length: u32) -> Result<Vec<u8>> {
        let blob = self
            .blobs
            .read()
            .unwrap()
            .get(&(Kind::Packfile.namespace(), *mac))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("packfiles/{mac}")))?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > blob.len() {
            return Err(Error::Corrupt(format!(
                "packfile {mac} too short for blob at {offset}+{length}"
            )));
        }
        Ok(blob[start..end].to_vec())
    }
}

/// `Cursor<Arc<Vec<u8>>>` without cloning the buffer per reader.
struct ArcCursor {
    blob: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for ArcCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.blob[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.create(b"conf")?;
        assert_eq!(backend.open()?, b"conf");

        let mac = Mac::from_bytes([5; 32]);
        backend.put(Kind::Packfile, &mac, &mut io::Cursor::new(b"hello world"))?;
        let b: &dyn Backend = &backend;
        assert_eq!(b.read_all(Kind::Packfile, &mac)?, b"hello world");
        assert_eq!(backend.get_packfile_blob(&mac, 6, 5)?, b"world");
        assert_eq!(backend.bytes_stored(Kind::Packfile), 11);

        backend.put(Kind::Packfile, &mac, &mut io::Cursor::new(b"hello world"))?;
        assert_eq!(backend.bytes_stored(Kind::Packfile), 11);
        Ok(())
    }
}
