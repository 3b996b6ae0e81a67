//! Places a repository can live: a directory, a test buffer, (eventually)
//! cloud object stores.
//!
//! A backend is a flat MAC-addressed blob store split into three kinds:
//! states, packfiles, and locks, plus one well-known configuration blob.
//! All puts are atomic, and a duplicate put of a MAC that already exists is
//! an idempotent no-op: two writers racing on the same content-addressed
//! blob wrote the same bytes.

use std::io::prelude::*;

use crate::error::Result;
use crate::mac::Mac;

pub mod fs;
pub mod memory;

/// Which of the three blob namespaces an operation targets.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    State,
    Packfile,
    Lock,
}

impl Kind {
    pub fn namespace(&self) -> &'static str {
        match self {
            Kind::State => "states",
            Kind::Packfile => "packfiles",
            Kind::Lock => "locks",
        }
    }
}

pub trait Backend: Send + Sync {
    /// Initialize the store layout and persist the configuration blob.
    fn create(&self, config: &[u8]) -> Result<()>;

    /// Open an existing store, returning the configuration blob.
    fn open(&self) -> Result<Vec<u8>>;

    fn close(&self) -> Result<()>;

    fn list(&self, kind: Kind) -> Result<Vec<Mac>>;
    fn put(&self, kind: Kind, mac: &Mac, from: &mut dyn Read) -> Result<()>;
    fn get(&self, kind: Kind, mac: &Mac) -> Result<Box<dyn Read + Send>>;
    fn delete(&self, kind: Kind, mac: &Mac) -> Result<()>;

    /// Fetch `length` bytes at `offset` within a stored packfile.
    /// This is the hot path for blob reads; backends should serve it
    /// without fetching the whole pack.
    fn get_packfile_blob(&self, mac: &Mac, offset: u64, length: u32) -> Result<Vec<u8>>;
}

/// Convenience wrappers so call sites read like the operations they are.
impl dyn Backend + '_ {
    pub fn states(&self) -> Result<Vec<Mac>> {
        self.list(Kind::State)
    }

    pub fn packfiles(&self) -> Result<Vec<Mac>> {
        self.list(Kind::Packfile)
    }

    pub fn locks(&self) -> Result<Vec<Mac>> {
        self.list(Kind::Lock)
    }

    pub fn read_all(&self, kind: Kind, mac: &Mac) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.get(kind, mac)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn put_bytes(&self, kind: Kind, mac: &Mac, bytes: &[u8]) -> Result<()> {
        self.put(kind, mac, &mut std::io::Cursor::new(bytes))
    }
}
