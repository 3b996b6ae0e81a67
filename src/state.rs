//! Where is every blob? State files answer, one transaction at a time.
//!
//! Each transaction (a backup, or a mid-backup flush) emits one state file:
//! the list of blob -> packfile locations it created, plus any tombstones.
//! Opening a repository merges every state file into an in-memory
//! [`AggregatedState`]; merging is commutative because entries for the same
//! MAC must agree, and disagreement is corruption, not a tie to break.

use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mac::Mac;
use crate::resource::{ResourceType, Version};

/// Byte range of one blob inside one packfile.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub packfile: Mac,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaEntry {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub version: Version,
    pub blob: Mac,
    pub location: Location,
    pub flags: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedEntry {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub blob: Mac,
    /// Seconds since the epoch; lets maintenance order deletions.
    pub when: i64,
}

/// One transaction's worth of deltas and tombstones.
#[derive(Debug, Default, PartialEq)]
pub struct StateFile {
    pub deltas: Vec<DeltaEntry>,
    pub deleted: Vec<DeletedEntry>,
}

impl StateFile {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.deleted.is_empty()
    }

    /// Payload layout: a count-prefixed run of length-prefixed msgpack
    /// `DeltaEntry` records, then the same shape for `DeletedEntry`.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        write_records(&mut out, &self.deltas)?;
        write_records(&mut out, &self.deleted)?;
        Ok(out)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut cursor = payload;
        let deltas = read_records(&mut cursor)?;
        let deleted = read_records(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(Error::Corrupt(format!(
                "{} trailing bytes after state records",
                cursor.len()
            )));
        }
        Ok(Self { deltas, deleted })
    }
}

fn write_records<T: serde::Serialize>(out: &mut Vec<u8>, records: &[T]) -> Result<()> {
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        let bytes = rmp_serde::to_vec(record)
            .map_err(|e| Error::Internal(format!("state record encoding: {e}")))?;
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytes);
    }
    Ok(())
}

fn read_records<T: serde::de::DeserializeOwned>(cursor: &mut &[u8]) -> Result<Vec<T>> {
    let count = read_u32(cursor)?;
    let mut records = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        let len = read_u32(cursor)? as usize;
        if cursor.len() < len {
            return Err(Error::Corrupt("state record truncated".into()));
        }
        let (bytes, rest) = cursor.split_at(len);
        *cursor = rest;
        records.push(
            rmp_serde::from_slice(bytes)
                .map_err(|e| Error::Corrupt(format!("state record decoding: {e}")))?,
        );
    }
    Ok(records)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(Error::Corrupt("state file truncated".into()));
    }
    let (bytes, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// What the aggregated index remembers about one blob.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LocationEntry {
    pub version: Version,
    pub location: Location,
    pub flags: u32,
}

/// The merge of every state file the backend lists.
#[derive(Debug, Default)]
pub struct AggregatedState {
    locations: FxHashMap<(ResourceType, Mac), LocationEntry>,
    tombstones: FxHashMap<(ResourceType, Mac), i64>,
}

impl AggregatedState {
    /// Merge one transaction in. Order doesn't matter; conflicts do.
    pub fn merge(&mut self, state: &StateFile) -> Result<()> {
        for deleted in &state.deleted {
            let key = (deleted.kind, deleted.blob);
            if state.deltas.iter().any(|d| (d.kind, d.blob) == key) {
                // Delete + put of one MAC within a single transaction has no
                // well-defined winner; refuse rather than guess.
                return Err(Error::Corrupt(format!(
                    "state file both writes and deletes {} blob {}",
                    deleted.kind, deleted.blob
                )));
            }
            self.tombstones.insert(key, deleted.when);
        }

        for delta in &state.deltas {
            self.insert_delta(delta)?;
        }
        Ok(())
    }

    pub fn insert_delta(&mut self, delta: &DeltaEntry) -> Result<()> {
        let entry = LocationEntry {
            version: delta.version,
            location: delta.location,
            flags: delta.flags,
        };
        match self.locations.insert((delta.kind, delta.blob), entry) {
            Some(previous) if previous.location != delta.location => Err(Error::Corrupt(format!(
                "{} blob {} recorded in packfile {} and packfile {}",
                delta.kind, delta.blob, previous.location.packfile, delta.location.packfile
            ))),
            _ => Ok(()),
        }
    }

    pub fn lookup(&self, kind: ResourceType, blob: &Mac) -> Option<&LocationEntry> {
        let key = (kind, *blob);
        if self.tombstones.contains_key(&key) {
            return None;
        }
        self.locations.get(&key)
    }

    pub fn contains(&self, kind: ResourceType, blob: &Mac) -> bool {
        self.lookup(kind, blob).is_some()
    }

    /// All live blob MACs of the given kind, sorted.
    pub fn blobs_of(&self, kind: ResourceType) -> Vec<Mac> {
        let mut macs: Vec<Mac> = self
            .locations
            .keys()
            .filter(|(k, mac)| *k == kind && !self.tombstones.contains_key(&(*k, *mac)))
            .map(|(_, mac)| *mac)
            .collect();
        macs.sort();
        macs
    }

    /// Every packfile some live blob points into.
    pub fn referenced_packfiles(&self) -> Vec<Mac> {
        let mut macs: Vec<Mac> = self
            .locations
            .iter()
            .filter(|(key, _)| !self.tombstones.contains_key(*key))
            .map(|(_, entry)| entry.location.packfile)
            .collect();
        macs.sort();
        macs.dedup();
        macs
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}
