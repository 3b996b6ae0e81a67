//! Lightweight operation tallies, grouped by subsystem.
//!
//! Hot paths bump a relaxed atomic and nothing else; whoever wants numbers
//! takes a [`Tally`] snapshot and renders it. The CLI does that once on
//! exit, tests can do it mid-run to assert cache behavior.

use std::fmt;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use enum_map::{Enum, EnumMap};
use tracing::*;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Enum)]
pub enum Op {
    StateMerge,
    ChunkDeduped,
    ChunkPacked,
    EntryCacheHit,
    EntryCacheMiss,
    SnapshotCacheHit,
    SnapshotCacheMiss,
    BtreeNodeRead,
    BtreeNodeWritten,
    CheckMemoized,
    PackFlushed,
}

impl Op {
    /// Which subsystem a tally line files under.
    fn section(&self) -> &'static str {
        match self {
            Op::StateMerge | Op::PackFlushed => "repository",
            Op::ChunkDeduped | Op::ChunkPacked => "chunking",
            Op::EntryCacheHit | Op::EntryCacheMiss => "vfs cache",
            Op::SnapshotCacheHit | Op::SnapshotCacheMiss => "snapshot cache",
            Op::BtreeNodeRead | Op::BtreeNodeWritten => "trees",
            Op::CheckMemoized => "check",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Op::StateMerge => "states merged",
            Op::ChunkDeduped => "chunks deduplicated",
            Op::ChunkPacked => "chunks packed",
            Op::EntryCacheHit => "entry hits",
            Op::EntryCacheMiss => "entry misses",
            Op::SnapshotCacheHit => "header hits",
            Op::SnapshotCacheMiss => "header misses",
            Op::BtreeNodeRead => "nodes read",
            Op::BtreeNodeWritten => "nodes written",
            Op::CheckMemoized => "verdicts replayed",
            Op::PackFlushed => "packs flushed",
        }
    }
}

static TALLIES: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    TALLIES[to].fetch_add(amount, Ordering::Relaxed);
}

/// A point-in-time copy of every counter.
#[derive(Debug, Clone)]
pub struct Tally {
    counts: EnumMap<Op, usize>,
}

impl Tally {
    pub fn get(&self, op: Op) -> usize {
        self.counts[op]
    }

    /// Nothing happened at all? Then there is nothing worth printing.
    pub fn is_quiet(&self) -> bool {
        self.counts.values().all(|count| *count == 0)
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current_section = "";
        for (op, count) in self.counts.iter().filter(|(_, count)| **count > 0) {
            if op.section() != current_section {
                current_section = op.section();
                writeln!(f, "{current_section}:")?;
            }
            writeln!(f, "  {} {}", count, op.label())?;
        }
        Ok(())
    }
}

pub fn snapshot() -> Tally {
    Tally {
        counts: EnumMap::from_fn(|op| TALLIES[op].load(Ordering::Relaxed)),
    }
}

/// Log the grouped tally at debug level; quiet runs log nothing.
pub fn report() {
    let tally = snapshot();
    if tally.is_quiet() {
        return;
    }
    for line in tally.to_string().lines() {
        debug!("{line}");
    }
}
