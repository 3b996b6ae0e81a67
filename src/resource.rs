//! Every persisted unit carries a resource type and a packed version.
//!
//! The type tells readers what decoder to use; the version lets old readers
//! refuse (or adapt to) blobs written by newer code. The type -> current
//! version table is built once at startup and immutable after.

use std::fmt;
use std::sync::LazyLock;

use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum ResourceType {
    Config = 1,
    Lock = 2,
    State = 3,
    Packfile = 4,
    Snapshot = 5,
    Signature = 6,
    Chunk = 7,
    Object = 8,
    VfsBtree = 9,
    VfsNode = 10,
    VfsEntry = 11,
    ErrorBtree = 12,
    ErrorNode = 13,
    ErrorEntry = 14,
    XattrBtree = 15,
    XattrNode = 16,
    XattrEntry = 17,
    BtreeRoot = 18,
    BtreeNode = 19,
    Random = 20,
}

impl ResourceType {
    pub const ALL: &[ResourceType] = &[
        ResourceType::Config,
        ResourceType::Lock,
        ResourceType::State,
        ResourceType::Packfile,
        ResourceType::Snapshot,
        ResourceType::Signature,
        ResourceType::Chunk,
        ResourceType::Object,
        ResourceType::VfsBtree,
        ResourceType::VfsNode,
        ResourceType::VfsEntry,
        ResourceType::ErrorBtree,
        ResourceType::ErrorNode,
        ResourceType::ErrorEntry,
        ResourceType::XattrBtree,
        ResourceType::XattrNode,
        ResourceType::XattrEntry,
        ResourceType::BtreeRoot,
        ResourceType::BtreeNode,
        ResourceType::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Config => "config",
            ResourceType::Lock => "lock",
            ResourceType::State => "state",
            ResourceType::Packfile => "packfile",
            ResourceType::Snapshot => "snapshot",
            ResourceType::Signature => "signature",
            ResourceType::Chunk => "chunk",
            ResourceType::Object => "object",
            ResourceType::VfsBtree => "vfs-btree",
            ResourceType::VfsNode => "vfs-node",
            ResourceType::VfsEntry => "vfs-entry",
            ResourceType::ErrorBtree => "error-btree",
            ResourceType::ErrorNode => "error-node",
            ResourceType::ErrorEntry => "error-entry",
            ResourceType::XattrBtree => "xattr-btree",
            ResourceType::XattrNode => "xattr-node",
            ResourceType::XattrEntry => "xattr-entry",
            ResourceType::BtreeRoot => "btree-root",
            ResourceType::BtreeNode => "btree-node",
            ResourceType::Random => "random",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ResourceType> for u32 {
    fn from(rt: ResourceType) -> u32 {
        rt as u32
    }
}

impl TryFrom<u32> for ResourceType {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|rt| *rt as u32 == raw)
            .ok_or_else(|| Error::Corrupt(format!("unknown resource type {raw}")))
    }
}

/// major.minor.patch packed into 32 bits: `0x00MMmmpp`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u32);

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Version(((major as u32) << 16) | ((minor as u32) << 8) | patch as u32)
    }

    pub fn from_raw(raw: u32) -> Self {
        Version(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn major(&self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    pub fn minor(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn patch(&self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

static REGISTRY: LazyLock<FxHashMap<ResourceType, Version>> = LazyLock::new(|| {
    let mut table = FxHashMap::default();
    let mut register = |rt, version| {
        assert!(
            table.insert(rt, version).is_none(),
            "{rt} registered twice"
        );
    };
    register(ResourceType::Config, Version::new(1, 0, 0));
    register(ResourceType::Lock, Version::new(1, 0, 0));
    register(ResourceType::State, Version::new(1, 0, 0));
    register(ResourceType::Packfile, Version::new(1, 0, 0));
    register(ResourceType::Snapshot, Version::new(1, 0, 0));
    register(ResourceType::Signature, Version::new(1, 0, 0));
    register(ResourceType::Chunk, Version::new(1, 0, 0));
    register(ResourceType::Object, Version::new(1, 0, 0));
    register(ResourceType::VfsBtree, Version::new(1, 0, 0));
    register(ResourceType::VfsNode, Version::new(1, 0, 0));
    register(ResourceType::VfsEntry, Version::new(1, 0, 0));
    register(ResourceType::ErrorBtree, Version::new(1, 0, 0));
    register(ResourceType::ErrorNode, Version::new(1, 0, 0));
    register(ResourceType::ErrorEntry, Version::new(1, 0, 0));
    register(ResourceType::XattrBtree, Version::new(1, 0, 0));
    register(ResourceType::XattrNode, Version::new(1, 0, 0));
    register(ResourceType::XattrEntry, Version::new(1, 0, 0));
    register(ResourceType::BtreeRoot, Version::new(1, 0, 0));
    register(ResourceType::BtreeNode, Version::new(1, 0, 0));
    register(ResourceType::Random, Version::new(1, 0, 0));
    table
});

/// The version this build writes for the given resource type.
pub fn current_version(rt: ResourceType) -> Version {
    *REGISTRY
        .get(&rt)
        .expect("all resource types registered at startup")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_packing() {
        let v = Version::new(1, 2, 3);
        assert_eq!(v.major(), 1);
        assert_eq!(v.minor(), 2);
        assert_eq!(v.patch(), 3);
        assert_eq!(v.raw(), 0x0001_0203);
        assert_eq!(format!("{v}"), "1.2.3");
    }

    #[test]
    fn type_round_trip() {
        for rt in ResourceType::ALL {
            assert_eq!(ResourceType::try_from(*rt as u32).unwrap(), *rt);
        }
        assert!(ResourceType::try_from(0xdead).is_err());
    }

    #[test]
    fn every_type_registered() {
        for rt in ResourceType::ALL {
            assert_eq!(current_version(*rt), Version::new(1, 0, 0));
        }
    }
}
