//! What feeds a backup: anything that can scan itself into records and
//! open readers for the files it described.
//!
//! The backup pipeline consumes this contract and nothing more, so a
//! directory tree, an FTP server, or a test fixture all look the same
//! from the inside.

use std::io::Read;

use crossbeam_channel::Receiver;

use crate::error::Result;
use crate::vfs::FileInfo;

pub mod fs;
pub mod memory;

#[derive(Debug, Clone)]
pub struct ScanRecord {
    /// Normalized ("/"-rooted) path within the source.
    pub pathname: String,
    pub file_info: FileInfo,
    /// Symlink target, when the record is a symlink.
    pub target: Option<String>,
    /// Set when this record describes a single extended attribute
    /// rather than the file proper.
    pub xattr_name: Option<String>,
    /// Names of extended attributes present on this file.
    pub xattr_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScanError {
    pub pathname: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub enum ScanResult {
    Record(ScanRecord),
    Error(ScanError),
}

pub trait Importer: Send + Sync {
    fn kind(&self) -> &'static str;
    fn origin(&self) -> String;
    fn root(&self) -> String;

    /// Start scanning; records and errors arrive on the returned channel
    /// until the producer is done.
    fn scan(&self) -> Result<Receiver<ScanResult>>;

    fn reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>>;

    fn xattr_reader(&self, pathname: &str, name: &str) -> Result<Box<dyn Read + Send>>;
}
