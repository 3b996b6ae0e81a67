//! An importer over a fixture tree held in memory.
//!
//! Great for testing: deterministic scan order, injectable read failures,
//! and extended attributes without OS support.

use std::collections::BTreeMap;
use std::io::{self, Read};

use crossbeam_channel::{Receiver, bounded};

use super::{Importer, ScanError, ScanRecord, ScanResult};
use crate::error::{Error, Result};
use crate::vfs::FileInfo;

const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone)]
enum Node {
    File {
        content: Vec<u8>,
        mode: u32,
        mtime: i64,
        ino: u64,
        nlink: u32,
    },
    /// Scans fine, fails on open: the "permission denied" fixture.
    Denied { mode: u32 },
    Dir { mode: u32 },
    Symlink { target: String },
}

#[derive(Debug, Default)]
pub struct MemoryImporter {
    nodes: BTreeMap<String, Node>,
    xattrs: BTreeMap<(String, String), Vec<u8>>,
}

impl MemoryImporter {
    pub fn new() -> Self {
        let mut importer = Self::default();
        importer.nodes.insert("/".to_owned(), Node::Dir { mode: 0o755 });
        importer
    }

    fn add_parents(&mut self, path: &str) {
        let mut parent = crate::vfs::split_path(path).0;
        while !self.nodes.contains_key(&parent) {
            self.nodes
                .insert(parent.clone(), Node::Dir { mode: 0o755 });
            parent = crate::vfs::split_path(&parent).0;
        }
    }

    pub fn with_file(mut self, path: &str, content: &[u8], mode: u32) -> Self {
        self.add_parents(path);
        self.nodes.insert(
            path.to_owned(),
            Node::File {
                content: content.to_vec(),
                mode,
                mtime: 1_700_000_000,
                ino: 0,
                nlink: 1,
            },
        );
        self
    }

    /// Two paths sharing one inode, for hard-link round-trips.
    pub fn with_hardlinked_files(mut self, first: &str, second: &str, content: &[u8]) -> Self {
        let ino = 7_000 + self.nodes.len() as u64;
        for path in [first, second] {
            self.add_parents(path);
            self.nodes.insert(
                path.to_owned(),
                Node::File {
                    content: content.to_vec(),
                    mode: 0o644,
                    mtime: 1_700_000_000,
                    ino,
                    nlink: 2,
                },
            );
        }
        self
    }

    pub fn with_denied(mut self, path: &str) -> Self {
        self.add_parents(path);
        self.nodes.insert(path.to_owned(), Node::Denied { mode: 0o000 });
        self
    }

    pub fn with_dir(mut self, path: &str, mode: u32) -> Self {
        self.add_parents(path);
        self.nodes.insert(path.to_owned(), Node::Dir { mode });
        self
    }

    pub fn with_symlink(mut self, path: &str, target: &str) -> Self {
        self.add_parents(path);
        self.nodes.insert(
            path.to_owned(),
            Node::Symlink {
                target: target.to_owned(),
            },
        );
        self
    }

    pub fn with_xattr(mut self, path: &str, name: &str, value: &[u8]) -> Self {
        self.xattrs
            .insert((path.to_owned(), name.to_owned()), value.to_vec());
        self
    }

    fn info_for(&self, path: &str, node: &Node) -> FileInfo {
        let name = if path == "/" {
            "/".to_owned()
        } else {
            crate::vfs::split_path(path).1
        };
        let (size, mode, mtime, ino, nlink) = match node {
            Node::File {
                content,
                mode,
                mtime,
                ino,
                nlink,
            } => (content.len() as u64, S_IFREG | mode, *mtime, *ino, *nlink),
            Node::Denied { mode } => (0, S_IFREG | mode, 0, 0, 1),
            Node::Dir { mode } => (0, S_IFDIR | mode, 0, 0, 1),
            Node::Symlink { target } => (target.len() as u64, S_IFLNK | 0o777, 0, 0, 1),
        };
        FileInfo {
            name,
            size,
            mode,
            mtime,
            uid: 1000,
            gid: 1000,
            nlink,
            dev: 1,
            ino,
            username: "tester".to_owned(),
            groupname: "testers".to_owned(),
        }
    }
}

impl Importer for MemoryImporter {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn origin(&self) -> String {
        "memory".to_owned()
    }

    fn root(&self) -> String {
        "/".to_owned()
    }

    fn scan(&self) -> Result<Receiver<ScanResult>> {
        // Everything is known up front; a channel deep enough for the lot
        // means no producer thread.
        let (tx, rx) = bounded(self.nodes.len() + self.xattrs.len());
        for (path, node) in &self.nodes {
            let xattr_names: Vec<String> = self
                .xattrs
                .keys()
                .filter(|(p, _)| p == path)
                .map(|(_, n)| n.clone())
                .collect();
            tx.send(ScanResult::Record(ScanRecord {
                pathname: path.clone(),
                file_info: self.info_for(path, node),
                target: match node {
                    Node::Symlink { target } => Some(target.clone()),
                    _ => None,
                },
                xattr_name: None,
                xattr_names,
            }))
            .unwrap();
        }
        Ok(rx)
    }

    fn reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>> {
        match self.nodes.get(pathname) {
            Some(Node::File { content, .. }) => Ok(Box::new(io::Cursor::new(content.clone()))),
            Some(Node::Denied { .. }) => Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {pathname}"),
            ))),
            Some(_) => Err(Error::InvalidArgument(format!("{pathname} isn't a file"))),
            None => Err(Error::NotFound(pathname.to_owned())),
        }
    }

    fn xattr_reader(&self, pathname: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        self.xattrs
            .get(&(pathname.to_owned(), name.to_owned()))
            .map(|v| Box::new(io::Cursor::new(v.clone())) as Box<dyn Read + Send>)
            .ok_or_else(|| Error::NotFound(format!("{pathname} xattr {name}")))
    }
}
