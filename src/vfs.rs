//! The snapshot's filesystem view: entries, errors, xattrs, and the
//! readers that stitch file content back together.
//!
//! A filesystem is three B-trees (entries by path, errors by path, xattrs
//! by `path:name`) plus an optional content-type index for mime-filtered
//! search. Entry values are MACs of [`VfsEntry`] blobs, so the trees stay
//! small and entries load lazily.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use globset::GlobSet;
use serde_derive::{Deserialize, Serialize};

use crate::btree::{self, LazyTree, TreeDescriptor};
use crate::error::{Error, Result};
use crate::mac::Mac;
use crate::object::Object;
use crate::repository::Repository;
use crate::resource::{self, ResourceType, Version};

// mode bits, straight out of inode(7)
const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;
const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const S_ISVTX: u32 = 0o1000;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Device,
    Pipe,
    Socket,
}

/// Backup-relevant metadata from `stat()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    /// Seconds since the epoch.
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub dev: u64,
    pub ino: u64,
    pub username: String,
    pub groupname: String,
}

impl FileInfo {
    pub fn kind(&self) -> EntryKind {
        match self.mode & S_IFMT {
            S_IFLNK => EntryKind::Symlink,
            S_IFDIR => EntryKind::Directory,
            S_IFBLK | S_IFCHR => EntryKind::Device,
            S_IFIFO => EntryKind::Pipe,
            S_IFSOCK => EntryKind::Socket,
            _ => EntryKind::File,
        }
    }

    /// "Has this file changed?" for cache reuse: mtime + size + mode.
    /// Deliberately not uid/gid/nlink; a chown doesn't re-chunk content.
    pub fn same_content(&self, other: &FileInfo) -> bool {
        self.size == other.size && self.mode == other.mode && self.mtime == other.mtime
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VfsEntry {
    pub version: Version,
    pub parent: String,
    pub file_info: FileInfo,
    #[serde(default)]
    pub object: Option<Mac>,
    #[serde(default)]
    pub symlink_target: Option<String>,
    #[serde(default)]
    pub summary: Option<Summary>,
    #[serde(default)]
    pub xattr_names: Vec<String>,
    #[serde(default)]
    pub classifications: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub file_attributes: Option<u32>,
}

impl VfsEntry {
    pub fn new(parent: String, file_info: FileInfo) -> Self {
        Self {
            version: resource::current_version(ResourceType::VfsEntry),
            parent,
            file_info,
            object: None,
            symlink_target: None,
            summary: None,
            xattr_names: Vec::new(),
            classifications: Vec::new(),
            tags: Vec::new(),
            file_attributes: None,
        }
    }

    pub fn path(&self) -> String {
        join_path(&self.parent, &self.file_info.name)
    }

    pub fn kind(&self) -> EntryKind {
        self.file_info.kind()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Internal(format!("entry encoding: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Corrupt(format!("entry decoding: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorItem {
    pub version: Version,
    pub name: String,
    pub error: String,
}

impl ErrorItem {
    pub fn new(name: String, error: String) -> Self {
        Self {
            version: resource::current_version(ResourceType::ErrorEntry),
            name,
            error,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Internal(format!("error item encoding: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::Corrupt(format!("error item decoding: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XattrItem {
    pub version: Version,
    pub parent: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub object: Mac,
    pub size: u64,
}

impl XattrItem {
    pub fn to_path(&self) -> String {
        format!("{}/{}:{}", self.parent, self.name, self.kind)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Internal(format!("xattr encoding: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Corrupt(format!("xattr decoding: {e}")))
    }
}

/// Key for the xattr tree.
pub fn xattr_key(path: &str, name: &str) -> String {
    format!("{path}:{name}")
}

/// Join a parent path and an entry name. The root is its own parent.
pub fn join_path(parent: &str, name: &str) -> String {
    if name == "/" {
        "/".to_owned()
    } else if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Split a normalized path into (parent, name).
pub fn split_path(path: &str) -> (String, String) {
    if path == "/" {
        return ("/".to_owned(), "/".to_owned());
    }
    match path.rfind('/') {
        Some(0) => ("/".to_owned(), path[1..].to_owned()),
        Some(i) => (path[..i].to_owned(), path[i + 1..].to_owned()),
        None => ("/".to_owned(), path.to_owned()),
    }
}

/// Leading slash on, trailing slash off (except the root itself).
pub fn normalize_path(path: &str) -> String {
    let mut p = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    };
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    p
}

/// Directory-local (or subtree-wide) aggregates.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub devices: u64,
    pub pipes: u64,
    pub sockets: u64,
    pub setuid: u64,
    pub setgid: u64,
    pub sticky: u64,
    pub children: u64,
    pub objects: u64,
    pub chunks: u64,
    pub size: u64,
    pub min_size: u64,
    pub max_size: u64,
    pub min_mtime: i64,
    pub max_mtime: i64,
    pub min_entropy: f64,
    pub max_entropy: f64,
    pub entropy_sum: f64,
    pub mime_audio: u64,
    pub mime_video: u64,
    pub mime_image: u64,
    pub mime_text: u64,
    pub mime_application: u64,
    pub mime_other: u64,
    pub errors: u64,
}

impl Stats {
    /// Count one direct child entry.
    pub fn record_entry(&mut self, entry: &VfsEntry) {
        self.children += 1;
        let info = &entry.file_info;
        match entry.kind() {
            EntryKind::File => {
                self.files += 1;
                if self.files == 1 {
                    self.min_size = info.size;
                    self.max_size = info.size;
                    self.min_mtime = info.mtime;
                    self.max_mtime = info.mtime;
                } else {
                    self.min_size = self.min_size.min(info.size);
                    self.max_size = self.max_size.max(info.size);
                    self.min_mtime = self.min_mtime.min(info.mtime);
                    self.max_mtime = self.max_mtime.max(info.mtime);
                }
                self.size += info.size;
            }
            EntryKind::Directory => self.directories += 1,
            EntryKind::Symlink => self.symlinks += 1,
            EntryKind::Device => self.devices += 1,
            EntryKind::Pipe => self.pipes += 1,
            EntryKind::Socket => self.sockets += 1,
        }
        if info.mode & S_ISUID != 0 {
            self.setuid += 1;
        }
        if info.mode & S_ISGID != 0 {
            self.setgid += 1;
        }
        if info.mode & S_ISVTX != 0 {
            self.sticky += 1;
        }
    }

    pub fn record_object(&mut self, object: &Object) {
        self.record_content(object.chunks.len() as u64, object.entropy, &object.content_type);
    }

    /// Same accounting as [`record_object`](Self::record_object), from
    /// stats captured at chunking time instead of a loaded object.
    pub fn record_content(&mut self, chunks: u64, entropy: f64, content_type: &str) {
        if self.objects == 0 {
            self.min_entropy = entropy;
            self.max_entropy = entropy;
        } else {
            self.min_entropy = self.min_entropy.min(entropy);
            self.max_entropy = self.max_entropy.max(entropy);
        }
        self.objects += 1;
        self.chunks += chunks;
        self.entropy_sum += entropy;

        match content_type.split('/').next().unwrap_or("") {
            "audio" => self.mime_audio += 1,
            "video" => self.mime_video += 1,
            "image" => self.mime_image += 1,
            "text" => self.mime_text += 1,
            "application" => self.mime_application += 1,
            _ => self.mime_other += 1,
        }
    }

    pub fn avg_size(&self) -> u64 {
        if self.files == 0 { 0 } else { self.size / self.files }
    }

    pub fn avg_entropy(&self) -> f64 {
        if self.objects == 0 {
            0.0
        } else {
            self.entropy_sum / self.objects as f64
        }
    }

    /// Fold another stats block in (used to roll descendants up).
    pub fn merge(&mut self, other: &Stats) {
        if other.files > 0 {
            if self.files == 0 {
                self.min_size = other.min_size;
                self.max_size = other.max_size;
                self.min_mtime = other.min_mtime;
                self.max_mtime = other.max_mtime;
            } else {
                self.min_size = self.min_size.min(other.min_size);
                self.max_size = self.max_size.max(other.max_size);
                self.min_mtime = self.min_mtime.min(other.min_mtime);
                self.max_mtime = self.max_mtime.max(other.max_mtime);
            }
        }
        if other.objects > 0 {
            if self.objects == 0 {
                self.min_entropy = other.min_entropy;
                self.max_entropy = other.max_entropy;
            } else {
                self.min_entropy = self.min_entropy.min(other.min_entropy);
                self.max_entropy = self.max_entropy.max(other.max_entropy);
            }
        }
        self.files += other.files;
        self.directories += other.directories;
        self.symlinks += other.symlinks;
        self.devices += other.devices;
        self.pipes += other.pipes;
        self.sockets += other.sockets;
        self.setuid += other.setuid;
        self.setgid += other.setgid;
        self.sticky += other.sticky;
        self.children += other.children;
        self.objects += other.objects;
        self.chunks += other.chunks;
        self.size += other.size;
        self.entropy_sum += other.entropy_sum;
        self.mime_audio += other.mime_audio;
        self.mime_video += other.mime_video;
        self.mime_image += other.mime_image;
        self.mime_text += other.mime_text;
        self.mime_application += other.mime_application;
        self.mime_other += other.mime_other;
        self.errors += other.errors;
    }
}

/// `directory` covers direct children; `below` accumulates the same stats
/// over every descendant.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub directory: Stats,
    pub below: Stats,
}

/// The three tree roots one snapshot source persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VfsRoots {
    pub entries: TreeDescriptor,
    pub errors: TreeDescriptor,
    pub xattrs: TreeDescriptor,
}

fn tree_fetcher(
    repo: Arc<Repository>,
    node_type: ResourceType,
) -> impl Fn(&Mac) -> Result<Vec<u8>> + Send + Sync + 'static {
    move |mac| repo.get_blob(node_type, mac)
}

pub struct SearchOpts {
    pub prefix: String,
    pub recursive: bool,
    /// Mime prefixes ("image/", "text/plain"); empty matches everything.
    pub mimes: Vec<String>,
    pub names: Option<GlobSet>,
}

impl Default for SearchOpts {
    fn default() -> Self {
        Self {
            prefix: "/".to_owned(),
            recursive: true,
            mimes: Vec::new(),
            names: None,
        }
    }
}

/// A read-only view over one snapshot source.
pub struct Filesystem {
    repo: Arc<Repository>,
    entries: LazyTree<String, Mac>,
    errors: LazyTree<String, Mac>,
    xattrs: LazyTree<String, Mac>,
    content_types: Option<LazyTree<String, Mac>>,
}

impl Filesystem {
    pub fn open(
        repo: Arc<Repository>,
        roots: &VfsRoots,
        content_types: Option<&TreeDescriptor>,
    ) -> Self {
        Self {
            entries: LazyTree::open(
                roots.entries,
                btree::path_order,
                tree_fetcher(repo.clone(), ResourceType::VfsNode),
            ),
            errors: LazyTree::open(
                roots.errors,
                btree::path_order,
                tree_fetcher(repo.clone(), ResourceType::ErrorNode),
            ),
            xattrs: LazyTree::open(
                roots.xattrs,
                btree::byte_order,
                tree_fetcher(repo.clone(), ResourceType::XattrNode),
            ),
            content_types: content_types.map(|d| {
                LazyTree::open(
                    *d,
                    btree::byte_order,
                    tree_fetcher(repo.clone(), ResourceType::BtreeNode),
                )
            }),
            repo,
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.len()
    }

    fn load_entry(&self, mac: &Mac) -> Result<VfsEntry> {
        VfsEntry::from_bytes(&self.repo.get_blob(ResourceType::VfsEntry, mac)?)
    }

    pub fn get_entry(&self, path: &str) -> Result<VfsEntry> {
        let path = normalize_path(path);
        let mac = self
            .entries
            .find(&path)?
            .ok_or_else(|| Error::NotFound(format!("entry {path}")))?;
        self.load_entry(&mac)
    }

    /// Direct children of a directory, in name order.
    pub fn children(&self, path: &str) -> Result<Vec<VfsEntry>> {
        let dir = normalize_path(path);
        let prefix = if dir == "/" { "/".to_owned() } else { format!("{dir}/") };
        let mut out = Vec::new();
        for item in self.entries.scan_from(&prefix)? {
            let (key, mac) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key == dir {
                // The root is its own prefix; skip it.
                continue;
            }
            if key[prefix.len()..].contains('/') {
                // The comparator sorts by depth first, so the first deeper
                // key means the direct-children region is behind us.
                break;
            }
            out.push(self.load_entry(&mac)?);
        }
        Ok(out)
    }

    /// Every path under `prefix` (the prefix itself included), in the
    /// comparator's order: a directory's children before anything deeper.
    pub fn walk(&self, prefix: &str) -> Result<impl Iterator<Item = Result<(String, VfsEntry)>> + '_> {
        let root = normalize_path(prefix);
        let subtree = if root == "/" { "/".to_owned() } else { format!("{root}/") };
        let iter = self.entries.scan_from(&root)?;
        Ok(WalkIter {
            fs: self,
            inner: iter,
            root,
            subtree,
        })
    }

    /// Lazy sequence over regular files beneath `prefix`.
    pub fn files(
        &self,
        prefix: &str,
    ) -> Result<impl Iterator<Item = Result<(String, VfsEntry)>> + '_> {
        Ok(self.walk(prefix)?.filter(|item| match item {
            Ok((_, entry)) => entry.kind() == EntryKind::File,
            Err(_) => true,
        }))
    }

    /// Scan errors recorded beneath `prefix`.
    pub fn errors(&self, beneath: &str) -> Result<Vec<ErrorItem>> {
        let root = normalize_path(beneath);
        let subtree = if root == "/" { "/".to_owned() } else { format!("{root}/") };
        let mut out = Vec::new();
        for item in self.errors.scan_from(&root)? {
            let (key, mac) = item?;
            if key != root && !key.starts_with(&subtree) {
                continue;
            }
            out.push(ErrorItem::from_bytes(
                &self.repo.get_blob(ResourceType::ErrorEntry, &mac)?,
            )?);
        }
        Ok(out)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.len()
    }

    /// Every xattr item in the snapshot, in key order.
    pub fn xattr_items(&self) -> Result<Vec<(String, XattrItem)>> {
        let mut out = Vec::new();
        for item in self.xattrs.iter()? {
            let (key, mac) = item?;
            out.push((
                key,
                XattrItem::from_bytes(&self.repo.get_blob(ResourceType::XattrEntry, &mac)?)?,
            ));
        }
        Ok(out)
    }

    pub fn xattr(&self, path: &str, name: &str) -> Result<Option<XattrItem>> {
        let key = xattr_key(&normalize_path(path), name);
        match self.xattrs.find(&key)? {
            None => Ok(None),
            Some(mac) => Ok(Some(XattrItem::from_bytes(
                &self.repo.get_blob(ResourceType::XattrEntry, &mac)?,
            )?)),
        }
    }

    /// Composable filtered search. With a mime filter, a recursive scope,
    /// and a content-type index present, iterate the index instead of the
    /// whole VFS.
    pub fn search(&self, opts: &SearchOpts) -> Result<Vec<(String, VfsEntry)>> {
        let prefix = normalize_path(&opts.prefix);
        let matches_mime = |content_type: &str| {
            opts.mimes.is_empty() || opts.mimes.iter().any(|m| content_type.starts_with(m))
        };
        let matches_name = |path: &str| match &opts.names {
            None => true,
            Some(set) => {
                let name = path.rsplit('/').next().unwrap_or(path);
                set.is_match(name)
            }
        };
        let in_scope = |path: &str| {
            if !opts.recursive {
                let (parent, _) = split_path(path);
                return parent == prefix;
            }
            path == prefix || path.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
                || prefix == "/"
        };

        let mut out = Vec::new();

        if opts.recursive && !opts.mimes.is_empty() {
            if let Some(index) = &self.content_types {
                for mime in &opts.mimes {
                    let start = format!("/{mime}");
                    for item in index.scan_from(&start)? {
                        let (key, mac) = item?;
                        if !key.starts_with(&start) {
                            break;
                        }
                        let entry = self.load_entry(&mac)?;
                        let path = entry.path();
                        if in_scope(&path) && matches_name(&path) {
                            out.push((path, entry));
                        }
                    }
                }
                out.sort_by(|a, b| btree::path_order(&a.0, &b.0));
                out.dedup_by(|a, b| a.0 == b.0);
                return Ok(out);
            }
        }

        for item in self.walk(&prefix)? {
            let (path, entry) = item?;
            if entry.kind() != EntryKind::File {
                continue;
            }
            if !in_scope(&path) || !matches_name(&path) {
                continue;
            }
            if !opts.mimes.is_empty() {
                let Some(object_mac) = entry.object else {
                    continue;
                };
                let object =
                    Object::from_bytes(&self.repo.get_blob(ResourceType::Object, &object_mac)?)?;
                if !matches_mime(&object.content_type) {
                    continue;
                }
            }
            out.push((path, entry));
        }
        Ok(out)
    }

    /// Load the object behind a regular file's entry.
    pub fn open_object(&self, entry: &VfsEntry) -> Result<Object> {
        let mac = entry
            .object
            .ok_or_else(|| Error::InvalidArgument(format!("{} has no content", entry.path())))?;
        Object::from_bytes(&self.repo.get_blob(ResourceType::Object, &mac)?)
    }

    /// A seekable reader over a file's chunk list.
    pub fn open_file(&self, entry: &VfsEntry) -> Result<ChunkReader> {
        Ok(ChunkReader::new(self.repo.clone(), self.open_object(entry)?))
    }
}

struct WalkIter<'f> {
    fs: &'f Filesystem,
    inner: btree::LazyScanIter<'f, String, Mac>,
    root: String,
    subtree: String,
}

impl Iterator for WalkIter<'_> {
    type Item = Result<(String, VfsEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = match self.inner.next()? {
                Ok(pair) => pair,
                Err(e) => return Some(Err(e)),
            };
            let (path, mac) = item;
            // Depth-ordered keys scatter a subtree across depth regions;
            // filter rather than stop.
            if path != self.root && !path.starts_with(&self.subtree) && self.root != "/" {
                continue;
            }
            return match self.fs.load_entry(&mac) {
                Ok(entry) => Some(Ok((path, entry))),
                Err(e) => Some(Err(e)),
            };
        }
    }
}

/// Stitches chunks into one seekable stream.
pub struct ChunkReader {
    repo: Arc<Repository>,
    object: Object,
    /// cumulative[i] = bytes before chunk i; one extra entry for the total.
    cumulative: Vec<u64>,
    pos: u64,
    current: Option<(usize, Vec<u8>)>,
}

impl ChunkReader {
    pub fn new(repo: Arc<Repository>, object: Object) -> Self {
        let mut cumulative = Vec::with_capacity(object.chunks.len() + 1);
        let mut total = 0u64;
        for chunk in &object.chunks {
            cumulative.push(total);
            total += chunk.length as u64;
        }
        cumulative.push(total);
        Self {
            repo,
            object,
            cumulative,
            pos: 0,
            current: None,
        }
    }

    pub fn len(&self) -> u64 {
        *self.cumulative.last().unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn chunk_at(&self, pos: u64) -> Option<(usize, u64)> {
        if pos >= self.len() {
            return None;
        }
        // Last index whose start <= pos.
        let i = self.cumulative.partition_point(|start| *start <= pos) - 1;
        Some((i, pos - self.cumulative[i]))
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some((index, offset)) = self.chunk_at(self.pos) else {
            return Ok(0);
        };

        if self.current.as_ref().map(|(i, _)| *i) != Some(index) {
            let mac = self.object.chunks[index].content_mac;
            let bytes = self
                .repo
                .get_blob(ResourceType::Chunk, &mac)
                .map_err(io::Error::other)?;
            if bytes.len() != self.object.chunks[index].length as usize {
                return Err(io::Error::other(Error::Corrupt(format!(
                    "chunk {mac} is {} bytes, object says {}",
                    bytes.len(),
                    self.object.chunks[index].length
                ))));
            }
            self.current = Some((index, bytes));
        }

        let (_, bytes) = self.current.as_ref().unwrap();
        let available = &bytes[offset as usize..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ChunkReader {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let len = self.len() as i64;
        let next = match target {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(name: &str, mode: u32, size: u64, mtime: i64) -> FileInfo {
        FileInfo {
            name: name.to_owned(),
            size,
            mode,
            mtime,
            uid: 1000,
            gid: 1000,
            nlink: 1,
            dev: 0,
            ino: 0,
            username: "me".to_owned(),
            groupname: "me".to_owned(),
        }
    }

    #[test]
    fn kinds_from_mode() {
        assert_eq!(info("f", S_IFREG | 0o644, 0, 0).kind(), EntryKind::File);
        assert_eq!(info("d", S_IFDIR | 0o755, 0, 0).kind(), EntryKind::Directory);
        assert_eq!(info("l", S_IFLNK | 0o777, 0, 0).kind(), EntryKind::Symlink);
        assert_eq!(info("p", S_IFIFO | 0o600, 0, 0).kind(), EntryKind::Pipe);
        assert_eq!(info("s", S_IFSOCK | 0o600, 0, 0).kind(), EntryKind::Socket);
        assert_eq!(info("b", S_IFBLK | 0o600, 0, 0).kind(), EntryKind::Device);
    }

    #[test]
    fn change_detection_ignores_ownership() {
        let a = info("f", S_IFREG | 0o644, 10, 100);
        let mut b = a.clone();
        b.uid = 0;
        b.nlink = 4;
        assert!(a.same_content(&b));

        b.mtime = 101;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn path_helpers() {
        assert_eq!(join_path("/", "etc"), "/etc");
        assert_eq!(join_path("/etc", "ssh"), "/etc/ssh");
        assert_eq!(join_path("", "/"), "/");

        assert_eq!(split_path("/etc/ssh"), ("/etc".to_owned(), "ssh".to_owned()));
        assert_eq!(split_path("/etc"), ("/".to_owned(), "etc".to_owned()));
        assert_eq!(split_path("/"), ("/".to_owned(), "/".to_owned()));

        assert_eq!(normalize_path("etc/"), "/etc");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/a/b/"), "/a/b");
    }

    #[test]
    fn entry_round_trip() -> Result<()> {
        let mut entry = VfsEntry::new("/etc".to_owned(), info("motd", S_IFREG | 0o644, 42, 7));
        entry.object = Some(Mac::from_bytes([9; 32]));
        entry.tags.push("config".to_owned());
        assert_eq!(entry.path(), "/etc/motd");

        let bytes = entry.to_bytes()?;
        assert_eq!(VfsEntry::from_bytes(&bytes)?, entry);
        Ok(())
    }

    #[test]
    fn stats_aggregate() {
        let mut stats = Stats::default();
        stats.record_entry(&VfsEntry::new(
            "/".to_owned(),
            info("a", S_IFREG | 0o644, 100, 50),
        ));
        stats.record_entry(&VfsEntry::new(
            "/".to_owned(),
            info("b", S_IFREG | 0o4755, 300, 10),
        ));
        stats.record_entry(&VfsEntry::new(
            "/".to_owned(),
            info("d", S_IFDIR | 0o755, 0, 0),
        ));

        assert_eq!(stats.files, 2);
        assert_eq!(stats.directories, 1);
        assert_eq!(stats.children, 3);
        assert_eq!(stats.setuid, 1);
        assert_eq!(stats.min_size, 100);
        assert_eq!(stats.max_size, 300);
        assert_eq!(stats.avg_size(), 200);
        assert_eq!(stats.min_mtime, 10);
        assert_eq!(stats.max_mtime, 50);
    }

    #[test]
    fn stats_merge_handles_empty_sides() {
        let mut empty = Stats::default();
        let mut full = Stats::default();
        full.record_entry(&VfsEntry::new(
            "/".to_owned(),
            info("a", S_IFREG | 0o644, 100, 50),
        ));

        empty.merge(&full);
        assert_eq!(empty.min_size, 100);
        assert_eq!(empty.files, 1);

        // Merging an empty block changes nothing.
        let snapshot = empty.clone();
        empty.merge(&Stats::default());
        assert_eq!(empty, snapshot);
    }
}
