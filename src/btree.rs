//! A generic ordered map with external node storage.
//!
//! Snapshots persist their filesystem view, error list, xattrs, and
//! content-type index as B-trees whose nodes are content-addressed blobs.
//! Building happens in an in-memory arena with integer pointers; a built
//! tree is then persisted bottom-up, rewriting child pointers as MACs.
//! Reading is lazy: [`LazyTree`] fetches nodes on demand through whatever
//! closure the caller provides, so the same code serves a repository, a
//! cache, or a test HashMap.
//!
//! Trees are insert-only. Nothing here deletes, which spares us rebalancing
//! and underflow entirely.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

use crate::counters;
use crate::error::{Error, Result};
use crate::mac::Mac;

pub const DEFAULT_ORDER: usize = 50;

pub type Cmp<K> = fn(&K, &K) -> Ordering;

/// Keys sorted by depth first, then byte order, so a directory's entries
/// form one contiguous range: `scan_from(dir + "/")` walks exactly the
/// subtree rooted at `dir`.
pub fn path_order(a: &String, b: &String) -> Ordering {
    let depth = |p: &String| p.bytes().filter(|b| *b == b'/').count();
    depth(a).cmp(&depth(b)).then_with(|| a.cmp(b))
}

/// Plain byte order, for trees keyed by something other than paths.
pub fn byte_order<K: Ord>(a: &K, b: &K) -> Ordering {
    a.cmp(b)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node<K, V, P> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub children: Vec<P>,
}

impl<K, V, P> Node<K, V, P> {
    fn empty() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Root descriptor persisted alongside the nodes.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDescriptor {
    pub order: u32,
    pub count: u64,
    pub root: Mac,
}

impl TreeDescriptor {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self)
            .map_err(|e| Error::Internal(format!("tree descriptor encoding: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::Corrupt(format!("tree descriptor decoding: {e}")))
    }
}

/// First index whose key is >= `target` under `cmp`.
fn lower_bound<K>(keys: &[K], target: &K, cmp: Cmp<K>) -> usize {
    keys.partition_point(|k| cmp(k, target) == Ordering::Less)
}

/// The in-memory builder: an arena of nodes addressed by index.
pub struct BTree<K, V> {
    order: usize,
    cmp: Cmp<K>,
    arena: Vec<Node<K, V, u32>>,
    root: u32,
    count: u64,
}

impl<K: Clone, V: Clone> BTree<K, V> {
    pub fn new(cmp: Cmp<K>) -> Self {
        Self::with_order(cmp, DEFAULT_ORDER)
    }

    pub fn with_order(cmp: Cmp<K>, order: usize) -> Self {
        assert!(order >= 2);
        Self {
            order,
            cmp,
            arena: vec![Node::empty()],
            root: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Insert, replacing (and returning) any previous value for the key.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.arena[self.root as usize].keys.len() >= self.order {
            // Grow upward: fresh root over the old one, then split.
            let old_root = self.root;
            let new_root = self.alloc(Node {
                keys: Vec::new(),
                values: Vec::new(),
                children: vec![old_root],
            });
            self.root = new_root;
            self.split_child(new_root, 0);
        }
        let replaced = self.insert_nonfull(self.root, key, value);
        if replaced.is_none() {
            self.count += 1;
        }
        replaced
    }

    fn insert_nonfull(&mut self, ptr: u32, key: K, value: V) -> Option<V> {
        let cmp = self.cmp;
        let mut ptr = ptr;
        loop {
            let node = &self.arena[ptr as usize];
            let i = lower_bound(&node.keys, &key, cmp);
            if i < node.keys.len() && cmp(&node.keys[i], &key) == Ordering::Equal {
                let node = &mut self.arena[ptr as usize];
                return Some(std::mem::replace(&mut node.values[i], value));
            }
            if node.is_leaf() {
                let node = &mut self.arena[ptr as usize];
                node.keys.insert(i, key);
                node.values.insert(i, value);
                return None;
            }

            let child = node.children[i];
            if self.arena[child as usize].keys.len() >= self.order {
                self.split_child(ptr, i);
                // The promoted median changed this node; re-aim.
                continue;
            }
            ptr = child;
        }
    }

    /// Split the full child at `parent.children[i]`, promoting its median.
    fn split_child(&mut self, parent: u32, i: usize) {
        let child_ptr = self.arena[parent as usize].children[i];
        let mid = self.arena[child_ptr as usize].keys.len() / 2;

        let (mid_key, mid_value, right) = {
            let child = &mut self.arena[child_ptr as usize];
            let right_keys = child.keys.split_off(mid + 1);
            let right_values = child.values.split_off(mid + 1);
            let right_children = if child.is_leaf() {
                Vec::new()
            } else {
                child.children.split_off(mid + 1)
            };
            let mid_key = child.keys.pop().unwrap();
            let mid_value = child.values.pop().unwrap();
            (
                mid_key,
                mid_value,
                Node {
                    keys: right_keys,
                    values: right_values,
                    children: right_children,
                },
            )
        };

        let right_ptr = self.alloc(right);
        let parent = &mut self.arena[parent as usize];
        parent.keys.insert(i, mid_key);
        parent.values.insert(i, mid_value);
        parent.children.insert(i + 1, right_ptr);
    }

    fn alloc(&mut self, node: Node<K, V, u32>) -> u32 {
        self.arena.push(node);
        (self.arena.len() - 1) as u32
    }

    pub fn find(&self, key: &K) -> Option<&V> {
        let cmp = self.cmp;
        let mut ptr = self.root;
        loop {
            let node = &self.arena[ptr as usize];
            let i = lower_bound(&node.keys, key, cmp);
            if i < node.keys.len() && cmp(&node.keys[i], key) == Ordering::Equal {
                return Some(&node.values[i]);
            }
            if node.is_leaf() {
                return None;
            }
            ptr = node.children[i];
        }
    }

    /// Forward iterator over all pairs with key >= `start`.
    pub fn scan_from<'t>(&'t self, start: &K) -> ScanIter<'t, K, V> {
        let mut stack = Vec::new();
        let cmp = self.cmp;
        let mut ptr = self.root;
        loop {
            let node = &self.arena[ptr as usize];
            let i = lower_bound(&node.keys, start, cmp);
            if i < node.keys.len() {
                stack.push((ptr, i));
            }
            if node.is_leaf() {
                break;
            }
            ptr = node.children[i];
        }
        ScanIter { tree: self, stack }
    }

    pub fn iter(&self) -> ScanIter<'_, K, V> {
        let mut iter = ScanIter {
            tree: self,
            stack: Vec::new(),
        };
        iter.push_leftmost(self.root);
        iter
    }

    /// Write every node bottom-up through `put_node`, returning the root
    /// descriptor. The builder stays usable afterwards.
    pub fn persist<F>(&self, put_node: &mut F) -> Result<TreeDescriptor>
    where
        F: FnMut(&Node<K, V, Mac>) -> Result<Mac>,
    {
        let root = self.persist_node(self.root, put_node)?;
        Ok(TreeDescriptor {
            order: self.order as u32,
            count: self.count,
            root,
        })
    }

    fn persist_node<F>(&self, ptr: u32, put_node: &mut F) -> Result<Mac>
    where
        F: FnMut(&Node<K, V, Mac>) -> Result<Mac>,
    {
        let node = &self.arena[ptr as usize];
        let mut children = Vec::with_capacity(node.children.len());
        for child in &node.children {
            children.push(self.persist_node(*child, put_node)?);
        }
        let mapped = Node {
            keys: node.keys.clone(),
            values: node.values.clone(),
            children,
        };
        counters::bump(counters::Op::BtreeNodeWritten);
        put_node(&mapped)
    }
}

pub struct ScanIter<'t, K, V> {
    tree: &'t BTree<K, V>,
    stack: Vec<(u32, usize)>,
}

impl<'t, K: Clone, V: Clone> ScanIter<'t, K, V> {
    fn push_leftmost(&mut self, mut ptr: u32) {
        loop {
            let node = &self.tree.arena[ptr as usize];
            if node.keys.is_empty() {
                // Only an empty root looks like this.
                return;
            }
            self.stack.push((ptr, 0));
            if node.is_leaf() {
                return;
            }
            ptr = node.children[0];
        }
    }
}

impl<'t, K: Clone, V: Clone> Iterator for ScanIter<'t, K, V> {
    type Item = (&'t K, &'t V);

    fn next(&mut self) -> Option<Self::Item> {
        let (ptr, i) = self.stack.pop()?;
        let node = &self.tree.arena[ptr as usize];
        let item = (&node.keys[i], &node.values[i]);

        if i + 1 < node.keys.len() {
            self.stack.push((ptr, i + 1));
        }
        if !node.is_leaf() {
            // Everything under child i+1 sorts after key i and before key i+1.
            self.push_leftmost_child(node.children[i + 1]);
        }
        Some(item)
    }
}

impl<'t, K: Clone, V: Clone> ScanIter<'t, K, V> {
    fn push_leftmost_child(&mut self, mut ptr: u32) {
        loop {
            let node = &self.tree.arena[ptr as usize];
            debug_assert!(!node.keys.is_empty());
            self.stack.push((ptr, 0));
            if node.is_leaf() {
                return;
            }
            ptr = node.children[0];
        }
    }
}

/// Read-side tree: nodes come from a fetcher, verified frames and all,
/// and get cached here so hot paths near the root stay cheap.
pub struct LazyTree<K, V> {
    descriptor: TreeDescriptor,
    cmp: Cmp<K>,
    fetch: Box<dyn Fn(&Mac) -> Result<Vec<u8>> + Send + Sync>,
    cache: Mutex<FxHashMap<Mac, Arc<Node<K, V, Mac>>>>,
}

impl<K, V> LazyTree<K, V>
where
    K: Clone + serde::de::DeserializeOwned + Send + Sync + 'static,
    V: Clone + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    pub fn open<F>(descriptor: TreeDescriptor, cmp: Cmp<K>, fetch: F) -> Self
    where
        F: Fn(&Mac) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            cmp,
            fetch: Box::new(fetch),
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn descriptor(&self) -> &TreeDescriptor {
        &self.descriptor
    }

    pub fn len(&self) -> u64 {
        self.descriptor.count
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.count == 0
    }

    fn node(&self, mac: &Mac) -> Result<Arc<Node<K, V, Mac>>> {
        if let Some(node) = self.cache.lock().unwrap().get(mac) {
            return Ok(node.clone());
        }
        counters::bump(counters::Op::BtreeNodeRead);
        let bytes = (self.fetch)(mac)?;
        let node: Node<K, V, Mac> = rmp_serde::from_slice(&bytes)
            .map_err(|e| Error::Corrupt(format!("tree node {mac} decoding: {e}")))?;
        let node = Arc::new(node);
        self.cache.lock().unwrap().insert(*mac, node.clone());
        Ok(node)
    }

    pub fn find(&self, key: &K) -> Result<Option<V>> {
        let mut ptr = self.descriptor.root;
        loop {
            let node = self.node(&ptr)?;
            let i = lower_bound(&node.keys, key, self.cmp);
            if i < node.keys.len() && (self.cmp)(&node.keys[i], key) == Ordering::Equal {
                return Ok(Some(node.values[i].clone()));
            }
            if node.is_leaf() {
                return Ok(None);
            }
            ptr = node.children[i];
        }
    }

    /// Forward iterator over all pairs with key >= `start`, yielded owned.
    pub fn scan_from(&self, start: &K) -> Result<LazyScanIter<'_, K, V>> {
        let mut stack = Vec::new();
        let mut ptr = self.descriptor.root;
        loop {
            let node = self.node(&ptr)?;
            let i = lower_bound(&node.keys, start, self.cmp);
            let leaf = node.is_leaf();
            let next = if leaf { None } else { Some(node.children[i]) };
            if i < node.keys.len() {
                stack.push((node, i));
            }
            match next {
                None => break,
                Some(child) => ptr = child,
            }
        }
        Ok(LazyScanIter { tree: self, stack })
    }

    pub fn iter(&self) -> Result<LazyScanIter<'_, K, V>> {
        let mut iter = LazyScanIter {
            tree: self,
            stack: Vec::new(),
        };
        iter.push_leftmost(self.descriptor.root)?;
        Ok(iter)
    }

    /// Visit every persisted node exactly once, pre-order.
    /// Traversals that copy or enumerate whole trees (sync, maintenance)
    /// go through here rather than iterating pairs.
    pub fn iter_dfs(&self) -> LazyDfsIter<'_, K, V> {
        LazyDfsIter {
            tree: self,
            stack: vec![self.descriptor.root],
        }
    }
}

pub struct LazyScanIter<'t, K, V> {
    tree: &'t LazyTree<K, V>,
    stack: Vec<(Arc<Node<K, V, Mac>>, usize)>,
}

impl<'t, K, V> LazyScanIter<'t, K, V>
where
    K: Clone + serde::de::DeserializeOwned + Send + Sync + 'static,
    V: Clone + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn push_leftmost(&mut self, mut ptr: Mac) -> Result<()> {
        loop {
            let node = self.tree.node(&ptr)?;
            if node.keys.is_empty() {
                return Ok(());
            }
            let next = if node.is_leaf() {
                None
            } else {
                Some(node.children[0])
            };
            self.stack.push((node, 0));
            match next {
                None => return Ok(()),
                Some(child) => ptr = child,
            }
        }
    }
}

impl<'t, K, V> Iterator for LazyScanIter<'t, K, V>
where
    K: Clone + serde::de::DeserializeOwned + Send + Sync + 'static,
    V: Clone + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (node, i) = self.stack.pop()?;
        let item = (node.keys[i].clone(), node.values[i].clone());

        if i + 1 < node.keys.len() {
            self.stack.push((node.clone(), i + 1));
        }
        if !node.is_leaf() {
            if let Err(e) = self.push_leftmost(node.children[i + 1]) {
                return Some(Err(e));
            }
        }
        Some(Ok(item))
    }
}

pub struct LazyDfsIter<'t, K, V> {
    tree: &'t LazyTree<K, V>,
    stack: Vec<Mac>,
}

impl<'t, K, V> Iterator for LazyDfsIter<'t, K, V>
where
    K: Clone + serde::de::DeserializeOwned + Send + Sync + 'static,
    V: Clone + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    type Item = Result<(Mac, Arc<Node<K, V, Mac>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mac = self.stack.pop()?;
        match self.tree.node(&mac) {
            Ok(node) => {
                self.stack.extend(node.children.iter().copied());
                Some(Ok((mac, node)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn build(pairs: &[(&str, u32)], order: usize) -> BTree<String, u32> {
        let mut tree = BTree::with_order(path_order, order);
        for (k, v) in pairs {
            tree.insert(k.to_string(), *v);
        }
        tree
    }

    #[test]
    fn insert_find_replace() {
        let mut tree = BTree::with_order(byte_order::<String>, 4);
        for i in 0..100u32 {
            assert_eq!(tree.insert(format!("key{i:03}"), i), None);
        }
        assert_eq!(tree.len(), 100);
        assert_eq!(tree.find(&"key042".to_string()), Some(&42));
        assert_eq!(tree.find(&"missing".to_string()), None);

        assert_eq!(tree.insert("key042".to_string(), 999), Some(42));
        assert_eq!(tree.len(), 100);
        assert_eq!(tree.find(&"key042".to_string()), Some(&999));
    }

    #[test]
    fn iteration_is_sorted() {
        let mut tree = BTree::with_order(byte_order::<String>, 3);
        // Insert in a scrambled order.
        for i in [7u32, 1, 9, 0, 4, 8, 2, 6, 3, 5] {
            tree.insert(format!("k{i}"), i);
        }
        let keys: Vec<String> = tree.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, (0..10).map(|i| format!("k{i}")).collect::<Vec<_>>());
    }

    #[test]
    fn scan_from_starts_mid_range() {
        let tree = build(
            &[("/a", 1), ("/b", 2), ("/c", 3), ("/d", 4), ("/e", 5)],
            3,
        );
        let from_c: Vec<u32> = tree.scan_from(&"/c".to_string()).map(|(_, v)| *v).collect();
        assert_eq!(from_c, vec![3, 4, 5]);

        // A start key between entries lands on the next one.
        let from_bb: Vec<u32> = tree.scan_from(&"/bb".to_string()).map(|(_, v)| *v).collect();
        assert_eq!(from_bb, vec![3, 4, 5]);

        let past_end: Vec<u32> = tree.scan_from(&"/z".to_string()).map(|(_, v)| *v).collect();
        assert!(past_end.is_empty());
    }

    #[test]
    fn path_order_groups_directories() {
        let mut tree = BTree::new(path_order);
        for path in [
            "/",
            "/etc",
            "/etc/ssh",
            "/etc/ssh/sshd_config",
            "/etc/passwd",
            "/usr",
            "/usr/bin",
            "/usr/bin/env",
        ] {
            tree.insert(path.to_string(), ());
        }
        // Scanning from "/etc/" yields exactly /etc's children before
        // anything at a deeper-but-unrelated path.
        let under: Vec<String> = tree
            .scan_from(&"/etc/".to_string())
            .map(|(k, _)| k.clone())
            .take_while(|k| k.starts_with("/etc/"))
            .collect();
        assert_eq!(under, vec!["/etc/passwd", "/etc/ssh", "/etc/ssh/sshd_config"]);
    }

    #[test]
    fn empty_tree_iterates_nothing() {
        let tree: BTree<String, u32> = BTree::new(byte_order);
        assert!(tree.is_empty());
        assert_eq!(tree.iter().count(), 0);
        assert_eq!(tree.scan_from(&"anything".to_string()).count(), 0);
    }

    fn persist_to_map(
        tree: &BTree<String, u32>,
    ) -> Result<(TreeDescriptor, HashMap<Mac, Vec<u8>>)> {
        let store = StdMutex::new(HashMap::new());
        let mut next = 0u8;
        let descriptor = tree.persist(&mut |node| {
            let bytes = rmp_serde::to_vec(node).unwrap();
            // A fake content address is fine for the test store.
            next += 1;
            let mac = Mac::from_bytes([next; 32]);
            store.lock().unwrap().insert(mac, bytes);
            Ok(mac)
        })?;
        Ok((descriptor, store.into_inner().unwrap()))
    }

    #[test]
    fn persist_and_lazy_read() -> Result<()> {
        let mut tree = BTree::with_order(byte_order::<String>, 4);
        for i in 0..200u32 {
            tree.insert(format!("key{i:03}"), i);
        }
        let (descriptor, store) = persist_to_map(&tree)?;
        assert_eq!(descriptor.count, 200);

        let lazy: LazyTree<String, u32> = LazyTree::open(descriptor, byte_order, move |mac| {
            store
                .get(mac)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("node {mac}")))
        });

        assert_eq!(lazy.find(&"key123".to_string())?, Some(123));
        assert_eq!(lazy.find(&"nope".to_string())?, None);

        let all: Vec<u32> = lazy.iter()?.map(|r| r.unwrap().1).collect();
        assert_eq!(all, (0..200).collect::<Vec<_>>());

        let tail: Vec<u32> = lazy
            .scan_from(&"key195".to_string())?
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(tail, vec![195, 196, 197, 198, 199]);
        Ok(())
    }

    #[test]
    fn dfs_visits_every_node_once() -> Result<()> {
        let mut tree = BTree::with_order(byte_order::<String>, 3);
        for i in 0..50u32 {
            tree.insert(format!("{i:02}"), i);
        }
        let (descriptor, store) = persist_to_map(&tree)?;
        let node_count = store.len();

        let lazy: LazyTree<String, u32> = LazyTree::open(descriptor, byte_order, move |mac| {
            store
                .get(mac)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("node {mac}")))
        });
        let visited: Vec<Mac> = lazy
            .iter_dfs()
            .map(|r| r.map(|(mac, _)| mac))
            .collect::<Result<_>>()?;
        assert_eq!(visited.len(), node_count);
        let mut deduped = visited.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), visited.len());
        Ok(())
    }
}
