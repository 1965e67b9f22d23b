//! Immutable file B-tree.
//!
//! An fbtree is a B-tree whose nodes are immutable, prefix-compressed byte
//! blobs in the [`Store`]. Leaves map keys to data offsets but hold only each
//! key's *known prefix*; full keys are recovered from the data through the
//! injected [`KeyExtractor`].
//!
//! ## Updates
//!
//! A tree is frozen unless obtained through [`Fbtree::update`]. Updates never
//! touch persisted nodes: changed nodes are held in memory behind the
//! [`Redirs`] table, keyed by the offset their parent already refers to.
//! [`Fbtree::save`] writes those nodes out bottom-up in one of two ways:
//!
//! - **keep** writes each in-memory node and leaves a redirect from its old
//!   offset to the new one. Only modified subtrees are visited and only
//!   parents that were already in memory are rewritten.
//! - **flatten** also rewrites every parent of a redirected node, so the
//!   table can be dropped entirely.
//!
//! Keep is used until the table reaches [`TreeConfig::redir_max`] entries.
//!
//! ## Structure
//!
//! - `node.rs`: node encoding, search, insert, split
//! - `redirs.rs`: redirection table and its persisted form
//! - `cursor.rs`: ordered iteration
//! - `builder.rs`: bottom-up bulk loading

mod builder;
mod cursor;
mod node;
mod redirs;

use std::{fmt, sync::Arc};

pub use builder::FbtreeBuilder;
pub use cursor::FbtreeIter;
pub use node::{FNode, FNodeBuilder, NodeEntry, OFFSET_LEN, common_prefix_len, distinguish};
use node::{read_node, write_node};
pub use redirs::{Redir, Redirs};
use tracing::trace;

use crate::{
    error::{Error, Result},
    store::{Offset, Store},
};

/// Default node size limit in bytes.
pub const DEFAULT_MAX_NODE_SIZE: usize = 1536;

/// Default redirect count at which saving switches from keep to flatten.
pub const DEFAULT_REDIR_MAX: usize = 100;

/// Which fields of a record make up an index key.
///
/// Opaque to the tree; only the [`KeyExtractor`] interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IxSpec {
    /// Primary key fields.
    pub fields: Vec<i16>,
    /// Secondary fields, appended only when the primary fields are all empty.
    pub fields2: Vec<i16>,
}

/// Recovers the index key of the record stored at a data offset.
///
/// Must be deterministic and agree with the [`IxSpec`] the tree was built
/// with.
pub trait KeyExtractor: fmt::Debug + Send + Sync {
    /// Returns the key of the record at `off`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    fn leaf_key(&self, store: &Store, ixspec: &IxSpec, off: Offset) -> Result<Vec<u8>>;
}

/// Uses the whole record, as written by [`Store::save_sized`], as its key.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordKey;

impl KeyExtractor for RecordKey {
    fn leaf_key(&self, store: &Store, _ixspec: &IxSpec, off: Offset) -> Result<Vec<u8>> {
        store.read_sized(off)
    }
}

/// Tuning parameters shared by every tree of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder)]
pub struct TreeConfig {
    /// Nodes larger than this many bytes are split.
    #[builder(default = DEFAULT_MAX_NODE_SIZE)]
    pub max_node_size: usize,
    /// Redirect count at which [`Fbtree::save`] flattens instead of keeping.
    #[builder(default = DEFAULT_REDIR_MAX)]
    pub redir_max: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self { max_node_size: DEFAULT_MAX_NODE_SIZE, redir_max: DEFAULT_REDIR_MAX }
    }
}

impl TreeConfig {
    /// Checks that the limits are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a node size outside 16..=65535 or a
    /// redirect limit outside 1..=5000.
    pub fn validate(&self) -> Result<()> {
        if !(16..=65535).contains(&self.max_node_size) {
            return Err(Error::Config {
                message: format!("max_node_size must be in 16..=65535, got {}", self.max_node_size),
            });
        }
        // 5000 redirects of 10 bytes keeps the persisted table under 64 KiB.
        if !(1..=5000).contains(&self.redir_max) {
            return Err(Error::Config {
                message: format!("redir_max must be in 1..=5000, got {}", self.redir_max),
            });
        }
        Ok(())
    }
}

/// Everything a tree needs besides its own root.
#[derive(Debug, Clone)]
pub struct TreeContext {
    /// Store holding nodes and records.
    pub store: Arc<Store>,
    /// Key extraction for leaf entries.
    pub keys: Arc<dyn KeyExtractor>,
    /// Size limits.
    pub config: TreeConfig,
}

impl TreeContext {
    /// Bundles a store, key extractor and configuration.
    pub fn new(store: Arc<Store>, keys: Arc<dyn KeyExtractor>, config: TreeConfig) -> Self {
        Self { store, keys, config }
    }
}

/// How [`Fbtree::save_with`] persists in-memory nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveStrategy {
    /// Keep below the redirect limit, flatten at or above it.
    #[default]
    Auto,
    /// Write in-memory nodes and retain redirects.
    Keep,
    /// Write in-memory nodes and resolve every redirect.
    Flatten,
}

/// Totals gathered by [`Fbtree::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckStats {
    /// Leaf entries.
    pub count: usize,
    /// Nodes visited.
    pub nodes: usize,
    /// Encoded bytes of all nodes.
    pub size: usize,
}

/// An immutable, redirect-aware B-tree stored in a [`Store`].
#[derive(Clone)]
pub struct Fbtree {
    /// Number of tree levels above the leaves; 0 means the root is a leaf.
    tree_levels: usize,
    root: Offset,
    ctx: TreeContext,
    ixspec: IxSpec,
    redirs: Redirs,
    /// Where `redirs` was last saved, 0 if nowhere.
    redirs_off: Offset,
    mutable: bool,
    /// True while some redirect holds an unsaved node.
    dirty: bool,
}

impl fmt::Debug for Fbtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fbtree")
            .field("root", &self.root)
            .field("tree_levels", &self.tree_levels)
            .field("redirs", &self.redirs.len())
            .field("redirs_off", &self.redirs_off)
            .field("mutable", &self.mutable)
            .field("dirty", &self.dirty)
            .finish()
    }
}

fn corrupt(reason: impl Into<String>) -> Error {
    Error::Corrupted { reason: reason.into() }
}

impl Fbtree {
    /// Creates an empty tree whose single leaf exists only in memory.
    pub fn create(ctx: TreeContext, ixspec: IxSpec) -> Self {
        let mut redirs = Redirs::new().mutable();
        let root = redirs.add(FNode::new());
        redirs.freeze();
        Self {
            tree_levels: 0,
            root,
            ctx,
            ixspec,
            redirs,
            redirs_off: 0,
            mutable: false,
            dirty: true,
        }
    }

    /// Opens a persisted tree.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the saved redirects cannot be loaded.
    pub fn open(
        ctx: TreeContext,
        ixspec: IxSpec,
        root: Offset,
        tree_levels: usize,
        redirs_off: Offset,
    ) -> Result<Self> {
        let redirs = Redirs::load(&ctx.store, redirs_off)?;
        Ok(Self {
            tree_levels,
            root,
            ctx,
            ixspec,
            redirs,
            redirs_off,
            mutable: false,
            dirty: false,
        })
    }

    /// Root node offset.
    pub fn root(&self) -> Offset {
        self.root
    }

    /// Number of tree levels above the leaves.
    pub fn tree_levels(&self) -> usize {
        self.tree_levels
    }

    /// Offset of the saved redirects, 0 if there are none.
    pub fn redirs_off(&self) -> Offset {
        self.redirs_off
    }

    /// Number of redirects currently held.
    pub fn redir_count(&self) -> usize {
        self.redirs.len()
    }

    /// Returns true if the tree has nodes that have not been saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns true inside [`update`](Self::update).
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// The key projection.
    pub fn ixspec(&self) -> &IxSpec {
        &self.ixspec
    }

    /// Shared context.
    pub fn context(&self) -> &TreeContext {
        &self.ctx
    }

    pub(crate) fn set_ixspec(&mut self, ixspec: IxSpec) {
        self.ixspec = ixspec;
    }

    /// Full key of the record at `off`.
    ///
    /// # Errors
    ///
    /// Propagates key extractor errors.
    pub fn leaf_key(&self, off: Offset) -> Result<Vec<u8>> {
        self.ctx.keys.leaf_key(&self.ctx.store, &self.ixspec, off)
    }

    /// Resolves redirects and loads a node.
    ///
    /// # Panics
    ///
    /// Panics if `off` is an unresolved fake offset.
    fn get_node(&self, off: Offset) -> Result<Arc<FNode>> {
        let off = match self.redirs.get(off) {
            Some(Redir { mnode: Some(node), .. }) => return Ok(Arc::clone(node)),
            Some(r) => r.new_offset,
            None => off,
        };
        assert!(!self.redirs.is_fake(off), "fake offset {off} has no node");
        read_node(&self.ctx.store, off)
    }

    /// Finds the data offset stored under exactly `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a node or the candidate record cannot be read.
    pub fn search(&self, key: &[u8]) -> Result<Option<Offset>> {
        let mut off = self.root;
        for _ in 0..self.tree_levels {
            match self.get_node(off)?.search(key) {
                Some((_, child)) => off = child,
                None => return Err(corrupt(format!("empty tree node at {off}"))),
            }
        }
        let Some((_, data)) = self.get_node(off)?.search(key) else {
            return Ok(None);
        };
        Ok((self.leaf_key(data)? == key).then_some(data))
    }

    /// Iterates over `(known prefix, data offset)` in key order.
    ///
    /// Only the known prefix is returned; use [`leaf_key`](Self::leaf_key)
    /// for the full key.
    pub fn iter(&self) -> FbtreeIter<'_> {
        FbtreeIter::new(self)
    }

    /// Runs `f` on a mutable copy and returns it frozen.
    ///
    /// # Errors
    ///
    /// Propagates errors from `f`.
    pub fn update(&self, f: impl FnOnce(&mut Fbtree) -> Result<()>) -> Result<Fbtree> {
        let mut t = self.clone();
        t.redirs = t.redirs.mutable();
        t.mutable = true;
        f(&mut t)?;
        t.redirs.freeze();
        t.mutable = false;
        Ok(t)
    }

    /// Adds or replaces the entry for `key`.
    ///
    /// # Panics
    ///
    /// Panics outside [`update`](Self::update).
    ///
    /// # Errors
    ///
    /// Returns an error if a node or record along the way cannot be read.
    pub fn insert(&mut self, key: &[u8], off: Offset) -> Result<()> {
        assert!(self.mutable, "can't modify a frozen fbtree");
        let mut path = Vec::with_capacity(self.tree_levels);
        let mut node_off = self.root;
        for _ in 0..self.tree_levels {
            let node = self.get_node(node_off)?;
            let Some((i, child)) = node.search(key) else {
                return Err(corrupt(format!("empty tree node at {node_off}")));
            };
            path.push((node_off, node, i));
            node_off = child;
        }
        let leaf = self.get_node(node_off)?;
        let mut node = leaf.insert(key, off, |o| self.leaf_key(o))?;
        self.mark_paths(&path);
        self.dirty = true;

        let max = self.ctx.config.max_node_size;
        loop {
            if node.size() <= max || node.count() < 2 {
                self.redirs.set_mnode(node_off, node);
                return Ok(());
            }
            let (left, right, split_key) = node.split();
            self.redirs.set_mnode(node_off, left);
            let right_off = self.redirs.add(right);
            match path.pop() {
                Some((parent_off, parent, i)) => {
                    node = parent.insert_child(i + 1, &split_key, right_off);
                    node_off = parent_off;
                },
                None => {
                    let root =
                        FNode::from_entries([(&[][..], node_off), (&split_key[..], right_off)]);
                    self.root = self.redirs.add(root);
                    self.tree_levels += 1;
                    return Ok(());
                },
            }
        }
    }

    /// Removes the entry for `key`, returning true if it was present.
    ///
    /// Nodes are not merged; a leaf may become empty.
    ///
    /// # Panics
    ///
    /// Panics outside [`update`](Self::update).
    ///
    /// # Errors
    ///
    /// Returns an error if a node or record along the way cannot be read.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        assert!(self.mutable, "can't modify a frozen fbtree");
        let mut path = Vec::with_capacity(self.tree_levels);
        let mut node_off = self.root;
        for _ in 0..self.tree_levels {
            let node = self.get_node(node_off)?;
            let Some((i, child)) = node.search(key) else {
                return Err(corrupt(format!("empty tree node at {node_off}")));
            };
            path.push((node_off, node, i));
            node_off = child;
        }
        let leaf = self.get_node(node_off)?;
        let Some((_, data)) = leaf.search(key) else {
            return Ok(false);
        };
        if self.leaf_key(data)? != key {
            return Ok(false);
        }
        let Some(node) = leaf.delete(data, |o| self.leaf_key(o))? else {
            return Ok(false);
        };
        self.mark_paths(&path);
        self.redirs.set_mnode(node_off, node);
        self.dirty = true;
        Ok(true)
    }

    fn mark_paths(&mut self, path: &[(Offset, Arc<FNode>, usize)]) {
        for &(off, _, _) in path {
            if !self.redirs.is_fake(off) {
                self.redirs.paths.put(off);
            }
        }
    }

    /// Persists in-memory nodes, choosing keep or flatten by redirect count.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read or written.
    pub fn save(&self) -> Result<Fbtree> {
        self.save_with(SaveStrategy::Auto)
    }

    /// Persists in-memory nodes with an explicit strategy.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read or written.
    pub fn save_with(&self, strategy: SaveStrategy) -> Result<Fbtree> {
        let flatten = match strategy {
            SaveStrategy::Auto => self.redirs.len() >= self.ctx.config.redir_max,
            SaveStrategy::Keep => false,
            SaveStrategy::Flatten => true,
        };
        if !self.dirty && (!flatten || self.redirs.is_empty()) {
            return Ok(self.clone());
        }
        trace!(root = self.root, redirs = self.redirs.len(), flatten, "Saving fbtree");
        self.update(|t| {
            if flatten {
                t.flatten()?;
            } else {
                t.keep()?;
            }
            t.dirty = false;
            Ok(())
        })
    }

    fn keep(&mut self) -> Result<()> {
        let old = self.root;
        self.root = self.keep_node(0, old)?;
        if self.root != old {
            self.redirs.tbl.delete(&old);
        }
        if !self.redirs.fits() {
            tracing::debug!(
                redirs = self.redirs.len(),
                paths = self.redirs.paths.len(),
                "Redirects exceed one block, flattening"
            );
            return self.flatten();
        }
        self.redirs_off =
            if self.redirs.is_empty() { 0 } else { self.redirs.save(&self.ctx.store)? };
        Ok(())
    }

    /// Writes the in-memory nodes below `node_off`, returning its new offset.
    fn keep_node(&mut self, depth: usize, node_off: Offset) -> Result<Offset> {
        let redir = self.redirs.get(node_off).cloned();
        let mut in_paths = false;
        let node = if depth < self.tree_levels {
            let mnode = redir.and_then(|r| r.mnode);
            in_paths = self.redirs.in_paths(node_off);
            if mnode.is_none() && !in_paths {
                return Ok(node_off);
            }
            let node = self.get_node(node_off)?;
            let mut copy: Option<FNode> = None;
            for e in node.iter() {
                let off2 = self.keep_node(depth + 1, e.offset)?;
                // An in-memory parent can point straight at the new child.
                if off2 != e.offset && mnode.is_some() {
                    copy.get_or_insert_with(|| (*node).clone()).set_offset(e.offset_pos, off2);
                    self.redirs.tbl.delete(&e.offset);
                }
            }
            match (copy, mnode) {
                (Some(copy), _) => Arc::new(copy),
                (None, Some(mnode)) => mnode,
                (None, None) => return Ok(node_off),
            }
        } else {
            match redir {
                None => return Ok(node_off),
                Some(Redir { mnode: None, new_offset, .. }) => return Ok(new_offset),
                Some(Redir { mnode: Some(mnode), .. }) => mnode,
            }
        };
        let new_offset = write_node(&self.ctx.store, &node)?;
        self.redirs.tbl.put(Redir { offset: node_off, mnode: None, new_offset });
        if in_paths {
            self.redirs.paths.delete(&node_off);
            self.redirs.paths.put(new_offset);
        }
        Ok(new_offset)
    }

    fn flatten(&mut self) -> Result<()> {
        self.root = self.flatten_node(0, self.root)?;
        self.redirs = Redirs::new().mutable();
        self.redirs_off = 0;
        Ok(())
    }

    /// Rewrites every node below `node_off` that is redirected or leads to
    /// a redirected node.
    fn flatten_node(&mut self, depth: usize, node_off: Offset) -> Result<Offset> {
        let node = if depth < self.tree_levels {
            let ro = self.get_node(node_off)?;
            let mut rw: Option<FNode> = None;
            for e in ro.iter() {
                if !self.should_process(e.offset) {
                    continue;
                }
                let off2 = self.flatten_node(depth + 1, e.offset)?;
                if off2 != e.offset {
                    rw.get_or_insert_with(|| (*ro).clone()).set_offset(e.offset_pos, off2);
                }
            }
            match rw {
                Some(rw) => Arc::new(rw),
                None => match self.redirs.get(node_off) {
                    Some(Redir { mnode: Some(mnode), .. }) => Arc::clone(mnode),
                    Some(r) => return Ok(r.new_offset),
                    None => return Ok(node_off),
                },
            }
        } else {
            match self.redirs.get(node_off) {
                None => return Ok(node_off),
                Some(Redir { mnode: None, new_offset, .. }) => return Ok(*new_offset),
                Some(Redir { mnode: Some(mnode), .. }) => Arc::clone(mnode),
            }
        };
        write_node(&self.ctx.store, &node)
    }

    fn should_process(&self, off: Offset) -> bool {
        self.redirs.is_fake(off) || self.redirs.get(off).is_some() || self.redirs.in_paths(off)
    }

    /// Verifies the whole tree, calling `f` with every data offset.
    ///
    /// Checks node checksums, that keys never decrease, and that every
    /// leaf's known prefix is a prefix of the record's actual key.
    ///
    /// # Errors
    ///
    /// Returns a corruption error describing the first violation found.
    pub fn check(&self, mut f: impl FnMut(Offset)) -> Result<CheckStats> {
        let mut stats = CheckStats::default();
        let mut prev = Vec::new();
        self.check_node(0, self.root, &mut prev, &mut f, &mut stats)?;
        Ok(stats)
    }

    fn check_node(
        &self,
        depth: usize,
        off: Offset,
        prev: &mut Vec<u8>,
        f: &mut impl FnMut(Offset),
        stats: &mut CheckStats,
    ) -> Result<()> {
        let node = self.get_node(off)?;
        stats.nodes += 1;
        stats.size += node.size();
        for (i, e) in node.iter().enumerate() {
            if depth < self.tree_levels {
                if i > 0 && prev.as_slice() > e.known.as_slice() {
                    return Err(corrupt(format!("keys out of order in tree node {off}")));
                }
                *prev = e.known;
                self.check_node(depth + 1, e.offset, prev, f, stats)?;
            } else {
                stats.count += 1;
                f(e.offset);
                let key = self.leaf_key(e.offset)?;
                if !key.starts_with(&e.known) {
                    return Err(corrupt(format!(
                        "index key does not match data at {} in leaf {off}",
                        e.offset
                    )));
                }
                if prev.as_slice() > key.as_slice() {
                    return Err(corrupt(format!("keys out of order in leaf {off}")));
                }
                *prev = key;
            }
        }
        Ok(())
    }

    pub(crate) fn from_parts(
        ctx: TreeContext,
        ixspec: IxSpec,
        root: Offset,
        tree_levels: usize,
    ) -> Self {
        Self {
            tree_levels,
            root,
            ctx,
            ixspec,
            redirs: Redirs::new(),
            redirs_off: 0,
            mutable: false,
            dirty: false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;

    pub(crate) fn context(max_node_size: usize) -> TreeContext {
        let config = TreeConfig::builder().max_node_size(max_node_size).build();
        TreeContext::new(Arc::new(Store::in_memory()), Arc::new(RecordKey), config)
    }

    fn put(tree: &mut Fbtree, key: &[u8]) -> Offset {
        let off = tree.ctx.store.save_sized(key).unwrap();
        tree.insert(key, off).unwrap();
        off
    }

    fn keys_in_order(tree: &Fbtree) -> Vec<Vec<u8>> {
        tree.iter().map(|r| tree.leaf_key(r.unwrap().1).unwrap()).collect()
    }

    #[test]
    fn test_empty_tree() {
        let tree = Fbtree::create(context(1536), IxSpec::default());
        assert!(tree.search(b"x").unwrap().is_none());
        assert_eq!(tree.iter().count(), 0);
        assert!(tree.is_dirty());
        let saved = tree.save().unwrap();
        assert!(!saved.is_dirty());
        assert_eq!(saved.redir_count(), 0);
        assert_eq!(saved.check(|_| {}).unwrap().count, 0);
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn test_insert_on_frozen_panics() {
        let mut tree = Fbtree::create(context(1536), IxSpec::default());
        let _ = tree.insert(b"a", 100);
    }

    #[test]
    fn test_split_example() {
        let tree = Fbtree::create(context(40), IxSpec::default());
        let tree = tree
            .update(|t| {
                for k in ["1234xxxx", "1235xxxx", "1299xxxx", "1300xxxx", "1305xxxx"] {
                    put(t, k.as_bytes());
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(tree.tree_levels(), 1);
        let root = tree.get_node(tree.root()).unwrap();
        let entries = root.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"");
        assert_eq!(entries[1].0, b"13");

        let prefixes = |off| -> Vec<Vec<u8>> {
            tree.get_node(off)
                .unwrap()
                .iter()
                .map(|e| tree.leaf_key(e.offset).unwrap()[..4].to_vec())
                .collect()
        };
        assert_eq!(
            prefixes(entries[0].1),
            vec![b"1234".to_vec(), b"1235".to_vec(), b"1299".to_vec()]
        );
        assert_eq!(prefixes(entries[1].1), vec![b"1300".to_vec(), b"1305".to_vec()]);
        assert_eq!(tree.check(|_| {}).unwrap().count, 5);
    }

    #[test]
    fn test_insert_search_iter_across_levels() {
        let tree = Fbtree::create(context(64), IxSpec::default());
        let mut expected = BTreeMap::new();
        let tree = tree
            .update(|t| {
                // Interleave so inserts land all over the tree.
                for i in (0..500u32).map(|i| (i * 7919) % 500) {
                    let key = format!("key{i:05}");
                    let off = put(t, key.as_bytes());
                    expected.insert(key.into_bytes(), off);
                }
                Ok(())
            })
            .unwrap();
        assert!(tree.tree_levels() >= 2);
        for (k, off) in &expected {
            assert_eq!(tree.search(k).unwrap(), Some(*off));
        }
        assert!(tree.search(b"key").unwrap().is_none());
        assert!(tree.search(b"key00010x").unwrap().is_none());
        assert_eq!(keys_in_order(&tree), expected.keys().cloned().collect::<Vec<_>>());
        let stats = tree.check(|_| {}).unwrap();
        assert_eq!(stats.count, 500);
    }

    #[test]
    fn test_insert_replaces_existing_key() {
        let tree = Fbtree::create(context(1536), IxSpec::default());
        let tree = tree
            .update(|t| {
                put(t, b"same");
                put(t, b"same");
                Ok(())
            })
            .unwrap();
        assert_eq!(tree.iter().count(), 1);
    }

    #[test]
    fn test_save_reopen_round_trip() {
        let ctx = context(80);
        let tree = Fbtree::create(ctx.clone(), IxSpec::default());
        let mut offs = Vec::new();
        let tree = tree
            .update(|t| {
                for i in 0..300u32 {
                    offs.push(put(t, format!("{i:04}").as_bytes()));
                }
                Ok(())
            })
            .unwrap();
        let saved = tree.save().unwrap();
        assert!(!saved.is_dirty());

        let reopened = Fbtree::open(
            ctx,
            IxSpec::default(),
            saved.root(),
            saved.tree_levels(),
            saved.redirs_off(),
        )
        .unwrap();
        for (i, off) in offs.iter().enumerate() {
            assert_eq!(reopened.search(format!("{i:04}").as_bytes()).unwrap(), Some(*off));
        }
        assert_eq!(reopened.check(|_| {}).unwrap().count, 300);
    }

    #[test]
    fn test_keep_retains_redirects_for_unchanged_parents() {
        let ctx = context(64);
        let base = Fbtree::create(ctx.clone(), IxSpec::default())
            .update(|t| {
                for i in 0..200u32 {
                    put(t, format!("{i:04}").as_bytes());
                }
                Ok(())
            })
            .unwrap()
            .save_with(SaveStrategy::Flatten)
            .unwrap();
        assert_eq!(base.redir_count(), 0);
        assert_eq!(base.redirs_off(), 0);

        // A single insert that doesn't split only replaces its leaf.
        let tree = base
            .update(|t| {
                put(t, b"0100a");
                Ok(())
            })
            .unwrap();
        let kept = tree.save_with(SaveStrategy::Keep).unwrap();
        assert_eq!(kept.root(), base.root());
        assert_eq!(kept.redir_count(), 1);
        assert_ne!(kept.redirs_off(), 0);

        let reopened =
            Fbtree::open(ctx, IxSpec::default(), kept.root(), kept.tree_levels(), kept.redirs_off())
                .unwrap();
        assert!(reopened.search(b"0100a").unwrap().is_some());

        let flat = reopened.save_with(SaveStrategy::Flatten).unwrap();
        assert_eq!(flat.redir_count(), 0);
        assert_ne!(flat.root(), base.root());
        assert!(flat.search(b"0100a").unwrap().is_some());
        assert_eq!(flat.check(|_| {}).unwrap().count, 201);
    }

    #[test]
    fn test_auto_flattens_at_redir_max() {
        let config = TreeConfig::builder().max_node_size(64).redir_max(3).build();
        let ctx = TreeContext::new(Arc::new(Store::in_memory()), Arc::new(RecordKey), config);
        let mut tree = Fbtree::create(ctx, IxSpec::default())
            .update(|t| {
                for i in 0..100u32 {
                    put(t, format!("{i:04}").as_bytes());
                }
                Ok(())
            })
            .unwrap()
            .save_with(SaveStrategy::Flatten)
            .unwrap();
        for i in 0..10u32 {
            tree = tree
                .update(|t| {
                    put(t, format!("{:04}x", i * 10).as_bytes());
                    Ok(())
                })
                .unwrap()
                .save()
                .unwrap();
            assert!(tree.redir_count() < 3 + 1);
        }
        assert_eq!(tree.check(|_| {}).unwrap().count, 110);
    }

    #[test]
    fn test_keep_flattens_when_redirects_overflow() {
        let config = TreeConfig::builder().max_node_size(64).redir_max(5000).build();
        let ctx = TreeContext::new(Arc::new(Store::in_memory()), Arc::new(RecordKey), config);
        let mut builder = FbtreeBuilder::new(ctx.clone(), IxSpec::default());
        for i in 0..50_000u32 {
            let key = format!("{i:06}");
            let off = ctx.store.save_sized(key.as_bytes()).unwrap();
            builder.add(key.as_bytes(), off).unwrap();
        }
        let base = builder.finish().unwrap();

        // Touch nearly every leaf, far more than one redirect block can hold.
        let tree = base
            .update(|t| {
                for i in (0..50_000u32).step_by(4) {
                    put(t, format!("{i:06}a").as_bytes());
                }
                Ok(())
            })
            .unwrap();
        assert!(tree.redir_count() > 6_600);
        let kept = tree.save_with(SaveStrategy::Keep).unwrap();
        assert_eq!(kept.redir_count(), 0);
        assert_eq!(kept.redirs_off(), 0);

        let reopened =
            Fbtree::open(ctx, IxSpec::default(), kept.root(), kept.tree_levels(), 0).unwrap();
        assert!(reopened.search(b"012344a").unwrap().is_some());
        assert_eq!(reopened.check(|_| {}).unwrap().count, 62_500);
    }

    #[test]
    fn test_delete() {
        let tree = Fbtree::create(context(64), IxSpec::default())
            .update(|t| {
                for i in 0..100u32 {
                    put(t, format!("{i:03}").as_bytes());
                }
                Ok(())
            })
            .unwrap()
            .save()
            .unwrap();
        let tree = tree
            .update(|t| {
                for i in (0..100u32).step_by(2) {
                    assert!(t.delete(format!("{i:03}").as_bytes())?);
                }
                assert!(!t.delete(b"000")?);
                assert!(!t.delete(b"zzz")?);
                Ok(())
            })
            .unwrap();
        for i in 0..100u32 {
            let found = tree.search(format!("{i:03}").as_bytes()).unwrap().is_some();
            assert_eq!(found, i % 2 == 1);
        }
        let saved = tree.save().unwrap();
        assert_eq!(saved.check(|_| {}).unwrap().count, 50);
    }

    #[test]
    fn test_check_detects_corrupt_node() {
        let tree = Fbtree::create(context(1536), IxSpec::default())
            .update(|t| {
                put(t, b"alpha");
                put(t, b"beta");
                Ok(())
            })
            .unwrap()
            .save()
            .unwrap();
        tree.ctx.store.write(tree.root() + 5, &[0xee]).unwrap();
        let err = tree.check(|_| {}).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_check_detects_corrupt_size_prefix() {
        let tree = Fbtree::create(context(1536), IxSpec::default())
            .update(|t| {
                put(t, b"alpha");
                put(t, b"beta");
                Ok(())
            })
            .unwrap()
            .save()
            .unwrap();
        tree.ctx.store.write(tree.root(), &[0xff; 4]).unwrap();
        let err = tree.check(|_| {}).unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn test_check_detects_mismatched_key() {
        let ctx = context(1536);
        let a = ctx.store.save_sized(b"apple").unwrap();
        let b = ctx.store.save_sized(b"banana").unwrap();
        // Entry for "banana" claims a known prefix of "c".
        let leaf = FNode::from_entries([(&b""[..], a), (&b"c"[..], b)]);
        let root = write_node(&ctx.store, &leaf).unwrap();
        let tree = Fbtree::open(ctx, IxSpec::default(), root, 0, 0).unwrap();
        let err = tree.check(|_| {}).unwrap_err();
        assert!(err.to_string().contains("index key does not match data"));
    }

    #[test]
    fn test_config_validate() {
        assert!(TreeConfig::default().validate().is_ok());
        assert!(TreeConfig::builder().max_node_size(8).build().validate().is_err());
        assert!(TreeConfig::builder().redir_max(0).build().validate().is_err());
        assert!(TreeConfig::builder().redir_max(5001).build().validate().is_err());
    }

    mod proptest_fbtree {
        use fbdb_test_utils::strategies;
        use proptest::prelude::*;

        use super::*;

        fn build(ctx: &TreeContext, keys: &[Vec<u8>]) -> (Fbtree, BTreeMap<Vec<u8>, Offset>) {
            let mut model = BTreeMap::new();
            let tree = Fbtree::create(ctx.clone(), IxSpec::default())
                .update(|t| {
                    for k in keys {
                        model.insert(k.clone(), put(t, k));
                    }
                    Ok(())
                })
                .unwrap();
            (tree, model)
        }

        proptest! {
            /// Iteration is ordered and every inserted key is found.
            #[test]
            fn prop_insert_search_order(
                keys in proptest::collection::vec(strategies::arb_binary_key(), 1..300),
            ) {
                let ctx = context(96);
                let (tree, model) = build(&ctx, &keys);
                for (k, off) in &model {
                    prop_assert_eq!(tree.search(k).unwrap(), Some(*off));
                }
                prop_assert_eq!(keys_in_order(&tree), model.keys().cloned().collect::<Vec<_>>());
                prop_assert_eq!(tree.check(|_| {}).unwrap().count, model.len());
            }

            /// Saving by keep then flatten finds the same keys as flattening
            /// straight away.
            #[test]
            fn prop_keep_flatten_equivalence(
                first in strategies::arb_index_keys(150),
                second in strategies::arb_index_keys(50),
            ) {
                let ctx = context(64);
                let (tree, mut model) = build(&ctx, &first);
                let base = tree.save_with(SaveStrategy::Flatten).unwrap();

                let updated = base
                    .update(|t| {
                        for k in &second {
                            model.insert(k.clone(), put(t, k));
                        }
                        Ok(())
                    })
                    .unwrap();
                let kept = updated.save_with(SaveStrategy::Keep).unwrap();
                let kept_then_flat = kept.save_with(SaveStrategy::Flatten).unwrap();
                let flat = updated.save_with(SaveStrategy::Flatten).unwrap();

                for t in [&kept, &kept_then_flat, &flat] {
                    for (k, off) in &model {
                        prop_assert_eq!(t.search(k).unwrap(), Some(*off));
                    }
                    prop_assert_eq!(keys_in_order(t), model.keys().cloned().collect::<Vec<_>>());
                }
            }
        }
    }
}
