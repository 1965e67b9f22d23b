//! Generational hash array mapped trie.
//!
//! A 32-way trie keyed by a 32-bit hash, five bits per level. Each node keeps
//! two bitmaps: `bm_val` marks slots holding an item directly and `bm_ptr`
//! marks slots holding a child node. When two keys land in the same slot the
//! item is pushed down into a new child keyed by the next five bits. After
//! all 32 bits are used the node below becomes an overflow node that is
//! scanned linearly.
//!
//! # Generations
//!
//! A [`Hamt`] is either mutable or frozen. [`Hamt::mutable`] starts a new
//! generation sharing every node with its source; [`Hamt::put`] copies a node
//! the first time it is touched in a generation and mutates it in place
//! afterwards. Frozen values are never modified, so they can be shared across
//! threads and snapshots freely.

use std::{borrow::Borrow, sync::Arc};

use xxhash_rust::xxh3::xxh3_64;

const BITS_PER_NODE: u32 = 5;
const MASK: u32 = (1 << BITS_PER_NODE) - 1;

/// Keys that can be hashed into a [`Hamt`].
///
/// Owned and borrowed forms of the same key must hash identically.
pub trait HamtKey {
    /// 32-bit hash of the key.
    fn hash32(&self) -> u32;
}

impl HamtKey for str {
    fn hash32(&self) -> u32 {
        xxh3_64(self.as_bytes()) as u32
    }
}

impl HamtKey for String {
    fn hash32(&self) -> u32 {
        self.as_str().hash32()
    }
}

impl HamtKey for u64 {
    fn hash32(&self) -> u32 {
        xxh3_64(&self.to_le_bytes()) as u32
    }
}

/// Values stored in a [`Hamt`], identified by an embedded key.
pub trait HamtItem: Clone {
    /// Key type.
    type Key: HamtKey + Eq;

    /// The item's key.
    fn key(&self) -> &Self::Key;
}

impl HamtItem for u64 {
    type Key = u64;

    fn key(&self) -> &u64 {
        self
    }
}

#[derive(Clone)]
struct Node<T> {
    generation: u32,
    bm_val: u32,
    bm_ptr: u32,
    vals: Vec<T>,
    ptrs: Vec<Arc<Node<T>>>,
}

impl<T> Node<T> {
    fn empty(generation: u32) -> Self {
        Self { generation, bm_val: 0, bm_ptr: 0, vals: Vec::new(), ptrs: Vec::new() }
    }
}

/// Persistent associative map with generational copy-on-write.
#[derive(Clone)]
pub struct Hamt<T> {
    root: Option<Arc<Node<T>>>,
    mutable: bool,
    generation: u32,
    len: usize,
}

impl<T: HamtItem> Default for Hamt<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Hamt<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hamt")
            .field("len", &self.len)
            .field("mutable", &self.mutable)
            .field("generation", &self.generation)
            .finish()
    }
}

fn bit(hash: u32, shift: u32) -> u32 {
    1 << ((hash >> shift) & MASK)
}

fn index(bitmap: u32, bit: u32) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

impl<T: HamtItem> Hamt<T> {
    /// Creates an empty, frozen map.
    pub fn new() -> Self {
        Self { root: None, mutable: false, generation: 0, len: 0 }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the map holds no items.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if [`put`](Self::put) is allowed.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Looks up the item with the given key.
    pub fn get<Q>(&self, key: &Q) -> Option<&T>
    where
        T::Key: Borrow<Q>,
        Q: HamtKey + Eq + ?Sized,
    {
        let mut nd = self.root.as_deref()?;
        let hash = key.hash32();
        let mut shift = 0;
        while shift < 32 {
            let bit = bit(hash, shift);
            if nd.bm_val & bit != 0 {
                let item = &nd.vals[index(nd.bm_val, bit)];
                return (item.key().borrow() == key).then_some(item);
            }
            if nd.bm_ptr & bit == 0 {
                return None;
            }
            nd = &nd.ptrs[index(nd.bm_ptr, bit)];
            shift += BITS_PER_NODE;
        }
        // overflow node
        nd.vals.iter().find(|item| item.key().borrow() == key)
    }

    /// Starts a new mutable generation sharing all nodes with `self`.
    pub fn mutable(&self) -> Self {
        let generation = self.generation + 1;
        let root = match &self.root {
            Some(root) => {
                let mut dup = (**root).clone();
                dup.generation = generation;
                dup
            },
            None => Node::empty(generation),
        };
        Self { root: Some(Arc::new(root)), mutable: true, generation, len: self.len }
    }

    /// Inserts or replaces the item with the same key.
    ///
    /// # Panics
    ///
    /// Panics if the map is frozen.
    pub fn put(&mut self, item: T) {
        assert!(self.mutable, "can't modify a frozen hamt");
        let generation = self.generation;
        let hash = item.key().hash32();
        let root = self.root.get_or_insert_with(|| Arc::new(Node::empty(generation)));
        if Self::with(root, generation, item, hash, 0) {
            self.len += 1;
        }
    }

    /// Returns true if a new key was added, false if an item was replaced.
    fn with(node: &mut Arc<Node<T>>, generation: u32, item: T, hash: u32, shift: u32) -> bool {
        if node.generation != generation {
            let mut dup = (**node).clone();
            dup.generation = generation;
            *node = Arc::new(dup);
        }
        let nd = Arc::make_mut(node);

        if shift >= 32 {
            if let Some(existing) = nd.vals.iter_mut().find(|v| v.key() == item.key()) {
                *existing = item;
                return false;
            }
            nd.vals.push(item);
            return true;
        }

        let bit = bit(hash, shift);
        if nd.bm_ptr & bit != 0 {
            let ip = index(nd.bm_ptr, bit);
            return Self::with(&mut nd.ptrs[ip], generation, item, hash, shift + BITS_PER_NODE);
        }

        let iv = index(nd.bm_val, bit);
        if nd.bm_val & bit == 0 {
            nd.vals.insert(iv, item);
            nd.bm_val |= bit;
            return true;
        }
        if nd.vals[iv].key() == item.key() {
            nd.vals[iv] = item;
            return false;
        }

        // Collision: move the resident item and the new one into a child.
        let old = nd.vals.remove(iv);
        nd.bm_val &= !bit;
        let old_hash = old.key().hash32();
        let mut child = Arc::new(Node::empty(generation));
        let next = shift + BITS_PER_NODE;
        Self::with(&mut child, generation, old, old_hash, next);
        Self::with(&mut child, generation, item, hash, next);
        nd.ptrs.insert(index(nd.bm_ptr, bit), child);
        nd.bm_ptr |= bit;
        true
    }

    /// Removes the item with the given key, returning true if it existed.
    ///
    /// Emptied child nodes are left in place; lookups treat them as misses.
    ///
    /// # Panics
    ///
    /// Panics if the map is frozen.
    pub fn delete<Q>(&mut self, key: &Q) -> bool
    where
        T::Key: Borrow<Q>,
        Q: HamtKey + Eq + ?Sized,
    {
        assert!(self.mutable, "can't modify a frozen hamt");
        if self.get(key).is_none() {
            return false;
        }
        let generation = self.generation;
        if let Some(root) = self.root.as_mut() {
            Self::without(root, generation, key, key.hash32(), 0);
        }
        self.len -= 1;
        true
    }

    fn without<Q>(node: &mut Arc<Node<T>>, generation: u32, key: &Q, hash: u32, shift: u32)
    where
        T::Key: Borrow<Q>,
        Q: HamtKey + Eq + ?Sized,
    {
        if node.generation != generation {
            let mut dup = (**node).clone();
            dup.generation = generation;
            *node = Arc::new(dup);
        }
        let nd = Arc::make_mut(node);

        if shift >= 32 {
            nd.vals.retain(|v| v.key().borrow() != key);
            return;
        }
        let bit = bit(hash, shift);
        if nd.bm_val & bit != 0 {
            nd.vals.remove(index(nd.bm_val, bit));
            nd.bm_val &= !bit;
        } else if nd.bm_ptr & bit != 0 {
            let ip = index(nd.bm_ptr, bit);
            Self::without(&mut nd.ptrs[ip], generation, key, hash, shift + BITS_PER_NODE);
        }
    }

    /// Seals the current generation; the result can be shared read-only.
    pub fn freeze(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Calls `f` on every item, in no particular order.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for item in self.iter() {
            f(item);
        }
    }

    /// Iterates over every item, in no particular order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { stack: self.root.as_deref().into_iter().collect(), vals: Default::default() }
    }
}

/// Iterator over the items of a [`Hamt`].
pub struct Iter<'a, T> {
    stack: Vec<&'a Node<T>>,
    vals: std::slice::Iter<'a, T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            if let Some(v) = self.vals.next() {
                return Some(v);
            }
            let nd = self.stack.pop()?;
            self.stack.extend(nd.ptrs.iter().map(|p| &**p));
            self.vals = nd.vals.iter();
        }
    }
}
