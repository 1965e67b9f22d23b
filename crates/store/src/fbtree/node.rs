//! Prefix-compressed fbtree nodes.
//!
//! A node is a flat byte buffer of entries:
//!
//! ```text
//! [npre:uvarint][dlen:uvarint][diff:dlen][offset:5]
//! ```
//!
//! Each entry's *known* prefix is the first `npre` bytes of the previous
//! entry's known prefix followed by `diff`. The first entry always has an
//! empty known prefix. Offsets are fixed-width so a persisted child offset can
//! be patched in place with [`FNode::set_offset`].
//!
//! # Known Prefixes
//!
//! In a leaf, an entry's known prefix is the shortest prefix of its key that
//! sorts above the previous key. In a tree node it is a separator: every key
//! in the child is at least the separator and below the next separator. In
//! both cases known prefixes strictly increase through the node, so a search
//! takes the last entry whose known prefix is `<=` the search key.
//!
//! Leaf node contents therefore depend on the neighbouring *full* keys, which
//! the node does not store; operations that change leaf entries take a `get`
//! callback resolving a data offset to its key.

use std::{fmt, sync::Arc};

use crate::{
    error::Result,
    store::{
        Offset, Store, cksum,
        codec::{Reader, Writer},
    },
};

/// Width of an encoded offset.
pub const OFFSET_LEN: usize = 5;

/// One decoded node entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// The entry's known prefix.
    pub known: Vec<u8>,
    /// Data offset (leaf) or child node offset (tree).
    pub offset: Offset,
    /// Byte position of the encoded offset within the node.
    pub offset_pos: usize,
}

/// An encoded fbtree node.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FNode {
    data: Vec<u8>,
}

impl fmt::Debug for FNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for e in self.iter() {
            list.entry(&format_args!("{:?}@{}", String::from_utf8_lossy(&e.known), e.offset));
        }
        list.finish()
    }
}

/// Length of the common prefix of `a` and `b`.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Shortest prefix of `key` that sorts above `prev`.
///
/// Requires `prev < key`.
pub fn distinguish(prev: &[u8], key: &[u8]) -> Vec<u8> {
    debug_assert!(prev < key);
    let n = common_prefix_len(prev, key);
    key[..(n + 1).min(key.len())].to_vec()
}

impl FNode {
    /// Creates an empty node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps already-encoded node bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Encodes a sequence of `(known, offset)` entries.
    pub fn from_entries<K: AsRef<[u8]>>(entries: impl IntoIterator<Item = (K, Offset)>) -> Self {
        let mut b = FNodeBuilder::default();
        for (known, off) in entries {
            b.add(known.as_ref(), off);
        }
        b.finish()
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the node has no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of entries.
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    /// Iterates over the entries in order.
    pub fn iter(&self) -> NodeIter<'_> {
        NodeIter { r: Reader::new(&self.data), known: Vec::new() }
    }

    /// Decodes every entry as `(known, offset)`.
    pub fn entries(&self) -> Vec<(Vec<u8>, Offset)> {
        self.iter().map(|e| (e.known, e.offset)).collect()
    }

    /// Finds the last entry whose known prefix is `<= key`.
    ///
    /// Returns the entry index and its offset, or `None` for an empty node.
    pub fn search(&self, key: &[u8]) -> Option<(usize, Offset)> {
        let mut found = None;
        for (i, e) in self.iter().enumerate() {
            if e.known.as_slice() > key {
                break;
            }
            found = Some((i, e.offset));
        }
        found
    }

    /// Overwrites the offset encoded at `pos` (see [`NodeEntry::offset_pos`]).
    pub fn set_offset(&mut self, pos: usize, off: Offset) {
        let mut w = Writer::with_capacity(OFFSET_LEN);
        w.put5(off);
        self.data[pos..pos + OFFSET_LEN].copy_from_slice(w.as_bytes());
    }

    /// Returns a copy of this leaf with `key` added, or with the offset
    /// replaced if `key` is already present.
    ///
    /// # Errors
    ///
    /// Propagates errors from `get`.
    pub fn insert(
        &self,
        key: &[u8],
        off: Offset,
        mut get: impl FnMut(Offset) -> Result<Vec<u8>>,
    ) -> Result<FNode> {
        let mut entries = self.entries();
        let Some((i, ioff)) = self.search(key) else {
            return Ok(FNode::from_entries([(&[][..], off)]));
        };
        let ikey = get(ioff)?;
        if key == ikey.as_slice() {
            entries[i].1 = off;
            return Ok(FNode::from_entries(entries));
        }

        // The candidate may share a known prefix with `key` yet sort above it.
        let pos = if key > ikey.as_slice() { i + 1 } else { i };
        let known = match pos {
            0 => Vec::new(),
            p if p - 1 == i => distinguish(&ikey, key),
            p => distinguish(&get(entries[p - 1].1)?, key),
        };
        if pos < entries.len() {
            let next = if pos == i { ikey } else { get(entries[pos].1)? };
            entries[pos].0 = distinguish(key, &next);
        }
        entries.insert(pos, (known, off));
        Ok(FNode::from_entries(entries))
    }

    /// Returns a copy of this tree node with a child inserted at `at`.
    pub fn insert_child(&self, at: usize, separator: &[u8], child: Offset) -> FNode {
        let mut entries = self.entries();
        entries.insert(at, (separator.to_vec(), child));
        FNode::from_entries(entries)
    }

    /// Returns a copy of this leaf without the entry for data offset `off`,
    /// or `None` if no entry has that offset.
    ///
    /// # Errors
    ///
    /// Propagates errors from `get`.
    pub fn delete(
        &self,
        off: Offset,
        mut get: impl FnMut(Offset) -> Result<Vec<u8>>,
    ) -> Result<Option<FNode>> {
        let mut entries = self.entries();
        let Some(i) = entries.iter().position(|e| e.1 == off) else {
            return Ok(None);
        };
        entries.remove(i);
        if i < entries.len() {
            entries[i].0 = if i == 0 {
                Vec::new()
            } else {
                distinguish(&get(entries[i - 1].1)?, &get(entries[i].1)?)
            };
        }
        Ok(Some(FNode::from_entries(entries)))
    }

    /// Splits the node at its entry midpoint.
    ///
    /// Returns the left half, the right half, and the split key: the right
    /// half's first known prefix, which moves up to the parent while the
    /// right node's first entry becomes empty.
    ///
    /// # Panics
    ///
    /// Panics if the node has fewer than two entries.
    pub fn split(&self) -> (FNode, FNode, Vec<u8>) {
        let mut entries = self.entries();
        assert!(entries.len() >= 2, "can't split a node with {} entries", entries.len());
        let mid = entries.len().div_ceil(2);
        let mut right = entries.split_off(mid);
        let split_key = std::mem::take(&mut right[0].0);
        (FNode::from_entries(entries), FNode::from_entries(right), split_key)
    }
}

/// Iterator over [`NodeEntry`] values.
pub struct NodeIter<'a> {
    r: Reader<'a>,
    known: Vec<u8>,
}

impl Iterator for NodeIter<'_> {
    type Item = NodeEntry;

    fn next(&mut self) -> Option<NodeEntry> {
        if self.r.remaining() == 0 {
            return None;
        }
        let npre = self.r.get_uvarint() as usize;
        let dlen = self.r.get_uvarint() as usize;
        let diff = self.r.get_raw(dlen);
        self.known.truncate(npre);
        self.known.extend_from_slice(diff);
        let offset_pos = self.r.position();
        let offset = self.r.get5();
        Some(NodeEntry { known: self.known.clone(), offset, offset_pos })
    }
}

/// Incremental node encoder.
#[derive(Debug, Default)]
pub struct FNodeBuilder {
    w: Writer,
    prev: Vec<u8>,
    count: usize,
}

impl FNodeBuilder {
    /// Appends an entry; known prefixes must be added in increasing order.
    pub fn add(&mut self, known: &[u8], off: Offset) {
        let npre = common_prefix_len(&self.prev, known);
        let diff = &known[npre..];
        self.w.put_uvarint(npre as u64).put_uvarint(diff.len() as u64).put_raw(diff).put5(off);
        self.prev.clear();
        self.prev.extend_from_slice(known);
        self.count += 1;
    }

    /// Encoded size so far.
    pub fn size(&self) -> usize {
        self.w.len()
    }

    /// Entries added so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Finishes the node.
    pub fn finish(self) -> FNode {
        FNode { data: self.w.into_inner() }
    }
}

/// Persists a node as a sized, checksummed region.
pub(crate) fn write_node(store: &Store, node: &FNode) -> Result<Offset> {
    let mut buf = Vec::with_capacity(node.size() + cksum::LEN);
    buf.extend_from_slice(node.as_bytes());
    cksum::append(&mut buf);
    store.save_sized(&buf)
}

/// Loads and verifies a node written by [`write_node`].
pub(crate) fn read_node(store: &Store, off: Offset) -> Result<Arc<FNode>> {
    let data = cksum::strip(store.read_sized(off)?, off)?;
    Ok(Arc::new(FNode::from_bytes(data)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::Error;

    /// Key lookup over a map from fake data offsets to keys.
    struct Keys(HashMap<Offset, Vec<u8>>);

    impl Keys {
        fn new() -> Self {
            Self(HashMap::new())
        }

        fn add(&mut self, key: &str) -> Offset {
            let off = self.0.len() as Offset + 100;
            self.0.insert(off, key.as_bytes().to_vec());
            off
        }

        fn get(&self) -> impl FnMut(Offset) -> Result<Vec<u8>> + '_ {
            |off| self.0.get(&off).cloned().ok_or(Error::Corrupted { reason: "no key".into() })
        }
    }

    fn knowns(node: &FNode) -> Vec<String> {
        node.iter().map(|e| String::from_utf8(e.known).unwrap()).collect()
    }

    #[test]
    fn test_encode_decode_entries() {
        let node = FNode::from_entries([("", 10u64), ("abc", 20), ("abd", 30), ("b", 40)]);
        let entries = node.entries();
        assert_eq!(
            entries,
            vec![
                (b"".to_vec(), 10),
                (b"abc".to_vec(), 20),
                (b"abd".to_vec(), 30),
                (b"b".to_vec(), 40)
            ]
        );
        assert_eq!(node.count(), 4);
        // "abd" shares two bytes with "abc", so it encodes as [2][1]['d'][off:5].
        assert_eq!(node.size(), 7 + 10 + 8 + 8);
    }

    #[test]
    fn test_empty_node() {
        let node = FNode::new();
        assert!(node.is_empty());
        assert_eq!(node.count(), 0);
        assert!(node.search(b"x").is_none());
    }

    #[test]
    fn test_search_takes_last_known_le_key() {
        let node = FNode::from_entries([("", 1u64), ("d", 2), ("m", 3), ("mq", 4)]);
        assert_eq!(node.search(b"a"), Some((0, 1)));
        assert_eq!(node.search(b"d"), Some((1, 2)));
        assert_eq!(node.search(b"lzz"), Some((1, 2)));
        assert_eq!(node.search(b"mp"), Some((2, 3)));
        assert_eq!(node.search(b"mq"), Some((3, 4)));
        assert_eq!(node.search(b"zzz"), Some((3, 4)));
    }

    #[test]
    fn test_set_offset_in_place() {
        let mut node = FNode::from_entries([("", 1u64), ("k", 2)]);
        let pos = node.iter().nth(1).unwrap().offset_pos;
        let before = node.size();
        node.set_offset(pos, 0xff_ffff_fff0);
        assert_eq!(node.size(), before);
        assert_eq!(node.entries()[1], (b"k".to_vec(), 0xff_ffff_fff0));
    }

    #[test]
    fn test_insert_builds_minimal_prefixes() {
        let mut keys = Keys::new();
        let mut node = FNode::new();
        for k in ["bbb", "abc", "bba", "c", "abd", "a"] {
            let off = keys.add(k);
            node = node.insert(k.as_bytes(), off, keys.get()).unwrap();
        }
        let ordered: Vec<Vec<u8>> =
            node.iter().map(|e| keys.0[&e.offset].clone()).collect();
        let mut expected: Vec<Vec<u8>> = keys.0.values().cloned().collect();
        expected.sort();
        assert_eq!(ordered, expected);
        // a, abc, abd, bba, bbb, c
        assert_eq!(knowns(&node), ["", "ab", "abd", "b", "bbb", "c"]);
    }

    #[test]
    fn test_insert_existing_key_replaces_offset() {
        let mut keys = Keys::new();
        let a = keys.add("apple");
        let b = keys.add("banana");
        let node = FNode::new().insert(b"apple", a, keys.get()).unwrap();
        let node = node.insert(b"banana", b, keys.get()).unwrap();
        let again = keys.add("banana");
        let node = node.insert(b"banana", again, keys.get()).unwrap();
        assert_eq!(node.count(), 2);
        assert_eq!(node.entries()[1].1, again);
    }

    #[test]
    fn test_insert_below_candidate_with_shared_known() {
        // "abz" has known "ab"; "abc" routes to it but sorts before it.
        let mut keys = Keys::new();
        let mut node = FNode::new();
        for k in ["aa", "abz", "abc"] {
            let off = keys.add(k);
            node = node.insert(k.as_bytes(), off, keys.get()).unwrap();
        }
        assert_eq!(knowns(&node), ["", "ab", "abz"]);
    }

    #[test]
    fn test_delete_recomputes_next_known() {
        let mut keys = Keys::new();
        let mut node = FNode::new();
        let mut offs = HashMap::new();
        for k in ["1234xx", "1235xx", "1299xx", "1300xx"] {
            let off = keys.add(k);
            offs.insert(k, off);
            node = node.insert(k.as_bytes(), off, keys.get()).unwrap();
        }
        assert_eq!(knowns(&node), ["", "1235", "129", "13"]);

        let node = node.delete(offs["1235xx"], keys.get()).unwrap().unwrap();
        assert_eq!(knowns(&node), ["", "129", "13"]);

        let node = node.delete(offs["1234xx"], keys.get()).unwrap().unwrap();
        assert_eq!(knowns(&node), ["", "13"]);

        assert!(node.delete(9999, keys.get()).unwrap().is_none());
    }

    #[test]
    fn test_split_example() {
        let mut keys = Keys::new();
        let mut node = FNode::new();
        for k in ["1234xxxx", "1235xxxx", "1299xxxx", "1300xxxx", "1305xxxx"] {
            let off = keys.add(k);
            node = node.insert(k.as_bytes(), off, keys.get()).unwrap();
        }
        let (left, right, split_key) = node.split();
        assert_eq!(split_key, b"13");
        assert_eq!(knowns(&left), ["", "1235", "129"]);
        assert_eq!(knowns(&right), ["", "1305"]);

        let key_of = |n: &FNode| -> Vec<String> {
            n.iter().map(|e| String::from_utf8(keys.0[&e.offset][..4].to_vec()).unwrap()).collect()
        };
        assert_eq!(key_of(&left), ["1234", "1235", "1299"]);
        assert_eq!(key_of(&right), ["1300", "1305"]);
    }

    #[test]
    fn test_insert_child() {
        let node = FNode::from_entries([("", 1u64), ("m", 2)]);
        let node = node.insert_child(1, b"f", 9);
        assert_eq!(
            node.entries(),
            vec![(b"".to_vec(), 1), (b"f".to_vec(), 9), (b"m".to_vec(), 2)]
        );
    }

    #[test]
    fn test_builder_tracks_size_and_count() {
        let mut b = FNodeBuilder::default();
        b.add(b"", 1);
        b.add(b"hello", 2);
        assert_eq!(b.count(), 2);
        assert_eq!(b.size(), (1 + 1 + 5) + (1 + 1 + 5 + 5));
        let node = b.finish();
        assert_eq!(node.size(), 19);
    }

    #[test]
    fn test_write_read_node_and_corruption() {
        let store = Store::in_memory();
        let node = FNode::from_entries([("", 16u64), ("q", 32)]);
        let off = write_node(&store, &node).unwrap();
        assert_eq!(*read_node(&store, off).unwrap(), node);

        let mut b = store.read(off + 5, 1).unwrap();
        b[0] ^= 0x40;
        store.write(off + 5, &b).unwrap();
        assert!(matches!(read_node(&store, off), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_distinguish() {
        assert_eq!(distinguish(b"1234", b"1235"), b"1235");
        assert_eq!(distinguish(b"1235", b"1299"), b"129");
        assert_eq!(distinguish(b"ab", b"abc"), b"abc");
        assert_eq!(distinguish(b"", b"x"), b"x");
    }
}
