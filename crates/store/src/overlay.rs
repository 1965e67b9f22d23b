//! Mutable layer in front of an immutable index tree.
//!
//! Update transactions never touch the shared [`Fbtree`] of an index.
//! Their inserts go to a private in-memory [`Mbtree`] layered over it,
//! and at commit that layer is handed to the merge worker as a delta, which
//! folds it into whatever the current base tree is by then.

use std::{
    collections::{BTreeMap, btree_map},
    iter::Peekable,
};

use crate::{
    error::Result,
    fbtree::{CheckStats, Fbtree, FbtreeIter, IxSpec, TreeContext},
    store::Offset,
};

/// Ordered in-memory map from full key to data offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mbtree {
    map: BTreeMap<Vec<u8>, Offset>,
}

impl Mbtree {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, key: Vec<u8>, off: Offset) {
        self.map.insert(key, off);
    }

    /// Looks up a key.
    pub fn get(&self, key: &[u8]) -> Option<Offset> {
        self.map.get(key).copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, Vec<u8>, Offset> {
        self.map.iter()
    }
}

/// An index: a shared base tree plus an optional private layer.
#[derive(Debug, Clone)]
pub struct Overlay {
    base: Fbtree,
    mb: Option<Mbtree>,
}

impl Overlay {
    /// Wraps a base tree with no layer.
    pub fn new(base: Fbtree) -> Self {
        Self { base, mb: None }
    }

    /// A new index over an empty tree.
    pub fn create(ctx: TreeContext, ixspec: IxSpec) -> Self {
        Self::new(Fbtree::create(ctx, ixspec))
    }

    /// The base tree.
    pub fn base(&self) -> &Fbtree {
        &self.base
    }

    /// The private layer, if any.
    pub fn layer(&self) -> Option<&Mbtree> {
        self.mb.as_ref()
    }

    /// Returns a copy with an empty private layer for a transaction.
    pub fn mutable(&self) -> Self {
        Self { base: self.base.clone(), mb: Some(Mbtree::new()) }
    }

    /// Returns true if the overlay has a private layer.
    pub fn is_mutable(&self) -> bool {
        self.mb.is_some()
    }

    /// Returns true if the base tree has unsaved nodes.
    pub fn is_dirty(&self) -> bool {
        self.base.is_dirty()
    }

    pub(crate) fn set_ixspec(&mut self, ixspec: IxSpec) {
        self.base.set_ixspec(ixspec);
    }

    /// Full key of the record at `off` under this index's projection.
    ///
    /// # Errors
    ///
    /// Propagates key extractor errors.
    pub fn leaf_key(&self, off: Offset) -> Result<Vec<u8>> {
        self.base.leaf_key(off)
    }

    /// Adds an entry to the private layer.
    ///
    /// # Panics
    ///
    /// Panics if the overlay has no layer.
    pub fn insert(&mut self, key: Vec<u8>, off: Offset) {
        match self.mb.as_mut() {
            Some(mb) => mb.insert(key, off),
            None => panic!("can't insert into a frozen overlay"),
        }
    }

    /// Looks up `key` in the layer, then in the base tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the base tree cannot be read.
    pub fn search(&self, key: &[u8]) -> Result<Option<Offset>> {
        if let Some(off) = self.mb.as_ref().and_then(|mb| mb.get(key)) {
            return Ok(Some(off));
        }
        self.base.search(key)
    }

    /// Iterates over `(full key, data offset)` across both levels, in key
    /// order. Layer entries shadow base entries with the same key.
    pub fn iter(&self) -> OverlayIter<'_> {
        OverlayIter {
            tree: &self.base,
            base: self.base.iter(),
            base_done: false,
            pending: None,
            layer: self.mb.as_ref().map(|mb| mb.iter()).unwrap_or_default().peekable(),
        }
    }

    /// Consumes the overlay, returning its layer (empty if it had none).
    pub fn into_delta(self) -> Mbtree {
        self.mb.unwrap_or_default()
    }

    /// Folds a committed layer into the base tree, in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the base tree cannot be read.
    pub fn merge(&self, delta: &Mbtree) -> Result<Overlay> {
        if delta.is_empty() {
            return Ok(self.clone());
        }
        let base = self.base.update(|t| {
            for (key, &off) in delta.iter() {
                t.insert(key, off)?;
            }
            Ok(())
        })?;
        Ok(Self { base, mb: self.mb.clone() })
    }

    /// Persists the base tree.
    ///
    /// # Panics
    ///
    /// Panics if the private layer holds entries; those must be merged
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be written.
    pub fn save(&self) -> Result<Overlay> {
        assert!(
            self.mb.as_ref().is_none_or(Mbtree::is_empty),
            "can't save an overlay with unmerged entries"
        );
        Ok(Self { base: self.base.save()?, mb: None })
    }

    /// Verifies the base tree. See [`Fbtree::check`].
    ///
    /// # Errors
    ///
    /// Returns a corruption error on the first violation.
    pub fn check(&self, f: impl FnMut(Offset)) -> Result<CheckStats> {
        self.base.check(f)
    }
}

/// Merged iterator returned by [`Overlay::iter`].
pub struct OverlayIter<'a> {
    tree: &'a Fbtree,
    base: FbtreeIter<'a>,
    base_done: bool,
    /// Next base entry with its full key resolved.
    pending: Option<(Vec<u8>, Offset)>,
    layer: Peekable<btree_map::Iter<'a, Vec<u8>, Offset>>,
}

impl Iterator for OverlayIter<'_> {
    type Item = Result<(Vec<u8>, Offset)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_none() && !self.base_done {
            let next = self
                .base
                .next()
                .map(|r| r.and_then(|(_, off)| Ok((self.tree.leaf_key(off)?, off))));
            match next {
                Some(Ok(entry)) => self.pending = Some(entry),
                Some(Err(e)) => {
                    self.base_done = true;
                    return Some(Err(e));
                },
                None => self.base_done = true,
            }
        }
        let take_layer = match (&self.pending, self.layer.peek()) {
            (None, None) => return None,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some((bk, _)), Some((lk, _))) => lk.as_slice() <= bk.as_slice(),
        };
        if !take_layer {
            return self.pending.take().map(Ok);
        }
        let (key, &off) = self.layer.next()?;
        if self.pending.as_ref().is_some_and(|(bk, _)| bk == key) {
            self.pending = None;
        }
        Some(Ok((key.clone(), off)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fbtree::tests::context;

    fn overlay_with(keys: &[&str]) -> Overlay {
        let ctx = context(64);
        let ov = Overlay::create(ctx.clone(), IxSpec::default());
        let base = ov
            .base()
            .update(|t| {
                for k in keys {
                    let off = ctx.store.save_sized(k.as_bytes())?;
                    t.insert(k.as_bytes(), off)?;
                }
                Ok(())
            })
            .unwrap();
        Overlay::new(base)
    }

    fn record(ov: &Overlay, key: &str) -> Offset {
        ov.base().context().store.save_sized(key.as_bytes()).unwrap()
    }

    #[test]
    fn test_layer_shadows_base() {
        let ov = overlay_with(&["b", "d"]);
        let mut tx = ov.mutable();
        let off = record(&tx, "d");
        tx.insert(b"d".to_vec(), off);
        tx.insert(b"a".to_vec(), record(&tx, "a"));
        tx.insert(b"c".to_vec(), record(&tx, "c"));
        assert_eq!(tx.search(b"d").unwrap(), Some(off));
        assert!(tx.search(b"b").unwrap().is_some());
        assert!(ov.search(b"a").unwrap().is_none());

        let keys: Vec<Vec<u8>> = tx.iter().map(|r| r.unwrap().0).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        let d = tx.iter().map(|r| r.unwrap()).find(|(k, _)| k == b"d").unwrap();
        assert_eq!(d.1, off);
    }

    #[test]
    fn test_merge_delta_into_newer_base() {
        let ov = overlay_with(&["m"]);
        let mut tx = ov.mutable();
        tx.insert(b"x".to_vec(), record(&tx, "x"));
        let delta = tx.into_delta();
        assert_eq!(delta.len(), 1);

        // Another commit moved the base on in the meantime.
        let mut other = ov.mutable();
        other.insert(b"a".to_vec(), record(&other, "a"));
        let newer = ov.merge(&other.into_delta()).unwrap();

        let merged = newer.merge(&delta).unwrap();
        assert!(merged.is_dirty());
        let keys: Vec<Vec<u8>> = merged.iter().map(|r| r.unwrap().0).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"m".to_vec(), b"x".to_vec()]);

        let saved = merged.save().unwrap();
        assert!(!saved.is_dirty());
        assert_eq!(saved.check(|_| {}).unwrap().count, 3);
    }

    #[test]
    #[should_panic(expected = "frozen overlay")]
    fn test_insert_without_layer_panics() {
        let mut ov = overlay_with(&[]);
        ov.insert(b"a".to_vec(), 100);
    }
}
