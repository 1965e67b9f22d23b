//! Redirection table for unsaved and relocated fbtree nodes.
//!
//! Nodes are never modified in place. An update instead records a redirect
//! from the node's offset to either a replacement node held in memory or the
//! offset the replacement was later written to. New nodes that do not exist
//! on disk yet (the right half of a split, a new root) get *fake* offsets
//! counted down from [`MAX_OFFSET`], so they can be referenced from parent
//! nodes exactly like real ones.
//!
//! Persisted layout:
//!
//! ```text
//! [size:2][next_off:5][n:2]{[offset:5][new_offset:5]}[np:2]{[offset:5]}[cksum:4]
//! ```

use std::sync::Arc;

use super::node::FNode;
use crate::{
    error::{Error, Result},
    hamt::{Hamt, HamtItem},
    store::{
        MAX_OFFSET, Offset, Store, cksum,
        codec::{Reader, Writer},
    },
};

/// Where a redirected node now lives.
#[derive(Debug, Clone)]
pub struct Redir {
    /// The offset parents refer to.
    pub offset: Offset,
    /// Replacement node not yet written to the store.
    pub mnode: Option<Arc<FNode>>,
    /// Offset of the written replacement, when `mnode` is `None`.
    pub new_offset: Offset,
}

impl HamtItem for Redir {
    type Key = u64;

    fn key(&self) -> &u64 {
        &self.offset
    }
}

/// Redirects plus the set of tree nodes on modified paths.
#[derive(Debug, Clone)]
pub struct Redirs {
    pub(crate) tbl: Hamt<Redir>,
    /// Unmodified tree nodes that lead to modified nodes.
    pub(crate) paths: Hamt<u64>,
    /// Fake offsets are everything above this.
    pub(crate) next_off: Offset,
}

impl Default for Redirs {
    fn default() -> Self {
        Self::new()
    }
}

impl Redirs {
    /// An empty, frozen table.
    pub fn new() -> Self {
        Self { tbl: Hamt::new(), paths: Hamt::new(), next_off: MAX_OFFSET }
    }

    /// Starts a mutable generation of both maps.
    pub fn mutable(&self) -> Self {
        Self { tbl: self.tbl.mutable(), paths: self.paths.mutable(), next_off: self.next_off }
    }

    /// Seals the current generation.
    pub fn freeze(&mut self) {
        self.tbl = std::mem::take(&mut self.tbl).freeze();
        self.paths = std::mem::take(&mut self.paths).freeze();
    }

    /// Registers a new in-memory node under a fresh fake offset.
    pub fn add(&mut self, node: FNode) -> Offset {
        let off = self.next_off;
        self.next_off -= 1;
        self.tbl.put(Redir { offset: off, mnode: Some(Arc::new(node)), new_offset: 0 });
        off
    }

    /// Replaces the node at `off` with an in-memory node.
    pub fn set_mnode(&mut self, off: Offset, node: FNode) {
        self.tbl.put(Redir { offset: off, mnode: Some(Arc::new(node)), new_offset: 0 });
    }

    /// Returns true for offsets handed out by [`add`](Self::add).
    pub fn is_fake(&self, off: Offset) -> bool {
        off > self.next_off
    }

    /// Number of redirects.
    pub fn len(&self) -> usize {
        self.tbl.len()
    }

    /// Returns true if there are neither redirects nor paths.
    pub fn is_empty(&self) -> bool {
        self.tbl.is_empty() && self.paths.is_empty()
    }

    pub(crate) fn get(&self, off: Offset) -> Option<&Redir> {
        self.tbl.get(&off)
    }

    pub(crate) fn in_paths(&self, off: Offset) -> bool {
        self.paths.get(&off).is_some()
    }

    fn encoded_size(&self) -> usize {
        2 + 5 + 2 + self.tbl.len() * 10 + 2 + self.paths.len() * 5 + cksum::LEN
    }

    /// Returns true if the table can be saved in one block.
    pub fn fits(&self) -> bool {
        self.encoded_size() <= u16::MAX as usize
    }

    /// Writes the table to the store.
    ///
    /// # Panics
    ///
    /// Panics if any redirect still holds an unsaved node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if the table does not fit its 2-byte
    /// size field, or a store error.
    pub fn save(&self, store: &Store) -> Result<Offset> {
        let nr = self.tbl.len();
        let np = self.paths.len();
        let size = self.encoded_size();
        if !self.fits() {
            return Err(Error::OutOfSpace { requested: size });
        }
        let mut w = Writer::with_capacity(size);
        w.put2(size).put5(self.next_off).put2(nr);
        for r in self.tbl.iter() {
            assert!(r.mnode.is_none(), "saving redirect {} with an unsaved node", r.offset);
            w.put5(r.offset).put5(r.new_offset);
        }
        w.put2(np);
        for &p in self.paths.iter() {
            w.put5(p);
        }
        let mut buf = w.into_inner();
        cksum::append(&mut buf);
        store.save(&buf)
    }

    /// Loads a table written by [`save`](Self::save); offset 0 means empty.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the block is malformed or its checksum
    /// does not match.
    pub fn load(store: &Store, off: Offset) -> Result<Self> {
        if off == 0 {
            return Ok(Self::new());
        }
        store.check_region(off, 2)?;
        let head = store.read(off, 2)?;
        let size = Reader::new(&head).get2();
        if size < 2 + 5 + 2 + 2 + cksum::LEN {
            return Err(Error::Corrupted { reason: format!("redirects at {off} too short") });
        }
        store.check_region(off, size)?;
        let buf = cksum::strip(store.read(off, size)?, off)?;
        let mut r = Reader::new(&buf);
        r.seek(2);
        let next_off = r.get5();
        let mut tbl = Hamt::new().mutable();
        let nr = r.get2();
        if r.remaining() < nr * 10 + 2 {
            return Err(Error::Corrupted { reason: format!("redirects at {off} truncated") });
        }
        for _ in 0..nr {
            let offset = r.get5();
            let new_offset = r.get5();
            tbl.put(Redir { offset, mnode: None, new_offset });
        }
        let mut paths = Hamt::new().mutable();
        let np = r.get2();
        if r.remaining() != np * 5 {
            return Err(Error::Corrupted { reason: format!("redirects at {off} bad path count") });
        }
        for _ in 0..np {
            paths.put(r.get5());
        }
        Ok(Self { tbl: tbl.freeze(), paths: paths.freeze(), next_off })
    }
}
