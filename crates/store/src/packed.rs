//! Sorted, finger-indexed persistence for metadata tables.
//!
//! A packed table is written once as a single sized region:
//!
//! ```text
//! [nitems:2][finger:3 × ⌈nitems/16⌉][item]...[cksum:4]
//! item = [key:str][bodylen:uvarint][body]
//! ```
//!
//! Items are stored in key order. Finger `i` holds the position of item
//! `16 × i`, so a point lookup binary-searches the fingers (reading each
//! finger's key from the item it points at) and then scans at most 16 items.
//! Nothing is decoded except the item that matches.

use std::{marker::PhantomData, sync::Arc};

use crate::{
    error::{Error, Result},
    hamt::{Hamt, HamtItem},
    store::{
        Offset, Store, cksum,
        codec::{Reader, Writer},
    },
};

/// Items per finger.
pub const PER_FINGER: usize = 16;

/// Largest number of items a packed table can hold.
pub const MAX_ITEMS: usize = u16::MAX as usize;

/// An item that can be stored in a packed table.
///
/// The key is written by the table itself, ahead of the body.
pub trait PackedItem: HamtItem<Key = String> + Sized {
    /// Extra state needed to rebuild an item, such as the store that
    /// index trees live in.
    type Ctx: Clone;

    /// Encodes everything except the key.
    fn write_body(&self, w: &mut Writer);

    /// Decodes an item whose key has already been read.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is malformed or references unreadable
    /// data.
    fn read_body(key: String, r: &mut Reader<'_>, ctx: &Self::Ctx) -> Result<Self>;
}

/// A read-only packed table loaded from the store.
#[derive(Clone)]
pub struct Packed<T: PackedItem> {
    offset: Offset,
    /// Region contents without the checksum.
    buf: Arc<[u8]>,
    fingers: Arc<[usize]>,
    ctx: T::Ctx,
    _item: PhantomData<fn() -> T>,
}

impl<T: PackedItem> std::fmt::Debug for Packed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packed")
            .field("offset", &self.offset)
            .field("len", &self.len())
            .field("bytes", &self.buf.len())
            .finish()
    }
}

fn body<T: PackedItem>(item: &T) -> Vec<u8> {
    let mut w = Writer::new();
    item.write_body(&mut w);
    w.into_inner()
}

fn write_entries(store: &Store, mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Offset> {
    if entries.len() > MAX_ITEMS {
        return Err(Error::OutOfSpace { requested: entries.len() });
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let nitems = entries.len();
    let nfingers = nitems.div_ceil(PER_FINGER);
    let mut w = Writer::with_capacity(2 + 3 * nfingers + 64 * nitems);
    w.put2(nitems);
    let fingers_at = w.len();
    for _ in 0..nfingers {
        w.put3(0);
    }
    for (i, (key, body)) in entries.iter().enumerate() {
        if i % PER_FINGER == 0 {
            let pos = w.len();
            w.patch3(fingers_at + 3 * (i / PER_FINGER), pos);
        }
        w.put_bytes(key).put_uvarint(body.len() as u64).put_raw(body);
    }
    let mut buf = w.into_inner();
    cksum::append(&mut buf);
    store.save_sized(&buf)
}

impl<T: PackedItem> Packed<T> {
    /// Writes `items` to the store in key order and returns the offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if there are more than [`MAX_ITEMS`]
    /// items or the store is full.
    pub fn write<'a>(store: &Store, items: impl IntoIterator<Item = &'a T>) -> Result<Offset>
    where
        T: 'a,
    {
        let entries = items
            .into_iter()
            .map(|item| (item.key().as_bytes().to_vec(), body(item)))
            .collect();
        write_entries(store, entries)
    }

    /// Writes the items of `base` with `updates` applied on top, copying
    /// unchanged items without decoding them.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn write_merged(store: &Store, base: &Packed<T>, updates: &Hamt<T>) -> Result<Offset> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = base
            .raw()
            .filter(|(key, _)| !std::str::from_utf8(key).is_ok_and(|k| updates.get(k).is_some()))
            .map(|(key, body)| (key.to_vec(), body.to_vec()))
            .collect();
        entries.extend(updates.iter().map(|item| (item.key().as_bytes().to_vec(), body(item))));
        write_entries(store, entries)
    }

    /// Writes every item of a HAMT.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn write_hamt(store: &Store, hamt: &Hamt<T>) -> Result<Offset> {
        Self::write(store, hamt.iter())
    }

    /// Loads a packed table, verifying its checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] if the region is damaged.
    pub fn open(store: &Store, offset: Offset, ctx: T::Ctx) -> Result<Self> {
        let buf = cksum::strip(store.read_sized(offset)?, offset)?;
        if buf.len() < 2 {
            return Err(Error::Corrupted { reason: format!("packed table at {offset} too short") });
        }
        let mut r = Reader::new(&buf);
        let nitems = r.get2();
        let nfingers = nitems.div_ceil(PER_FINGER);
        if buf.len() < 2 + 3 * nfingers {
            return Err(Error::Corrupted { reason: format!("packed table at {offset} truncated") });
        }
        let fingers: Vec<usize> = (0..nfingers).map(|_| r.get3()).collect();
        if fingers.iter().any(|&pos| pos >= buf.len()) {
            return Err(Error::Corrupted {
                reason: format!("packed table at {offset} has finger past end"),
            });
        }
        Ok(Self {
            offset,
            buf: buf.into(),
            fingers: fingers.into(),
            ctx,
            _item: PhantomData,
        })
    }

    /// Offset the table was loaded from.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        Reader::new(&self.buf).get2()
    }

    /// Returns true if the table holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finger_key(&self, i: usize) -> &[u8] {
        let mut r = Reader::new(&self.buf);
        r.seek(self.fingers[i]);
        r.get_bytes()
    }

    /// Looks up a single item by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the matching item cannot be decoded.
    pub fn get(&self, key: &str) -> Result<Option<T>> {
        let target = key.as_bytes();
        // Last finger whose key is <= target.
        let mut lo = 0;
        let mut hi = self.fingers.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.finger_key(mid) <= target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return Ok(None);
        }
        let fi = lo - 1;

        let mut r = Reader::new(&self.buf);
        r.seek(self.fingers[fi]);
        let remaining = self.len() - fi * PER_FINGER;
        for _ in 0..remaining.min(PER_FINGER) {
            let k = r.get_bytes();
            let len = r.get_uvarint() as usize;
            let body = r.get_raw(len);
            if k == target {
                let key = String::from_utf8(k.to_vec())
                    .map_err(|e| Error::Corrupted { reason: format!("invalid key: {e}") })?;
                return T::read_body(key, &mut Reader::new(body), &self.ctx).map(Some);
            }
            if k > target {
                break;
            }
        }
        Ok(None)
    }

    /// Undecoded `(key, body)` pairs in key order.
    fn raw(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        let mut r = Reader::new(&self.buf);
        r.seek(2 + 3 * self.fingers.len());
        (0..self.len()).map(move |_| {
            let key = r.get_bytes();
            let len = r.get_uvarint() as usize;
            (key, r.get_raw(len))
        })
    }

    /// Every key, in order, without decoding the items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a key is not valid UTF-8.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.raw()
            .map(|(key, _)| {
                String::from_utf8(key.to_vec())
                    .map_err(|e| Error::Corrupted { reason: format!("invalid key: {e}") })
            })
            .collect()
    }

    /// Decodes every item, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if any item cannot be decoded.
    pub fn items(&self) -> Result<Vec<T>> {
        self.raw()
            .map(|(key, body)| {
                let key = String::from_utf8(key.to_vec())
                    .map_err(|e| Error::Corrupted { reason: format!("invalid key: {e}") })?;
                T::read_body(key, &mut Reader::new(body), &self.ctx)
            })
            .collect()
    }

    /// Decodes every item into a fresh frozen HAMT.
    ///
    /// # Errors
    ///
    /// Returns an error if any item cannot be decoded.
    pub fn to_hamt(&self) -> Result<Hamt<T>> {
        let mut h = Hamt::new().mutable();
        for item in self.items()? {
            h.put(item);
        }
        Ok(h.freeze())
    }
}
