//! Checkpoint records: the durable roots of the database.
//!
//! A checkpoint is appended after every persist. It names the packed schema
//! and info tables that describe the whole database at that point, and links
//! back to the previous checkpoint.
//!
//! # Layout
//!
//! ```text
//! ┌──────────┬────────┬────────────┬──────────────┬────────────┬────────┐
//! │ FBDBCKPT │ size:2 │ backlink:5 │ schema_off:5 │ info_off:5 │ cksum  │
//! └──────────┴────────┴────────────┴──────────────┴────────────┴────────┘
//! ```
//!
//! The schema and info tables are not inlined in the record. Each is its own
//! sized region laid out as `[nitems:2][fingers:3 x ceil(n/16)][items][cksum:4]`
//! (see [`crate::packed`]) and the record stores only their offsets, so every
//! record is exactly [`CHECKPOINT_SIZE`] bytes. A table left unchanged by a
//! persist is referenced again at its old offset instead of being rewritten.
//!
//! The magic lets recovery find the last record by scanning backward from
//! the end of the store. Anything written after it, such as nodes of an
//! interrupted persist, is unreferenced and ignored.

use crate::{
    error::{Error, Result},
    store::{
        Offset, Store, cksum,
        codec::{Reader, Writer},
    },
};

/// Marker at the start of every checkpoint record.
pub const CHECKPOINT_MAGIC: [u8; 8] = *b"FBDBCKPT";

/// Total size of a record, checksum included.
pub const CHECKPOINT_SIZE: usize = CHECKPOINT_MAGIC.len() + 2 + 5 + 5 + 5 + cksum::LEN;

/// A verified checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Where this record starts.
    pub offset: Offset,
    /// Previous checkpoint, or 0 for the first.
    pub backlink: Offset,
    /// Packed schema table.
    pub schema_off: Offset,
    /// Packed info table.
    pub info_off: Offset,
}

impl Checkpoint {
    /// Appends a checkpoint record.
    ///
    /// # Errors
    ///
    /// Returns a store error if the record cannot be written.
    pub fn write(
        store: &Store,
        backlink: Offset,
        schema_off: Offset,
        info_off: Offset,
    ) -> Result<Checkpoint> {
        let mut w = Writer::with_capacity(CHECKPOINT_SIZE);
        w.put_raw(&CHECKPOINT_MAGIC)
            .put2(CHECKPOINT_SIZE)
            .put5(backlink)
            .put5(schema_off)
            .put5(info_off);
        let mut buf = w.into_inner();
        cksum::append(&mut buf);
        let offset = store.save(&buf)?;
        Ok(Checkpoint { offset, backlink, schema_off, info_off })
    }

    /// Reads and verifies the record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the record is truncated, has the wrong
    /// magic or size, fails its checksum, or points forward in the store.
    pub fn read(store: &Store, offset: Offset) -> Result<Checkpoint> {
        if offset + CHECKPOINT_SIZE as Offset > store.size() {
            return Err(Error::Corrupted { reason: format!("checkpoint at {offset} is truncated") });
        }
        let buf = store.read(offset, CHECKPOINT_SIZE)?;
        if buf[..CHECKPOINT_MAGIC.len()] != CHECKPOINT_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let buf = cksum::strip(buf, offset)?;
        let mut r = Reader::new(&buf);
        r.seek(CHECKPOINT_MAGIC.len());
        let size = r.get2();
        if size != CHECKPOINT_SIZE {
            return Err(Error::Corrupted {
                reason: format!("checkpoint at {offset} has size {size}"),
            });
        }
        let cp = Checkpoint {
            offset,
            backlink: r.get5(),
            schema_off: r.get5(),
            info_off: r.get5(),
        };
        if cp.backlink >= offset || cp.schema_off >= offset || cp.info_off >= offset {
            return Err(Error::Corrupted {
                reason: format!("checkpoint at {offset} refers past itself"),
            });
        }
        Ok(cp)
    }

    /// Finds the last valid checkpoint in the store.
    ///
    /// Candidates that fail verification are logged and skipped, so a torn
    /// final record falls back to the one before it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if scanning the store fails.
    pub fn find_last(store: &Store) -> Result<Option<Checkpoint>> {
        let mut before = store.size();
        while let Some(off) = store.last_offset(before, &CHECKPOINT_MAGIC)? {
            match Self::read(store, off) {
                Ok(cp) => return Ok(Some(cp)),
                Err(e) if e.is_corruption() => {
                    tracing::warn!(offset = off, error = %e, "Skipping invalid checkpoint");
                    before = off + CHECKPOINT_MAGIC.len() as Offset - 1;
                },
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// The previous checkpoint, if any.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the linked record is invalid.
    pub fn previous(&self, store: &Store) -> Result<Option<Checkpoint>> {
        match self.backlink {
            0 => Ok(None),
            off => Self::read(store, off).map(Some),
        }
    }
}
