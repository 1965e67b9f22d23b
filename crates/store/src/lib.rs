//! fbdb-store: an embedded transactional storage engine.
//!
//! Everything lives in one append-only [`Store`]. Nothing is ever
//! overwritten: indexes are immutable B-trees ([`Fbtree`]) whose changes are
//! written as new nodes, and the set of tables is described by two packed,
//! binary-searchable tables referenced from a checksummed [`Checkpoint`].
//!
//! - **Snapshot reads**: a [`ReadTran`] holds one immutable [`DbState`] and
//!   never blocks or is blocked.
//! - **Concurrent updates**: each [`UpdateTran`] writes to private overlay
//!   layers; commits are merged one at a time by a single worker thread.
//! - **Periodic persistence**: the worker saves changed trees, rewrites the
//!   packed tables and appends a checkpoint on a timer.
//! - **Recovery**: reopening scans backward for the last valid checkpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Database API                 │
//! │   (create, open, read, update, persist)     │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │        Transactions + merge worker          │
//! │  (ReadTran, UpdateTran, DbState, ArcSwap)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │   Meta: packed Schema/Info + HAMT overrides │
//! │           Checkpoint records                │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │     Overlay → Fbtree (+ redirs, builder)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │      Store (FileBackend / InMemoryBackend)  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use fbdb_store::{Database, DatabaseConfig, IndexSchema, Schema};
//!
//! let db = Database::open_in_memory(DatabaseConfig::default())?;
//!
//! let mut tran = db.update();
//! let notes = Schema::builder().table("notes").indexes(vec![IndexSchema::key([0])]).build();
//! tran.create_table(notes)?;
//! let off = tran.output("notes", b"remember the milk")?;
//! tran.commit()?;
//!
//! let tran = db.read();
//! assert_eq!(tran.search("notes", 0, b"remember the milk")?, Some(off));
//! # Ok::<(), fbdb_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod db;
pub mod error;
pub mod fbtree;
pub mod hamt;
pub mod integrity;
pub mod meta;
pub mod overlay;
pub mod packed;
pub mod store;

pub use checkpoint::{CHECKPOINT_MAGIC, Checkpoint};
pub use db::{Database, DatabaseConfig, DbState, ReadTran, UpdateTran};
pub use error::{Error, Result};
pub use fbtree::{
    CheckStats, Fbtree, FbtreeBuilder, IxSpec, KeyExtractor, RecordKey, SaveStrategy, TreeConfig,
    TreeContext,
};
pub use hamt::{Hamt, HamtItem, HamtKey};
pub use integrity::{CheckError, CheckReport, IntegrityChecker};
pub use meta::{ColumnSchema, ForeignKey, IndexMode, IndexSchema, Info, Meta, MetaDelta, Schema};
pub use overlay::{Mbtree, Overlay};
pub use packed::{Packed, PackedItem};
pub use store::{FileBackend, InMemoryBackend, MAX_OFFSET, Offset, StorageBackend, Store};
