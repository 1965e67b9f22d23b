//! Database metadata: schemas and table info.
//!
//! Both tables are persisted as [`Packed`] tables. Changes committed since
//! the last persist are held in HAMTs layered over them, so a commit costs a
//! few path copies and a persist rewrites each packed table once.
//!
//! ```text
//!            get_ro_info("orders")
//!                    │
//!        ┌───────────▼───────────┐   hit
//!        │ info overrides (HAMT) ├───────► Info
//!        └───────────┬───────────┘
//!                    │ miss
//!        ┌───────────▼───────────┐
//!        │ packed info table     ├───────► Info (+ ixspecs from schema)
//!        └───────────────────────┘
//! ```

mod info;
mod schema;

use std::collections::BTreeSet;

pub use info::Info;
pub use schema::{ColumnSchema, ForeignKey, IndexMode, IndexSchema, Schema};
use tracing::debug;

use crate::{
    error::{Error, Result},
    fbtree::TreeContext,
    hamt::Hamt,
    packed::Packed,
    store::Offset,
};

/// Everything one update transaction changed in the metadata.
#[derive(Debug, Clone, Default)]
pub struct MetaDelta {
    /// Tables created, in creation order.
    pub schemas: Vec<Schema>,
    /// Per-table deltas: counters to add and index layers to merge.
    pub infos: Vec<Info>,
}

impl MetaDelta {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty() && self.infos.is_empty()
    }
}

/// An immutable view of all table metadata.
#[derive(Debug, Clone)]
pub struct Meta {
    ctx: TreeContext,
    schema: Packed<Schema>,
    info: Packed<Info>,
    schema_ovr: Hamt<Schema>,
    info_ovr: Hamt<Info>,
    /// True if anything changed since the packed tables were written.
    dirty: bool,
}

impl Meta {
    /// Writes empty packed tables for a new database.
    ///
    /// # Errors
    ///
    /// Returns a store error if the tables cannot be written.
    pub fn create(ctx: TreeContext) -> Result<Self> {
        let schema_off = Packed::<Schema>::write(&ctx.store, [])?;
        let info_off = Packed::<Info>::write(&ctx.store, [])?;
        Self::open(ctx, schema_off, info_off)
    }

    /// Loads persisted packed tables.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if either table fails verification.
    pub fn open(ctx: TreeContext, schema_off: Offset, info_off: Offset) -> Result<Self> {
        let schema = Packed::open(&ctx.store, schema_off, ())?;
        let info = Packed::open(&ctx.store, info_off, ctx.clone())?;
        Ok(Self {
            ctx,
            schema,
            info,
            schema_ovr: Hamt::new(),
            info_ovr: Hamt::new(),
            dirty: false,
        })
    }

    /// Offset of the packed schema table.
    pub fn schema_offset(&self) -> Offset {
        self.schema.offset()
    }

    /// Offset of the packed info table.
    pub fn info_offset(&self) -> Offset {
        self.info.offset()
    }

    /// Returns true if there are committed changes not yet persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Tree context shared by every index.
    pub fn context(&self) -> &TreeContext {
        &self.ctx
    }

    /// Looks up a table's schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the packed entry cannot be decoded.
    pub fn get_ro_schema(&self, table: &str) -> Result<Option<Schema>> {
        if let Some(schema) = self.schema_ovr.get(table) {
            return Ok(Some(schema.clone()));
        }
        self.schema.get(table)
    }

    /// Looks up a table's info, with index key projections attached.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry or its index trees cannot be loaded.
    pub fn get_ro_info(&self, table: &str) -> Result<Option<Info>> {
        if let Some(info) = self.info_ovr.get(table) {
            return Ok(Some(info.clone()));
        }
        let Some(mut info) = self.info.get(table)? else {
            return Ok(None);
        };
        let schema = self.get_ro_schema(table)?.ok_or_else(|| Error::Corrupted {
            reason: format!("table {table} has info but no schema"),
        })?;
        info.set_ixspecs(schema.ixspecs());
        Ok(Some(info))
    }

    /// Every table name, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if a packed key is malformed.
    pub fn tables(&self) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = self.schema.keys()?.into_iter().collect();
        names.extend(self.schema_ovr.iter().map(|s| s.table.clone()));
        Ok(names.into_iter().collect())
    }

    /// Returns the metadata with a committed transaction applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableExists`] for a duplicate create,
    /// [`Error::TableNotFound`] for a delta on a missing table, or an error
    /// from merging an index.
    pub fn apply(&self, delta: &MetaDelta) -> Result<Meta> {
        let mut next = self.clone();
        next.schema_ovr = self.schema_ovr.mutable();
        next.info_ovr = self.info_ovr.mutable();
        for schema in &delta.schemas {
            if next.get_ro_schema(&schema.table)?.is_some() {
                return Err(Error::TableExists { table: schema.table.clone() });
            }
            let info = Info::create(schema.table.clone(), &self.ctx, schema.ixspecs());
            next.schema_ovr.put(schema.clone());
            next.info_ovr.put(info);
        }
        for d in &delta.infos {
            let current = next
                .get_ro_info(&d.table)?
                .ok_or_else(|| Error::TableNotFound { table: d.table.clone() })?;
            next.info_ovr.put(current.merge(d)?);
        }
        next.schema_ovr = next.schema_ovr.freeze();
        next.info_ovr = next.info_ovr.freeze();
        next.dirty = self.dirty || !delta.is_empty();
        Ok(next)
    }

    /// Saves every changed index tree and rewrites the packed tables.
    ///
    /// Returns metadata with no overrides, backed only by the new tables.
    ///
    /// # Errors
    ///
    /// Returns an error if a tree or table cannot be written.
    pub fn persist(&self) -> Result<Meta> {
        if !self.dirty {
            return Ok(self.clone());
        }
        let store = &self.ctx.store;
        let schema_off = if self.schema_ovr.is_empty() {
            self.schema.offset()
        } else {
            Packed::write_merged(store, &self.schema, &self.schema_ovr)?
        };
        let mut saved = Hamt::<Info>::new().mutable();
        for info in self.info_ovr.iter() {
            saved.put(info.save()?);
        }
        let saved = saved.freeze();
        let info_off = Packed::write_merged(store, &self.info, &saved)?;
        debug!(
            schemas = self.schema_ovr.len(),
            infos = saved.len(),
            schema_off,
            info_off,
            "Persisted metadata"
        );
        Self::open(self.ctx.clone(), schema_off, info_off)
    }
}
