//! Per-table counters and index roots.

use crate::{
    error::{Error, Result},
    fbtree::{Fbtree, IxSpec, TreeContext},
    hamt::HamtItem,
    overlay::Overlay,
    packed::PackedItem,
    store::codec::{Reader, Writer},
};

/// Frequently changing state of a table, kept apart from its [`Schema`]
/// so that row counts can change without rewriting the schema.
///
/// Inside an update transaction an `Info` doubles as a delta: its counters
/// start at zero and its indexes carry private layers.
///
/// [`Schema`]: super::Schema
#[derive(Debug, Clone)]
pub struct Info {
    /// Table name.
    pub table: String,
    /// Number of rows.
    pub nrows: u64,
    /// Total bytes of row data.
    pub size: u64,
    /// One index per [`IndexSchema`](super::IndexSchema), in schema order.
    pub indexes: Vec<Overlay>,
}

impl Info {
    /// Info for a new, empty table.
    pub fn create(table: impl Into<String>, ctx: &TreeContext, ixspecs: Vec<IxSpec>) -> Self {
        Self {
            table: table.into(),
            nrows: 0,
            size: 0,
            indexes: ixspecs.into_iter().map(|is| Overlay::create(ctx.clone(), is)).collect(),
        }
    }

    /// A zeroed delta over this table's current indexes.
    pub fn delta(&self) -> Self {
        Self {
            table: self.table.clone(),
            nrows: 0,
            size: 0,
            indexes: self.indexes.iter().map(Overlay::mutable).collect(),
        }
    }

    /// Attaches the key projections the schema defines.
    pub(crate) fn set_ixspecs(&mut self, ixspecs: Vec<IxSpec>) {
        for (ov, is) in self.indexes.iter_mut().zip(ixspecs) {
            ov.set_ixspec(is);
        }
    }

    /// Adds a committed delta: counters are summed and each index layer is
    /// folded into the corresponding index tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the delta has a different number of
    /// indexes, or an error from merging an index.
    pub fn merge(&self, delta: &Info) -> Result<Info> {
        if delta.indexes.len() != self.indexes.len() {
            return Err(Error::Corrupted {
                reason: format!(
                    "table {} has {} indexes but delta has {}",
                    self.table,
                    self.indexes.len(),
                    delta.indexes.len()
                ),
            });
        }
        let indexes = self
            .indexes
            .iter()
            .zip(&delta.indexes)
            .map(|(ov, d)| match d.layer() {
                Some(layer) => ov.merge(layer),
                None => Ok(ov.clone()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Info {
            table: self.table.clone(),
            nrows: self.nrows + delta.nrows,
            size: self.size + delta.size,
            indexes,
        })
    }

    /// Returns true if any index tree has unsaved nodes.
    pub fn is_dirty(&self) -> bool {
        self.indexes.iter().any(Overlay::is_dirty)
    }

    /// Saves every index tree.
    ///
    /// # Errors
    ///
    /// Returns an error if a tree cannot be written.
    pub fn save(&self) -> Result<Info> {
        let indexes = self.indexes.iter().map(Overlay::save).collect::<Result<Vec<_>>>()?;
        Ok(Info { indexes, ..self.clone() })
    }
}

impl HamtItem for Info {
    type Key = String;

    fn key(&self) -> &String {
        &self.table
    }
}

impl PackedItem for Info {
    type Ctx = TreeContext;

    /// # Panics
    ///
    /// Panics if an index tree has unsaved nodes.
    fn write_body(&self, w: &mut Writer) {
        w.put5(self.nrows).put5(self.size).put1(self.indexes.len());
        for ov in &self.indexes {
            let tree = ov.base();
            assert!(!tree.is_dirty(), "table {} has an unsaved index", self.table);
            w.put5(tree.root()).put1(tree.tree_levels()).put5(tree.redirs_off());
        }
    }

    fn read_body(table: String, r: &mut Reader<'_>, ctx: &TreeContext) -> Result<Self> {
        let nrows = r.get5();
        let size = r.get5();
        let n = r.get1();
        let mut indexes = Vec::with_capacity(n);
        for _ in 0..n {
            let root = r.get5();
            let levels = r.get1();
            let redirs = r.get5();
            let tree = Fbtree::open(ctx.clone(), IxSpec::default(), root, levels, redirs)?;
            indexes.push(Overlay::new(tree));
        }
        Ok(Self { table, nrows, size, indexes })
    }
}
