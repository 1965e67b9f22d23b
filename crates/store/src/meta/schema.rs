//! Table schemas: columns, indexes and foreign keys.

use crate::{
    error::{Error, Result},
    fbtree::IxSpec,
    hamt::HamtItem,
    packed::PackedItem,
    store::codec::{Reader, Writer},
};

/// A named column and the record field it is stored in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Field number within a record.
    pub field: u16,
}

impl ColumnSchema {
    /// Creates a column.
    pub fn new(name: impl Into<String>, field: u16) -> Self {
        Self { name: name.into(), field }
    }
}

/// Index kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// A key: values are unique and may identify rows.
    Key,
    /// A plain, non-unique index.
    Index,
    /// Unique among non-empty values.
    Unique,
}

impl IndexMode {
    fn to_byte(self) -> u8 {
        match self {
            IndexMode::Key => b'k',
            IndexMode::Index => b'i',
            IndexMode::Unique => b'u',
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'k' => Ok(IndexMode::Key),
            b'i' => Ok(IndexMode::Index),
            b'u' => Ok(IndexMode::Unique),
            _ => Err(Error::Corrupted { reason: format!("unknown index mode {b:#04x}") }),
        }
    }
}

/// Reference from an index to another table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Target table.
    pub table: String,
    /// Combination of the mode bits below.
    pub mode: u8,
    /// Target fields, when they differ from the index fields.
    pub fields: Vec<i16>,
}

impl ForeignKey {
    /// Reject changes that would leave dangling references.
    pub const BLOCK: u8 = 0;
    /// Propagate key updates to referencing rows.
    pub const CASCADE_UPDATES: u8 = 1;
    /// Delete referencing rows along with the target.
    pub const CASCADE_DELETES: u8 = 2;
    /// Both cascades.
    pub const CASCADE: u8 = Self::CASCADE_UPDATES | Self::CASCADE_DELETES;
}

/// One index of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    /// Indexed fields; negative numbers denote computed fields.
    pub fields: Vec<i16>,
    /// Index kind.
    pub mode: IndexMode,
    /// Optional foreign key.
    pub fk: Option<ForeignKey>,
}

impl IndexSchema {
    /// A key on `fields`.
    pub fn key(fields: impl Into<Vec<i16>>) -> Self {
        Self { fields: fields.into(), mode: IndexMode::Key, fk: None }
    }

    /// A plain index on `fields`.
    pub fn index(fields: impl Into<Vec<i16>>) -> Self {
        Self { fields: fields.into(), mode: IndexMode::Index, fk: None }
    }

    /// A unique index on `fields`.
    pub fn unique(fields: impl Into<Vec<i16>>) -> Self {
        Self { fields: fields.into(), mode: IndexMode::Unique, fk: None }
    }

    /// Adds a foreign key.
    pub fn with_fk(mut self, table: impl Into<String>, mode: u8, fields: Vec<i16>) -> Self {
        self.fk = Some(ForeignKey { table: table.into(), mode, fields });
        self
    }

    fn usable_key(&self) -> bool {
        self.mode == IndexMode::Key
            && !self.fields.is_empty()
            && self.fields.iter().all(|&f| f >= 0)
    }
}

/// Column and index definitions of a table.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct Schema {
    /// Table name.
    #[builder(into)]
    pub table: String,
    /// Columns.
    #[builder(default)]
    pub columns: Vec<ColumnSchema>,
    /// Indexes; a table needs at least one to hold rows.
    #[builder(default)]
    pub indexes: Vec<IndexSchema>,
}

impl Schema {
    /// Key fields used to make non-key indexes unique: the fields of the
    /// first shortest usable key.
    fn shortest_key(&self) -> &[i16] {
        let mut key: Option<&[i16]> = None;
        for ix in self.indexes.iter().filter(|ix| ix.usable_key()) {
            if key.is_none_or(|k| ix.fields.len() < k.len()) {
                key = Some(&ix.fields);
            }
        }
        key.unwrap_or_default()
    }

    /// Derives the key projection of each index.
    ///
    /// Keys use their own fields. Plain indexes append the shortest key so
    /// every entry is unique. Unique indexes fall back to the shortest key
    /// only when their own fields are empty.
    pub fn ixspecs(&self) -> Vec<IxSpec> {
        let key = self.shortest_key();
        self.indexes
            .iter()
            .map(|ix| match ix.mode {
                IndexMode::Key => IxSpec { fields: ix.fields.clone(), fields2: Vec::new() },
                IndexMode::Unique => IxSpec { fields: ix.fields.clone(), fields2: key.to_vec() },
                IndexMode::Index => IxSpec {
                    fields: ix.fields.iter().chain(key).copied().collect(),
                    fields2: Vec::new(),
                },
            })
            .collect()
    }
}

impl HamtItem for Schema {
    type Key = String;

    fn key(&self) -> &String {
        &self.table
    }
}

impl PackedItem for Schema {
    type Ctx = ();

    fn write_body(&self, w: &mut Writer) {
        w.put2(self.columns.len());
        for col in &self.columns {
            w.put2(usize::from(col.field)).put_str(&col.name);
        }
        w.put1(self.indexes.len());
        for ix in &self.indexes {
            w.put1(usize::from(ix.mode.to_byte())).put_ints(&ix.fields);
            match &ix.fk {
                Some(fk) => w.put_str(&fk.table).put1(usize::from(fk.mode)).put_ints(&fk.fields),
                None => w.put_str("").put1(0).put_ints(&[]),
            };
        }
    }

    fn read_body(table: String, r: &mut Reader<'_>, _ctx: &()) -> Result<Self> {
        let ncols = r.get2();
        let mut columns = Vec::with_capacity(ncols);
        for _ in 0..ncols {
            let field = r.get2() as u16;
            columns.push(ColumnSchema { field, name: r.get_str()? });
        }
        let nidx = r.get1();
        let mut indexes = Vec::with_capacity(nidx);
        for _ in 0..nidx {
            let mode = IndexMode::from_byte(r.get1() as u8)?;
            let fields = r.get_ints();
            let fktable = r.get_str()?;
            let fkmode = r.get1() as u8;
            let fkfields = r.get_ints();
            let fk = (!fktable.is_empty())
                .then(|| ForeignKey { table: fktable, mode: fkmode, fields: fkfields });
            indexes.push(IndexSchema { fields, mode, fk });
        }
        Ok(Self { table, columns, indexes })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{packed::Packed, store::Store};

    fn customers() -> Schema {
        Schema::builder()
            .table("customers")
            .columns(vec![
                ColumnSchema::new("id", 0),
                ColumnSchema::new("name", 1),
                ColumnSchema::new("city", 2),
            ])
            .indexes(vec![
                IndexSchema::key([0, 1]),
                IndexSchema::key([0]),
                IndexSchema::index([2]),
                IndexSchema::unique([1]).with_fk("names", ForeignKey::CASCADE, vec![]),
            ])
            .build()
    }

    #[test]
    fn test_ixspecs_use_shortest_key() {
        let specs = customers().ixspecs();
        assert_eq!(specs[0], IxSpec { fields: vec![0, 1], fields2: vec![] });
        assert_eq!(specs[1], IxSpec { fields: vec![0], fields2: vec![] });
        assert_eq!(specs[2], IxSpec { fields: vec![2, 0], fields2: vec![] });
        assert_eq!(specs[3], IxSpec { fields: vec![1], fields2: vec![0] });
    }

    #[test]
    fn test_computed_fields_are_not_usable_keys() {
        let schema = Schema::builder()
            .table("t")
            .indexes(vec![IndexSchema::key([-1]), IndexSchema::index([3])])
            .build();
        assert_eq!(schema.ixspecs()[1].fields, vec![3]);
    }

    #[test]
    fn test_packed_round_trip() {
        let store = Store::in_memory();
        let schemas = vec![customers(), Schema::builder().table("empty").build()];
        let off = Packed::write(&store, &schemas).unwrap();
        let p = Packed::<Schema>::open(&store, off, ()).unwrap();
        assert_eq!(p.get("customers").unwrap(), Some(customers()));
        assert_eq!(p.get("empty").unwrap().unwrap().indexes.len(), 0);
    }

    #[test]
    fn test_bad_mode_is_corruption() {
        let mut w = Writer::new();
        w.put2(0).put1(1).put1(usize::from(b'z')).put_ints(&[1]).put_str("").put1(0).put_ints(&[]);
        let err = Schema::read_body("t".into(), &mut Reader::new(w.as_bytes()), &()).unwrap_err();
        assert!(err.is_corruption());
    }
}
