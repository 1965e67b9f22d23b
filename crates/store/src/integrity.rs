//! Whole-database consistency check.
//!
//! Walks every index of every table in the current state. Structural damage
//! inside a tree (bad checksums, keys out of order, keys that do not match
//! their records) aborts the check with a corruption error, since nothing
//! below a damaged node can be trusted. Disagreements *between* trees and
//! counters are collected into a [`CheckReport`] instead.

use crate::{
    Database,
    error::{Error, Result},
    store::Offset,
};

/// Result of [`IntegrityChecker::check_all`].
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Number of tables checked.
    pub tables_checked: u64,
    /// Number of indexes checked.
    pub indexes_checked: u64,
    /// Sum of the row counts of all tables.
    pub rows_seen: u64,
    /// Inconsistencies found.
    pub errors: Vec<CheckError>,
}

impl CheckReport {
    /// Returns true if no inconsistencies were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A single inconsistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckError {
    /// Table the problem was found in.
    pub table: String,
    /// Index number, if the problem is specific to one index.
    pub index: Option<usize>,
    /// Human-readable description.
    pub description: String,
}

/// Entries and a fingerprint of the record offsets of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Coverage {
    count: usize,
    sum: Offset,
}

/// Consistency checker for a database.
pub struct IntegrityChecker<'a> {
    db: &'a Database,
}

impl<'a> IntegrityChecker<'a> {
    /// Creates a checker for the given database.
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Checks every table in the currently published state.
    ///
    /// Per table, every index must hold exactly `nrows` entries and all
    /// indexes must refer to the same records.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if a tree is structurally damaged or a
    /// table has a schema but no info.
    pub fn check_all(&self) -> Result<CheckReport> {
        let state = self.db.state();
        let mut report = CheckReport::default();
        for table in state.meta.tables()? {
            let info = state.meta.get_ro_info(&table)?.ok_or_else(|| Error::Corrupted {
                reason: format!("table {table} has a schema but no info"),
            })?;
            report.tables_checked += 1;
            report.rows_seen += info.nrows;

            let mut first: Option<Coverage> = None;
            for (i, ov) in info.indexes.iter().enumerate() {
                let mut sum: Offset = 0;
                let stats = ov.check(|off| sum = sum.wrapping_add(off))?;
                report.indexes_checked += 1;
                let cov = Coverage { count: stats.count, sum };

                if cov.count as u64 != info.nrows {
                    report.errors.push(CheckError {
                        table: table.clone(),
                        index: Some(i),
                        description: format!(
                            "index has {} entries but table has {} rows",
                            cov.count, info.nrows
                        ),
                    });
                }
                match first {
                    None => first = Some(cov),
                    Some(f) if f != cov => report.errors.push(CheckError {
                        table: table.clone(),
                        index: Some(i),
                        description: "index does not cover the same records as index 0".into(),
                    }),
                    Some(_) => {},
                }
            }
        }
        if !report.is_ok() {
            tracing::warn!(errors = report.errors.len(), "Integrity check found problems");
        }
        Ok(report)
    }
}
