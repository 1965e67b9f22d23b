//! Error types for the fbdb storage engine.

use std::io;

use snafu::Snafu;

use crate::store::Offset;

/// Result type alias for fbdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during fbdb operations.
///
/// Corruption variants ([`Error::is_corruption`]) are never retried or
/// repaired: the operation that hit them is abandoned and the error is
/// surfaced to the caller as-is.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying storage backend.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Stored data is malformed or violates a structural invariant.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// A checksummed region failed verification.
    #[snafu(display("Checksum mismatch at offset {offset}"))]
    ChecksumMismatch {
        /// Store offset of the region whose checksum failed.
        offset: Offset,
    },

    /// Invalid magic bytes in the store header or a checkpoint record.
    #[snafu(display("Invalid magic number"))]
    InvalidMagic,

    /// Unsupported store format version.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The unsupported version number.
        version: u16,
    },

    /// The store has reached the largest addressable offset.
    #[snafu(display("Out of space: cannot allocate {requested} bytes"))]
    OutOfSpace {
        /// Size of the allocation that failed.
        requested: usize,
    },

    /// No table with this name exists.
    #[snafu(display("Table not found: {table}"))]
    TableNotFound {
        /// The missing table name.
        table: String,
    },

    /// A table with this name already exists.
    #[snafu(display("Table already exists: {table}"))]
    TableExists {
        /// The duplicate table name.
        table: String,
    },

    /// Index number out of range for the table.
    #[snafu(display("Table {table} has no index {index}"))]
    IndexNotFound {
        /// The table name.
        table: String,
        /// The requested index number.
        index: usize,
    },

    /// Keys were supplied out of order to an ordered builder.
    #[snafu(display("Key order violation: {reason}"))]
    KeyOrder {
        /// Description of the violation.
        reason: String,
    },

    /// Configuration failed validation.
    #[snafu(display("Invalid configuration: {message}"))]
    Config {
        /// Description of the invalid setting.
        message: String,
    },

    /// The database has been closed or its merge worker has stopped.
    #[snafu(display("Database is closed"))]
    Closed,
}

impl Error {
    /// Returns true for errors that indicate damaged on-disk state.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corrupted { .. } | Error::ChecksumMismatch { .. } | Error::InvalidMagic
        )
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}
