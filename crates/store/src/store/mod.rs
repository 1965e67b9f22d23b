//! Append-only store addressed by stable 64-bit offsets.
//!
//! A store is a single growable byte arena. Regions are allocated once,
//! written once, and never modified afterwards, so any offset handed out
//! stays valid for the life of the store. Offsets below [`HEADER_SIZE`]
//! belong to the header, which makes offset 0 usable as a "none" marker.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────┬──────────────┬──────────────┬─────
//! │ header (16 bytes)      │ region       │ region       │ ...
//! │ magic | version | pad  │              │              │
//! └────────────────────────┴──────────────┴──────────────┴─────
//! ```
//!
//! Sized regions carry a 4-byte big-endian length prefix so they can be
//! read back from their offset alone.

pub mod cksum;
pub mod codec;
mod file;
mod memory;

use std::path::Path;

pub use file::FileBackend;
pub use memory::InMemoryBackend;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Position of a region within the store.
pub type Offset = u64;

/// Largest offset that fits the 5-byte on-disk encoding.
pub const MAX_OFFSET: Offset = (1 << 40) - 1;

/// Size of the store header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Magic bytes identifying an fbdb store file.
pub const STORE_MAGIC: [u8; 8] = *b"FBDBSTOR";

/// Current store format version.
pub const STORE_VERSION: u16 = 1;

/// Size of the length prefix on sized regions.
const SIZE_PREFIX: usize = 4;

/// Chunk size for backward magic scans.
const SCAN_CHUNK: u64 = 64 * 1024;

/// Byte-addressed backing storage for a [`Store`].
///
/// Implementations must allow concurrent `read_at` calls and serialize
/// writes internally.
pub trait StorageBackend: Send + Sync {
    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the bytes cannot be read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` at `offset`, extending the backing storage if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the write fails.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flushes written data to durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the flush fails.
    fn sync(&self) -> Result<()>;

    /// Current length of the backing storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the length cannot be determined.
    fn len(&self) -> Result<u64>;
}

/// Store header written at offset 0.
///
/// | Offset | Size | Field    |
/// |--------|------|----------|
/// | 0      | 8    | magic    |
/// | 8      | 2    | version  |
/// | 10     | 6    | reserved |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    /// Format version.
    pub version: u16,
}

impl StoreHeader {
    /// Header for the current format version.
    pub fn current() -> Self {
        Self { version: STORE_VERSION }
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(&STORE_MAGIC);
        buf[8..10].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    /// Parses and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMagic`] for a foreign file and
    /// [`Error::UnsupportedVersion`] for a newer format.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE || buf[..8] != STORE_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = u16::from_be_bytes([buf[8], buf[9]]);
        if version != STORE_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }
        Ok(Self { version })
    }
}

/// Append-only region allocator over a [`StorageBackend`].
///
/// Allocation is a bump of the end offset under a short mutex; reads and
/// writes of already-allocated regions go straight to the backend.
pub struct Store {
    backend: Box<dyn StorageBackend>,
    /// End of the last allocation.
    next: Mutex<Offset>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("size", &self.size()).finish_non_exhaustive()
    }
}

impl Store {
    /// Creates a new file-backed store, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created.
    pub fn create_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_backend(Box::new(FileBackend::create(path)?))
    }

    /// Opens an existing file-backed store. New allocations start at the
    /// current end of the file, after any trailing garbage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened and
    /// [`Error::InvalidMagic`] if it is not an fbdb store.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_backend(Box::new(FileBackend::open(path)?))
    }

    /// Creates an empty heap-backed store.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(InMemoryBackend::new()),
            next: Mutex::new(HEADER_SIZE as Offset),
        }
    }

    /// Wraps a backend whose header has already been written.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read or is invalid.
    pub fn from_backend(backend: Box<dyn StorageBackend>) -> Result<Self> {
        let len = backend.len()?;
        if len < HEADER_SIZE as u64 {
            return Err(Error::InvalidMagic);
        }
        let mut header = [0u8; HEADER_SIZE];
        backend.read_at(0, &mut header)?;
        StoreHeader::from_bytes(&header)?;
        Ok(Self { backend, next: Mutex::new(len) })
    }

    /// Reserves `n` bytes and returns their offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if the region would end past
    /// [`MAX_OFFSET`].
    pub fn alloc(&self, n: usize) -> Result<Offset> {
        let mut next = self.next.lock();
        let off = *next;
        let end = off + n as u64;
        if end > MAX_OFFSET {
            return Err(Error::OutOfSpace { requested: n });
        }
        *next = end;
        Ok(off)
    }

    /// Fills a region previously returned by [`alloc`](Self::alloc).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the backend write fails.
    pub fn write(&self, off: Offset, data: &[u8]) -> Result<()> {
        assert!(
            off >= HEADER_SIZE as Offset && off + data.len() as u64 <= self.size(),
            "write of {} bytes at {off} outside allocated space",
            data.len()
        );
        self.backend.write_at(off, data)
    }

    /// Allocates and writes `data`, returning its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation or the write fails.
    pub fn save(&self, data: &[u8]) -> Result<Offset> {
        let off = self.alloc(data.len())?;
        self.backend.write_at(off, data)?;
        Ok(off)
    }

    /// Allocates and writes `data` behind a 4-byte length prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation or the write fails.
    pub fn save_sized(&self, data: &[u8]) -> Result<Offset> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::OutOfSpace { requested: data.len() })?;
        let mut buf = Vec::with_capacity(SIZE_PREFIX + data.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(data);
        self.save(&buf)
    }

    /// Reads `len` bytes at `off`.
    ///
    /// # Panics
    ///
    /// Panics if the range lies outside allocated space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the backend read fails.
    pub fn read(&self, off: Offset, len: usize) -> Result<Vec<u8>> {
        let size = self.size();
        assert!(
            off >= HEADER_SIZE as Offset && off + len as u64 <= size,
            "read of {len} bytes at {off} outside store of size {size}"
        );
        let mut buf = vec![0u8; len];
        self.backend.read_at(off, &mut buf)?;
        Ok(buf)
    }

    /// Reads a region written by [`save_sized`](Self::save_sized).
    ///
    /// Offsets and lengths here usually come from disk, so a region that
    /// does not fit the store is reported as corruption rather than a panic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the prefix or the region it describes
    /// lies outside allocated space, or [`Error::Io`] if the backend read
    /// fails.
    pub fn read_sized(&self, off: Offset) -> Result<Vec<u8>> {
        self.check_region(off, SIZE_PREFIX)?;
        let prefix = self.read(off, SIZE_PREFIX)?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        self.check_region(off + SIZE_PREFIX as u64, len)?;
        self.read(off + SIZE_PREFIX as u64, len)
    }

    /// Fails with [`Error::Corrupted`] unless `len` bytes at `off` are
    /// allocated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for a region outside the store.
    pub fn check_region(&self, off: Offset, len: usize) -> Result<()> {
        let size = self.size();
        let fits = off >= HEADER_SIZE as Offset
            && off.checked_add(len as u64).is_some_and(|end| end <= size);
        if fits {
            Ok(())
        } else {
            Err(Error::Corrupted {
                reason: format!("region of {len} bytes at {off} outside store of size {size}"),
            })
        }
    }

    /// Offset one past the last allocated byte.
    pub fn size(&self) -> Offset {
        *self.next.lock()
    }

    /// Flushes everything written so far.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the backend sync fails.
    pub fn sync(&self) -> Result<()> {
        self.backend.sync()
    }

    /// Finds the last occurrence of `magic` that ends at or before `before`.
    ///
    /// Scans backward in fixed-size chunks, overlapping consecutive chunks so
    /// a marker straddling a chunk boundary is still found. Returns the offset
    /// of the first byte of the marker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a backend read fails.
    pub fn last_offset(&self, before: Offset, magic: &[u8]) -> Result<Option<Offset>> {
        assert!(!magic.is_empty(), "empty magic");
        let floor = HEADER_SIZE as Offset;
        let m = magic.len() as u64;
        let mut end = before.min(self.size());
        while end >= floor + m {
            let lo = end.saturating_sub(SCAN_CHUNK).max(floor);
            let mut buf = vec![0u8; (end - lo) as usize];
            self.backend.read_at(lo, &mut buf)?;
            if let Some(pos) = buf.windows(magic.len()).rposition(|w| w == magic) {
                return Ok(Some(lo + pos as u64));
            }
            if lo == floor {
                break;
            }
            end = lo + m - 1;
        }
        Ok(None)
    }
}
