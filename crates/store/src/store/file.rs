//! File-backed store using position-based I/O (`pread`/`pwrite`).
//!
//! Reads never take a lock: on Unix `read_exact_at()` takes `&self` and does
//! not touch the file cursor. Writes go through a unit mutex so concurrent
//! appends cannot interleave a file extension with a positional write.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use super::{StorageBackend, StoreHeader};
use crate::error::Result;

/// File-backed storage.
///
/// Nothing is durable until [`sync`](StorageBackend::sync) returns. The
/// checkpoint protocol syncs after writing each checkpoint record.
pub struct FileBackend {
    file: File,
    /// Serializes positional writes.
    write_lock: Mutex<()>,
    path: PathBuf,
}

impl FileBackend {
    /// Opens an existing store file.
    ///
    /// The header is validated by [`Store`](super::Store), not here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Ok(Self { file, write_lock: Mutex::new(()), path: path.as_ref().to_path_buf() })
    }

    /// Creates a new store file, truncating any existing one, and writes
    /// the header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be created
    /// or written.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        // Exclusively owned at this point, so plain sequential writes are fine.
        file.write_all(&StoreHeader::current().to_bytes())?;
        file.sync_all()?;

        Ok(Self { file, write_lock: Mutex::new(()), path: path.as_ref().to_path_buf() })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at_offset(&self.file, buf, offset)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        write_all_at_offset(&self.file, data, offset)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Reads exactly `buf.len()` bytes at `offset` via `pread(2)`.
#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// Windows fallback: `seek_read` moves the file cursor, so concurrent
/// readers need external synchronization.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

/// Writes all of `data` at `offset` via `pwrite(2)`, extending the file.
#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
