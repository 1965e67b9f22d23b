//! Simulated crash damage for recovery tests.
//!
//! A crash of an append-only store can leave two kinds of damage past the
//! last durable point: bytes that were appended but never referenced, and
//! a record that was only partly written. These helpers produce both on a
//! closed database file.

#![allow(clippy::expect_used)]

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

/// Appends `len` bytes of a repeating pattern, as left by writes that were
/// in flight when the process died.
///
/// # Panics
///
/// Panics on I/O errors.
pub fn append_garbage(path: &Path, len: usize) {
    let mut file = OpenOptions::new().append(true).open(path).expect("open for append");
    let garbage: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(7)).collect();
    file.write_all(&garbage).expect("append garbage");
    file.sync_all().expect("sync");
}

/// Cuts the last `len` bytes off the file, as if the final write was torn.
///
/// # Panics
///
/// Panics on I/O errors or if the file is shorter than `len`.
pub fn truncate_tail(path: &Path, len: u64) {
    let file = OpenOptions::new().write(true).open(path).expect("open for truncate");
    let size = file.metadata().expect("metadata").len();
    assert!(size >= len, "file of {size} bytes is shorter than {len}");
    file.set_len(size - len).expect("truncate");
    file.sync_all().expect("sync");
}

/// Inverts every bit of the byte at `offset`.
///
/// # Panics
///
/// Panics on I/O errors.
pub fn flip_byte_at(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).expect("open");
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.read_exact(&mut byte).expect("read");
    byte[0] = !byte[0];
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(&byte).expect("write");
    file.sync_all().expect("sync");
}

/// Size of the file in bytes.
///
/// # Panics
///
/// Panics if the file cannot be inspected.
pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).expect("metadata").len()
}
