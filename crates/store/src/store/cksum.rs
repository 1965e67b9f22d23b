//! Trailing checksums for persisted regions.
//!
//! Every checksummed region ends with the low 32 bits of its XXH3-64 hash,
//! stored big-endian.

use xxhash_rust::xxh3::xxh3_64;

use super::Offset;
use crate::error::{Error, Result};

/// Size of a trailing checksum in bytes.
pub const LEN: usize = 4;

/// Computes the checksum of `data`.
pub fn sum(data: &[u8]) -> u32 {
    xxh3_64(data) as u32
}

/// Appends the checksum of the current contents of `buf`.
pub fn append(buf: &mut Vec<u8>) {
    let ck = sum(buf);
    buf.extend_from_slice(&ck.to_be_bytes());
}

/// Returns true when the last [`LEN`] bytes of `buf` match the rest.
pub fn verify(buf: &[u8]) -> bool {
    if buf.len() < LEN {
        return false;
    }
    let (data, tail) = buf.split_at(buf.len() - LEN);
    let mut stored = [0u8; LEN];
    stored.copy_from_slice(tail);
    sum(data) == u32::from_be_bytes(stored)
}

/// Verifies and removes the trailing checksum.
///
/// # Errors
///
/// Returns [`Error::ChecksumMismatch`] naming `offset` if verification fails.
pub fn strip(mut buf: Vec<u8>, offset: Offset) -> Result<Vec<u8>> {
    if !verify(&buf) {
        return Err(Error::ChecksumMismatch { offset });
    }
    buf.truncate(buf.len() - LEN);
    Ok(buf)
}
