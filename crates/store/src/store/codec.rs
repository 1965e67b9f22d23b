//! Binary encode/decode helpers for store regions.
//!
//! Fixed-width integers are big-endian and sized 1 to 5 bytes, so offsets
//! (at most 40 bits) take five bytes and small counts take one or two.
//! Writing a value that does not fit its width is a caller bug and panics.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Growable encoder for a region that will be written to the store.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with room for `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    fn put_uint(&mut self, n: u64, nbytes: usize) -> &mut Self {
        assert!(
            nbytes == 8 || n < (1u64 << (8 * nbytes)),
            "value {n} does not fit in {nbytes} bytes"
        );
        let mut tmp = [0u8; 8];
        BigEndian::write_uint(&mut tmp, n, nbytes);
        self.buf.extend_from_slice(&tmp[..nbytes]);
        self
    }

    /// Appends a one byte value.
    pub fn put1(&mut self, n: usize) -> &mut Self {
        self.put_uint(n as u64, 1)
    }

    /// Appends a two byte value.
    pub fn put2(&mut self, n: usize) -> &mut Self {
        assert!(n <= u16::MAX as usize, "value {n} does not fit in 2 bytes");
        let mut tmp = [0u8; 2];
        BigEndian::write_u16(&mut tmp, n as u16);
        self.buf.extend_from_slice(&tmp);
        self
    }

    /// Appends a three byte value.
    pub fn put3(&mut self, n: usize) -> &mut Self {
        self.put_uint(n as u64, 3)
    }

    /// Appends a four byte value.
    pub fn put4(&mut self, n: u64) -> &mut Self {
        assert!(n <= u32::MAX as u64, "value {n} does not fit in 4 bytes");
        let mut tmp = [0u8; 4];
        BigEndian::write_u32(&mut tmp, n as u32);
        self.buf.extend_from_slice(&tmp);
        self
    }

    /// Appends a five byte value, the width used for store offsets.
    pub fn put5(&mut self, n: u64) -> &mut Self {
        self.put_uint(n, 5)
    }

    /// Appends a LEB128 variable-length integer.
    pub fn put_uvarint(&mut self, mut n: u64) -> &mut Self {
        while n >= 0x80 {
            self.buf.push((n as u8) | 0x80);
            n >>= 7;
        }
        self.buf.push(n as u8);
        self
    }

    /// Appends a byte string as `[len:2][bytes]`.
    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.put2(b.len());
        self.buf.extend_from_slice(b);
        self
    }

    /// Appends a string as `[len:2][utf8]`.
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put_bytes(s.as_bytes())
    }

    /// Appends a short list of small integers as `[n:1][i16...]`.
    pub fn put_ints(&mut self, ints: &[i16]) -> &mut Self {
        self.put1(ints.len());
        for &i in ints {
            self.put2(i as u16 as usize);
        }
        self
    }

    /// Appends raw bytes.
    pub fn put_raw(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// Overwrites a previously written three byte value at `pos`.
    pub fn patch3(&mut self, pos: usize, n: usize) {
        assert!(n < (1 << 24), "value {n} does not fit in 3 bytes");
        BigEndian::write_uint(&mut self.buf[pos..pos + 3], n as u64, 3);
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer, returning the encoded bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded region.
///
/// Reading past the end panics; regions are checksum-verified before they
/// are decoded, so a short read means a caller bug rather than bad data.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let b = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        b
    }

    /// Reads a one byte value.
    pub fn get1(&mut self) -> usize {
        self.take(1)[0] as usize
    }

    /// Reads a two byte value.
    pub fn get2(&mut self) -> usize {
        BigEndian::read_u16(self.take(2)) as usize
    }

    /// Reads a three byte value.
    pub fn get3(&mut self) -> usize {
        BigEndian::read_uint(self.take(3), 3) as usize
    }

    /// Reads a four byte value.
    pub fn get4(&mut self) -> u64 {
        u64::from(BigEndian::read_u32(self.take(4)))
    }

    /// Reads a five byte value.
    pub fn get5(&mut self) -> u64 {
        BigEndian::read_uint(self.take(5), 5)
    }

    /// Reads a LEB128 variable-length integer.
    pub fn get_uvarint(&mut self) -> u64 {
        let mut n = 0u64;
        let mut shift = 0;
        loop {
            let b = self.take(1)[0];
            n |= u64::from(b & 0x7f) << shift;
            if b < 0x80 {
                return n;
            }
            shift += 7;
        }
    }

    /// Reads a `[len:2][bytes]` byte string.
    pub fn get_bytes(&mut self) -> &'a [u8] {
        let n = self.get2();
        self.take(n)
    }

    /// Reads a `[len:2][utf8]` string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the bytes are not valid UTF-8.
    pub fn get_str(&mut self) -> Result<String> {
        let b = self.get_bytes();
        String::from_utf8(b.to_vec())
            .map_err(|e| Error::Corrupted { reason: format!("invalid string: {e}") })
    }

    /// Reads a `[n:1][i16...]` integer list.
    pub fn get_ints(&mut self) -> Vec<i16> {
        let n = self.get1();
        (0..n).map(|_| self.get2() as u16 as i16).collect()
    }

    /// Reads `n` raw bytes.
    pub fn get_raw(&mut self, n: usize) -> &'a [u8] {
        self.take(n)
    }

    /// Current position within the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Moves the cursor to `pos`.
    pub fn seek(&mut self, pos: usize) {
        assert!(pos <= self.buf.len(), "seek past end of region");
        self.pos = pos;
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
