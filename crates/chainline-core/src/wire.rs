//! Fixed-capacity wire buffer for the signaling micro-format.
//!
//! Every message field on the wire is packed with [`WireBuf`]: a byte
//! buffer of fixed capacity with a single cursor shared by sequential
//! reads and writes. Short strings are prefixed by an explicit `u8`
//! length field, ciphertext blobs by a `u16` one; the prefix is written
//! and read by the caller, never embedded implicitly. Multi-byte
//! integers are little-endian, matching the ledger runtime.
//!
//! Buffers are independent: a bounds violation fails the operation on
//! this buffer and nothing else.

use bytes::Bytes;
use thiserror::Error;

/// Errors from wire buffer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A write would exceed capacity, or a read would run past the bytes
    /// actually present. Indicates a framing bug; not retried.
    #[error("access of {requested} bytes at offset {cursor} exceeds bound {bound}")]
    Bounds {
        cursor: usize,
        requested: usize,
        bound: usize,
    },
    /// String bytes were not valid UTF-8.
    #[error("string field is not valid utf-8")]
    Utf8,
}

/// A fixed-capacity byte buffer with one read/write cursor.
#[derive(Debug, Clone)]
pub struct WireBuf {
    buf: Vec<u8>,
    cap: usize,
    cursor: usize,
}

impl WireBuf {
    /// An empty buffer for writing. `cap` is a hard upper bound.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            cap,
            cursor: 0,
        }
    }

    /// Wrap existing bytes for reading.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let buf = bytes.as_ref().to_vec();
        let cap = buf.len();
        Self {
            buf,
            cap,
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// The bytes written so far, truncated to the actual length.
    pub fn written(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the buffer, yielding the written bytes.
    pub fn into_written(self) -> Bytes {
        Bytes::from(self.buf)
    }

    fn check_write(&self, n: usize) -> Result<(), WireError> {
        if self.cursor + n > self.cap {
            return Err(WireError::Bounds {
                cursor: self.cursor,
                requested: n,
                bound: self.cap,
            });
        }
        Ok(())
    }

    fn check_read(&self, n: usize) -> Result<(), WireError> {
        if self.cursor + n > self.buf.len() {
            return Err(WireError::Bounds {
                cursor: self.cursor,
                requested: n,
                bound: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), WireError> {
        self.check_write(1)?;
        self.buf.push(v);
        self.cursor += 1;
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), WireError> {
        self.check_write(2)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.cursor += 2;
        Ok(())
    }

    /// UTF-8 bytes of `s`, no length prefix; the caller writes the
    /// preceding length field.
    pub fn put_str(&mut self, s: &str) -> Result<(), WireError> {
        self.put_bytes(s.as_bytes())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.check_write(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        self.cursor += bytes.len();
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        self.check_read(1)?;
        let v = self.buf[self.cursor];
        self.cursor += 1;
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        self.check_read(2)?;
        let v = u16::from_le_bytes([self.buf[self.cursor], self.buf[self.cursor + 1]]);
        self.cursor += 2;
        Ok(v)
    }

    /// Decode exactly `len` bytes as UTF-8.
    pub fn get_str(&mut self, len: usize) -> Result<String, WireError> {
        let bytes = self.get_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| WireError::Utf8)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, WireError> {
        self.check_read(len)?;
        let out = self.buf[self.cursor..self.cursor + len].to_vec();
        self.cursor += len;
        Ok(out)
    }
}
