//! Decoder for the SSH length-prefixed type system.

use super::error::{ProtoError, ProtoResult};
use crate::secure::SecureBytes;

/// Cursor over a received byte buffer.
///
/// Every read fails with [`ProtoError::ShortRead`] when the required bytes
/// are absent, including when a declared blob length exceeds the remaining
/// buffer. The `*_secure` variants land their copies in pinned,
/// zero-on-drop storage and exist for passphrases and private key fields.
pub struct Deserializer<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Deserializer<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Whether every byte has been consumed.
    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    /// Current read position from the start of the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, len: usize, what: &'static str) -> ProtoResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtoError::ShortRead(what));
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    /// Read a 32-bit big-endian integer.
    pub fn read_u32(&mut self) -> ProtoResult<u32> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> ProtoResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    fn read_blob_slice(&mut self, what: &'static str) -> ProtoResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, what)
    }

    /// Read a length-prefixed blob.
    pub fn read_blob(&mut self) -> ProtoResult<Vec<u8>> {
        Ok(self.read_blob_slice("blob")?.to_vec())
    }

    /// Skip over a length-prefixed blob without copying it.
    pub fn discard_blob(&mut self) -> ProtoResult<()> {
        self.read_blob_slice("blob")?;
        Ok(())
    }

    /// Read a blob into pinned, zero-on-drop storage.
    pub fn read_blob_secure(&mut self) -> ProtoResult<SecureBytes> {
        Ok(SecureBytes::from_slice(self.read_blob_slice("blob")?))
    }

    /// Read a string. The payload must be valid UTF-8.
    pub fn read_string(&mut self) -> ProtoResult<String> {
        let bytes = self.read_blob_slice("string")?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtoError::bad_format("string is not valid utf-8"))
    }

    fn strip_mpint_pad(bytes: &[u8]) -> &[u8] {
        // A single leading zero is only present to keep the top bit clear.
        if bytes.len() > 1 && bytes[0] == 0x00 && bytes[1] & 0x80 != 0 {
            &bytes[1..]
        } else {
            bytes
        }
    }

    /// Read a non-negative multi-precision integer, returning its
    /// big-endian magnitude with the sign-padding byte stripped.
    pub fn read_mpint(&mut self) -> ProtoResult<Vec<u8>> {
        let bytes = self.read_blob_slice("mpint")?;
        Ok(Self::strip_mpint_pad(bytes).to_vec())
    }

    /// [`read_mpint`](Self::read_mpint) into pinned storage.
    pub fn read_mpint_secure(&mut self) -> ProtoResult<SecureBytes> {
        let bytes = self.read_blob_slice("mpint")?;
        Ok(SecureBytes::from_slice(Self::strip_mpint_pad(bytes)))
    }

    /// Borrow the raw bytes in `[start, end)`.
    ///
    /// Used to capture the span a key-type skipper walked over, so the key
    /// material can be handed to a factory without re-parsing.
    pub fn slice(&self, start: usize, end: usize) -> ProtoResult<&'a [u8]> {
        if start > end || end > self.data.len() {
            return Err(ProtoError::bad_format("slice range out of bounds"));
        }
        Ok(&self.data[start..end])
    }

    /// [`slice`](Self::slice) copied into pinned storage.
    pub fn slice_secure(&self, start: usize, end: usize) -> ProtoResult<SecureBytes> {
        Ok(SecureBytes::from_slice(self.slice(start, end)?))
    }

    /// Borrow everything left unread, consuming it.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let out = &self.data[self.offset..];
        self.offset = self.data.len();
        out
    }
}

impl std::fmt::Debug for Deserializer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Deserializer(offset {} of {})",
            self.offset,
            self.data.len()
        )
    }
}
