//! Bounded encoder for the SSH length-prefixed type system.

use zeroize::Zeroizing;

use super::error::{ProtoError, ProtoResult};
use super::MAX_FRAME_SIZE;
use crate::secure::SecureBytes;

/// Encoder for SSH primitive types.
///
/// All writes are bounded: any operation that would grow the buffer beyond
/// [`MAX_FRAME_SIZE`] fails with [`ProtoError::TooLarge`]. The backing
/// storage is zeroed on drop because serialized messages routinely carry
/// private key material or passphrases.
///
/// Framed messages reserve four bytes up front (`write_u32(0)`) and call
/// [`finalize`](Self::finalize) once the body is complete; `finalize`
/// back-patches bytes `[0..4)` with `total length - 4`.
#[derive(Default)]
pub struct Serializer {
    data: Zeroizing<Vec<u8>>,
}

impl Serializer {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_room(&self, extra: usize) -> ProtoResult<()> {
        if self.data.len() + extra > MAX_FRAME_SIZE {
            return Err(ProtoError::TooLarge);
        }
        Ok(())
    }

    /// Append a 32-bit big-endian integer.
    pub fn write_u32(&mut self, value: u32) -> ProtoResult<()> {
        self.ensure_room(4)?;
        self.data.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Overwrite four bytes at `at` with a 32-bit big-endian integer.
    pub fn write_u32_at(&mut self, value: u32, at: usize) -> ProtoResult<()> {
        if at + 4 > self.data.len() {
            return Err(ProtoError::bad_format("u32 write offset out of range"));
        }
        self.data[at..at + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Append a single byte.
    pub fn write_byte(&mut self, byte: u8) -> ProtoResult<()> {
        self.ensure_room(1)?;
        self.data.push(byte);
        Ok(())
    }

    /// Overwrite the byte at `at`.
    pub fn write_byte_at(&mut self, byte: u8, at: usize) -> ProtoResult<()> {
        if at >= self.data.len() {
            return Err(ProtoError::bad_format("byte write offset out of range"));
        }
        self.data[at] = byte;
        Ok(())
    }

    /// Append raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) -> ProtoResult<()> {
        self.ensure_room(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append a length-prefixed blob.
    pub fn write_blob(&mut self, blob: &[u8]) -> ProtoResult<()> {
        self.ensure_room(4 + blob.len())?;
        self.write_u32(blob.len() as u32)?;
        self.data.extend_from_slice(blob);
        Ok(())
    }

    /// Append a string (a blob whose payload is the UTF-8 bytes).
    pub fn write_string(&mut self, s: &str) -> ProtoResult<()> {
        self.write_blob(s.as_bytes())
    }

    /// Append a non-negative multi-precision integer.
    ///
    /// `magnitude` is the big-endian magnitude without leading zeros. A
    /// `0x00` byte is prepended when the top bit of the first byte is set,
    /// so the value cannot be misread as negative. An empty magnitude
    /// encodes as a zero-length blob.
    pub fn write_mpint(&mut self, magnitude: &[u8]) -> ProtoResult<()> {
        if magnitude.is_empty() {
            return self.write_u32(0);
        }
        let pad = magnitude[0] & 0x80 != 0;
        let len = magnitude.len() + usize::from(pad);
        self.ensure_room(4 + len)?;
        self.write_u32(len as u32)?;
        if pad {
            self.data.push(0x00);
        }
        self.data.extend_from_slice(magnitude);
        Ok(())
    }

    /// Rewrite bytes `[0..4)` with the length of everything that follows.
    pub fn finalize(&mut self) -> ProtoResult<()> {
        if self.data.len() < 4 {
            return Err(ProtoError::bad_format("nothing to finalize"));
        }
        let len = (self.data.len() - 4) as u32;
        self.write_u32_at(len, 0)
    }

    /// Number of bytes encoded so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been encoded yet.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the encoder, returning the buffer.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut *self.data)
    }

    /// Consume the encoder, moving the buffer into pinned storage.
    pub fn into_secure(mut self) -> SecureBytes {
        SecureBytes::new(std::mem::take(&mut *self.data))
    }
}

impl std::fmt::Debug for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serializer({} bytes)", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_append_and_overwrite() {
        let mut s = Serializer::new();
        s.write_u32(0x12345678).unwrap();
        assert_eq!(s.as_bytes(), &[0x12, 0x34, 0x56, 0x78]);

        s.write_u32_at(0xAABBCCDD, 0).unwrap();
        assert_eq!(s.as_bytes(), &[0xAA, 0xBB, 0xCC, 0xDD]);

        assert!(matches!(
            s.write_u32_at(0xDEADBEEF, 100),
            Err(ProtoError::BadFormat(_))
        ));
    }

    #[test]
    fn byte_append_and_overwrite() {
        let mut s = Serializer::new();
        s.write_byte(0x42).unwrap();
        s.write_byte(0x99).unwrap();
        s.write_byte_at(0x77, 0).unwrap();
        assert_eq!(s.as_bytes(), &[0x77, 0x99]);
        assert!(matches!(
            s.write_byte_at(0xFF, 10),
            Err(ProtoError::BadFormat(_))
        ));
    }

    #[test]
    fn blob_roundtrip_layout() {
        let mut s = Serializer::new();
        s.write_blob(b"hello").unwrap();
        assert_eq!(s.as_bytes(), b"\x00\x00\x00\x05hello");
    }

    #[test]
    fn blob_enforces_frame_budget() {
        let mut s = Serializer::new();
        let big = vec![0xFF; MAX_FRAME_SIZE + 1];
        assert!(matches!(s.write_blob(&big), Err(ProtoError::TooLarge)));

        // A blob that fits exactly (payload + 4-byte prefix) is accepted.
        let mut s = Serializer::new();
        let exact = vec![0xAB; MAX_FRAME_SIZE - 4];
        s.write_blob(&exact).unwrap();
        assert_eq!(s.len(), MAX_FRAME_SIZE);
        assert!(matches!(s.write_byte(0x00), Err(ProtoError::TooLarge)));
    }

    #[test]
    fn mpint_empty_is_four_zero_bytes() {
        let mut s = Serializer::new();
        s.write_mpint(&[]).unwrap();
        assert_eq!(s.as_bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn mpint_pads_high_bit() {
        let mut s = Serializer::new();
        s.write_mpint(&[0x80, 0x01]).unwrap();
        assert_eq!(s.as_bytes(), &[0, 0, 0, 3, 0x00, 0x80, 0x01]);

        let mut s = Serializer::new();
        s.write_mpint(&[0x7F, 0x01]).unwrap();
        assert_eq!(s.as_bytes(), &[0, 0, 0, 2, 0x7F, 0x01]);
    }

    #[test]
    fn finalize_back_patches_outer_length() {
        let mut s = Serializer::new();
        s.write_u32(0).unwrap();
        s.write_byte(0x11).unwrap();
        s.write_byte(0x22).unwrap();
        s.finalize().unwrap();
        assert_eq!(s.as_bytes(), &[0, 0, 0, 2, 0x11, 0x22]);

        let mut empty = Serializer::new();
        assert!(matches!(empty.finalize(), Err(ProtoError::BadFormat(_))));
    }
}
