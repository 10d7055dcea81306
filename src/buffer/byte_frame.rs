//! # ByteFrame
//!
//! Growable byte buffer with position/limit/capacity cursor discipline.
//!
//! The invariant `position <= limit <= capacity` holds at all times.
//! Writing past the end of storage grows it by at least 1.5x, so `put_*`
//! never fails. Reading past the limit is a [`BufferUnderflow`] error,
//! never a panic.
//!
//! All multi-byte integers are big-endian, for length prefixes and
//! payload values alike.
//!
//! [`BufferUnderflow`]: crate::error::PeermuxError::BufferUnderflow

use crate::error::{constants, PeermuxError, Result};

/// Initial storage size for an empty frame.
const DEFAULT_CAPACITY: usize = 256;

/// Growable cursor buffer for wire-format assembly and parsing.
///
/// A fresh frame is in write mode (`limit == capacity`). After writing,
/// [`flip`](ByteFrame::flip) switches to read mode without copying;
/// [`compact`](ByteFrame::compact) preserves an unread tail across a
/// suspension.
#[derive(Debug, Clone, Default)]
pub struct ByteFrame {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl ByteFrame {
    /// Create an empty frame with the default capacity, ready for writing.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty frame with at least `capacity` bytes of storage.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            position: 0,
            limit: capacity,
        }
    }

    /// Wrap existing bytes, positioned for reading from the start.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            position: 0,
            limit: bytes.len(),
        }
    }

    /// Wrap an owned vector, positioned for reading from the start.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let limit = bytes.len();
        Self {
            data: bytes,
            position: 0,
            limit,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the cursor. The new position may not exceed the limit.
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.limit {
            return Err(PeermuxError::BufferUnderflow {
                needed: position,
                available: self.limit,
            });
        }
        self.position = position;
        Ok(())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Adjust the limit. Clamps the position down if it now exceeds it.
    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit > self.capacity() {
            return Err(PeermuxError::BufferUnderflow {
                needed: limit,
                available: self.capacity(),
            });
        }
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes left between position and limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Switch from write mode to read mode: the written region becomes
    /// the readable region. No bytes are copied.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Reset the cursor to re-read the readable region.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Discard everything and return to write mode.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Move the unread tail `[position, limit)` to the front and return
    /// to write mode with the cursor after the preserved bytes. Used so
    /// partially consumed input survives a suspension.
    pub fn compact(&mut self) {
        let remaining = self.remaining();
        self.data.copy_within(self.position..self.limit, 0);
        self.position = remaining;
        self.limit = self.capacity();
    }

    /// The unread region as a borrowed slice; a zero-copy view that
    /// reinterprets position/limit without consuming anything.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Everything written so far, `[0, position)`. Only meaningful in
    /// write mode.
    pub fn written_slice(&self) -> &[u8] {
        &self.data[..self.position]
    }

    /// Skip `count` readable bytes.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        self.check_remaining(count)?;
        self.position += count;
        Ok(())
    }

    fn check_remaining(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(PeermuxError::BufferUnderflow {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    /// Grow storage so at least `needed` total bytes fit. Growth is by
    /// a factor of at least 1.5 to amortize repeated small writes.
    fn ensure_capacity(&mut self, needed: usize) {
        let capacity = self.capacity();
        if needed <= capacity {
            return;
        }
        let grown = capacity + capacity / 2;
        let new_capacity = needed.max(grown).max(DEFAULT_CAPACITY);
        self.data.resize(new_capacity, 0);
        // Write mode keeps the limit tracking capacity.
        if self.limit == capacity {
            self.limit = new_capacity;
        }
    }

    // --- writers ---------------------------------------------------------

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.ensure_capacity(self.position + bytes.len());
        self.data[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        if self.position > self.limit {
            self.limit = self.position;
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put_slice(&[value]);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.put_u8(value as u8);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_i16(&mut self, value: i16) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_f32(&mut self, value: f32) {
        self.put_u32(value.to_bits());
    }

    pub fn put_f64(&mut self, value: f64) {
        self.put_u64(value.to_bits());
    }

    /// `[i32 length][bytes]`
    pub fn put_blob(&mut self, bytes: &[u8]) {
        self.put_i32(bytes.len() as i32);
        self.put_slice(bytes);
    }

    /// UTF-8 string as a length-prefixed blob.
    pub fn put_str(&mut self, value: &str) {
        self.put_blob(value.as_bytes());
    }

    // --- readers ---------------------------------------------------------

    pub fn get_slice(&mut self, count: usize) -> Result<&[u8]> {
        self.check_remaining(count)?;
        let start = self.position;
        self.position += count;
        Ok(&self.data[start..start + count])
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        Ok(self.get_slice(count)?.to_vec())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_slice(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(self.get_u8()? as i8)
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(self.get_slice(2)?);
        Ok(u16::from_be_bytes(bytes))
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.get_slice(4)?);
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.get_slice(8)?);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Read a length-prefixed blob if it is fully buffered.
    ///
    /// Returns `Ok(None)` with the cursor untouched when more bytes are
    /// needed; a negative length prefix is a protocol violation.
    pub fn get_blob_opt(&mut self) -> Result<Option<Vec<u8>>> {
        if self.remaining() < 4 {
            return Ok(None);
        }
        let mark = self.position;
        let len = self.get_i32()?;
        if len < 0 {
            return Err(PeermuxError::ProtocolViolation(
                constants::ERR_NEGATIVE_LENGTH.into(),
            ));
        }
        let len = len as usize;
        if self.remaining() < len {
            self.position = mark;
            return Ok(None);
        }
        Ok(Some(self.get_bytes(len)?))
    }

    /// Read a length-prefixed UTF-8 string if fully buffered.
    pub fn get_str_opt(&mut self) -> Result<Option<String>> {
        let mark = self.position;
        match self.get_blob_opt()? {
            None => Ok(None),
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(s) => Ok(Some(s)),
                Err(_) => {
                    self.position = mark;
                    Err(PeermuxError::ProtocolViolation(
                        "Invalid UTF-8 in string field".into(),
                    ))
                }
            },
        }
    }

    /// Consume the readable region into an owned vector.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        let bytes = self.remaining_slice().to_vec();
        self.position = self.limit;
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_roundtrip_interleaved() {
        let mut frame = ByteFrame::new();
        frame.put_u8(0xAB);
        frame.put_i32(-7);
        frame.put_bool(true);
        frame.put_f32(3.5);
        frame.put_u64(u64::MAX - 1);
        frame.put_i16(-300);
        frame.put_f64(-0.125);
        frame.put_bool(false);

        frame.flip();

        assert_eq!(frame.get_u8().unwrap(), 0xAB);
        assert_eq!(frame.get_i32().unwrap(), -7);
        assert!(frame.get_bool().unwrap());
        assert_eq!(frame.get_f32().unwrap(), 3.5);
        assert_eq!(frame.get_u64().unwrap(), u64::MAX - 1);
        assert_eq!(frame.get_i16().unwrap(), -300);
        assert_eq!(frame.get_f64().unwrap(), -0.125);
        assert!(!frame.get_bool().unwrap());
        assert!(!frame.has_remaining());
    }

    #[test]
    fn invariant_holds_through_cursor_ops() {
        let mut frame = ByteFrame::with_capacity(16);
        frame.put_u32(42);
        assert!(frame.position() <= frame.limit());
        assert!(frame.limit() <= frame.capacity());
        frame.flip();
        assert_eq!(frame.limit(), 4);
        assert_eq!(frame.position(), 0);
        frame.set_position(4).unwrap();
        assert!(frame.set_position(5).is_err());
    }

    #[test]
    fn growth_preserves_content() {
        let mut frame = ByteFrame::with_capacity(4);
        for i in 0..100u32 {
            frame.put_u32(i);
        }
        assert!(frame.capacity() >= 400);
        frame.flip();
        for i in 0..100u32 {
            assert_eq!(frame.get_u32().unwrap(), i);
        }
    }

    #[test]
    fn growth_factor_at_least_1_5x() {
        let mut frame = ByteFrame::with_capacity(100);
        frame.put_slice(&[0u8; 101]);
        assert!(frame.capacity() >= 150);
    }

    #[test]
    fn underflow_is_error_not_panic() {
        let mut frame = ByteFrame::from_slice(&[1, 2]);
        let err = frame.get_u32().unwrap_err();
        assert!(matches!(
            err,
            PeermuxError::BufferUnderflow {
                needed: 4,
                available: 2
            }
        ));
        // Cursor untouched by the failed read.
        assert_eq!(frame.remaining(), 2);
    }

    #[test]
    fn compact_preserves_unread_tail() {
        let mut frame = ByteFrame::new();
        frame.put_slice(b"abcdef");
        frame.flip();
        assert_eq!(frame.get_slice(2).unwrap(), b"ab");
        frame.compact();
        // Tail "cdef" now sits at the front; write more after it.
        frame.put_slice(b"gh");
        frame.flip();
        assert_eq!(frame.take_remaining(), b"cdefgh");
    }

    #[test]
    fn blob_suspends_until_complete() {
        let mut frame = ByteFrame::new();
        frame.put_i32(6);
        frame.put_slice(b"abc");
        frame.flip();

        assert!(frame.get_blob_opt().unwrap().is_none());
        assert_eq!(frame.position(), 0);

        frame.compact();
        frame.put_slice(b"def");
        frame.flip();
        assert_eq!(frame.get_blob_opt().unwrap().unwrap(), b"abcdef");
    }

    #[test]
    fn negative_blob_length_rejected() {
        let mut frame = ByteFrame::new();
        frame.put_i32(-1);
        frame.flip();
        assert!(matches!(
            frame.get_blob_opt(),
            Err(PeermuxError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn string_roundtrip() {
        let mut frame = ByteFrame::new();
        frame.put_str("aes-128/cbc-pkcs7");
        frame.flip();
        assert_eq!(frame.get_str_opt().unwrap().unwrap(), "aes-128/cbc-pkcs7");
    }
}
