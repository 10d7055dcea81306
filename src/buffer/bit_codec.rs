//! # BitCodec
//!
//! Packs and unpacks unsigned integers of 1..=32 bits contiguously,
//! independent of byte alignment. Used to squeeze high-frequency numeric
//! fields (positions, rotations) in state-replication streams down to
//! their actual range.
//!
//! Bits are packed MSB-first. The absolute bit cursor can be saved and
//! restored, so a stream split mid-field resumes exactly where it
//! stopped.

use crate::error::{PeermuxError, Result};

/// Sub-byte integer packer with an absolute bit cursor.
#[derive(Debug, Clone, Default)]
pub struct BitCodec {
    data: Vec<u8>,
    /// Cursor, in bits.
    pos: usize,
    /// High-water mark of written bits.
    len: usize,
}

impl BitCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap packed bytes for reading; every bit of `bytes` is readable.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            pos: 0,
            len: bytes.len() * 8,
        }
    }

    /// Absolute cursor in bits.
    pub fn bit_position(&self) -> usize {
        self.pos
    }

    /// Restore the cursor to a previously observed bit position.
    pub fn set_bit_position(&mut self, position: usize) -> Result<()> {
        if position > self.len {
            return Err(PeermuxError::BufferUnderflow {
                needed: position,
                available: self.len,
            });
        }
        self.pos = position;
        Ok(())
    }

    /// Total written bits.
    pub fn bit_len(&self) -> usize {
        self.len
    }

    /// Bytes needed to hold every written bit.
    pub fn byte_len(&self) -> usize {
        self.len.div_ceil(8)
    }

    /// The packed bytes, padded with zero bits up to the last byte.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.byte_len()]
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
        self.len = 0;
    }

    fn check_width(bits: u32) -> Result<()> {
        if bits == 0 || bits > 32 {
            return Err(PeermuxError::InvalidBitWidth(bits));
        }
        Ok(())
    }

    /// Write the low `bits` bits of `value` at the cursor.
    ///
    /// Rejects widths outside 1..=32 and values that do not fit in the
    /// requested width; both are protocol violations on the write side.
    pub fn put(&mut self, value: u32, bits: u32) -> Result<()> {
        Self::check_width(bits)?;
        if bits < 32 && value >> bits != 0 {
            return Err(PeermuxError::ValueOutOfRange { value, bits });
        }

        let mut remaining = bits;
        while remaining > 0 {
            let byte_index = self.pos / 8;
            let bit_offset = (self.pos % 8) as u32;
            if byte_index >= self.data.len() {
                self.data.push(0);
            }
            let avail = 8 - bit_offset;
            let take = remaining.min(avail);
            let chunk = ((value >> (remaining - take)) & ((1u32 << take) - 1)) as u8;
            let shift = avail - take;
            let mask = (((1u32 << take) - 1) as u8) << shift;
            self.data[byte_index] = (self.data[byte_index] & !mask) | (chunk << shift);
            self.pos += take as usize;
            remaining -= take;
        }
        if self.pos > self.len {
            self.len = self.pos;
        }
        Ok(())
    }

    /// Read the next `bits` bits at the cursor.
    ///
    /// Underflow counts are in bits.
    pub fn get(&mut self, bits: u32) -> Result<u32> {
        Self::check_width(bits)?;
        if self.pos + bits as usize > self.len {
            return Err(PeermuxError::BufferUnderflow {
                needed: bits as usize,
                available: self.len - self.pos,
            });
        }

        let mut value = 0u32;
        let mut remaining = bits;
        while remaining > 0 {
            let byte_index = self.pos / 8;
            let bit_offset = (self.pos % 8) as u32;
            let avail = 8 - bit_offset;
            let take = remaining.min(avail);
            let chunk = (self.data[byte_index] >> (avail - take)) & (((1u32 << take) - 1) as u8);
            value = (value << take) | u32::from(chunk);
            self.pos += take as usize;
            remaining -= take;
        }
        Ok(value)
    }
}
