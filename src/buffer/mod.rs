//! # Buffers
//!
//! Compact binary framing primitives used by every layer of the crate:
//! a growable cursor-based byte buffer and a sub-byte bit packer for
//! high-frequency numeric fields.

pub mod bit_codec;
pub mod byte_frame;

pub use bit_codec::BitCodec;
pub use byte_frame::ByteFrame;
