//! # Error Types
//!
//! Error handling for the peer communication core.
//!
//! This module defines all error variants that can occur while driving
//! connections, from low-level I/O failures to handshake and pipeline
//! faults.
//!
//! ## Error Categories
//! - **I/O failures**: reset, refused, broken pipe — fatal for the one
//!   connection they occur on
//! - **Protocol violations**: malformed length headers, bad bit widths,
//!   oversized frames — fatal for that connection
//! - **Handshake / initialization failures**: decrypt failures, rejected
//!   authentication, task errors — abort the pipeline and tear the
//!   connection down
//!
//! Partial reads and writes are *not* errors anywhere in this crate; they
//! are suspension points signalled as `Ok(None)` by the parsers and
//! retried on the next readiness event.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common cases.
pub mod constants {
    /// Handshake errors
    pub const ERR_UNKNOWN_ALGORITHM: &str = "Unknown asymmetric algorithm";
    pub const ERR_UNKNOWN_TRANSFORM: &str = "Unknown cipher transform";
    pub const ERR_BAD_PUBLIC_KEY: &str = "Malformed public key encoding";
    pub const ERR_BAD_KEY_MATERIAL: &str = "Malformed session key material";
    pub const ERR_KEY_DECRYPT_FAILED: &str = "Session key decryption failed";
    pub const ERR_HANDSHAKE_STATE: &str = "Handshake driven past completion";

    /// Pipeline errors
    pub const ERR_PIPELINE_FINISHED: &str = "Pipeline resumed after completion";
    pub const ERR_ENCRYPTION_NOT_READY: &str = "Encryption pair not installed";

    /// Framing errors
    pub const ERR_NEGATIVE_LENGTH: &str = "Negative length prefix";
    pub const ERR_BAD_TRANSPORT_MARK: &str = "Invalid transport marker byte";

    /// Multiplexer errors
    pub const ERR_MUX_STOPPED: &str = "Multiplexer is not running";
}

/// Primary error type for all operations in this crate.
#[derive(Error, Debug)]
pub enum PeermuxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed data that can never become valid by waiting for more
    /// bytes. Fatal for the connection it was read from.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Frame of {0} bytes exceeds maximum frame length")]
    OversizedFrame(usize),

    #[error("Bit width {0} outside supported range 1..=32")]
    InvalidBitWidth(u32),

    #[error("Value {value} does not fit in {bits} bits")]
    ValueOutOfRange { value: u32, bits: u32 },

    /// A read cursor ran past the readable limit of a buffer.
    #[error("Buffer underflow: needed {needed} bytes, {available} available")]
    BufferUnderflow { needed: usize, available: usize },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl PeermuxError {
    /// True when the error belongs to the initialization class: the
    /// owning context tears down the connection and surfaces the cause.
    pub fn is_initialization_failure(&self) -> bool {
        matches!(
            self,
            PeermuxError::Handshake(_)
                | PeermuxError::Initialization(_)
                | PeermuxError::DecryptionFailure
        )
    }
}

/// Type alias for Results using PeermuxError
pub type Result<T> = std::result::Result<T, PeermuxError>;
