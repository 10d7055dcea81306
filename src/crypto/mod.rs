//! # Crypto
//!
//! Asymmetric bootstrap and symmetric session encryption.
//!
//! A server holds a long-lived RSA key pair. Each new connection runs a
//! handshake in which the client generates a fresh symmetric session key
//! and transports it to the server encrypted under the server's public
//! key. Both sides then wrap the session cipher in an
//! [`EncryptionReader`]/[`EncryptionWriter`] pair that prefixes every
//! encrypted frame with a shared 8-byte random nonce, so encrypted and
//! plaintext frames can share one stream.
//!
//! The encrypted channel provides **confidentiality only** — frames
//! carry no MAC or integrity tag. This is a documented design
//! limitation, chosen to keep high-frequency traffic cheap; callers who
//! need authenticity must layer their own.

pub mod cipher;
pub mod framing;
pub mod handshake;

pub use cipher::{
    CipherTransform, PublicEncryptor, ServerIdentity, SessionKeyMaterial, SymmetricDecryptor,
    SymmetricEncryptor,
};
pub use framing::{EncryptionReader, EncryptionWriter, HEADER_NONCE_LEN};
pub use handshake::{ClientHandshake, HandshakeOutcome, ServerHandshake};
