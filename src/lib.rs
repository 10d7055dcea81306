//! # peermux
//!
//! Secure, low-level peer communication core for real-time applications:
//! a connection multiplexer for many TCP/UDP channels, a public-key
//! bootstrapped symmetric handshake, a per-connection initialization
//! pipeline, and a compact binary framing layer (growable byte buffer
//! plus sub-byte bit packing) for high-frequency state-replication
//! messages.
//!
//! ## Architecture
//!
//! - [`buffer`] — [`ByteFrame`](buffer::ByteFrame) cursor buffer and
//!   [`BitCodec`](buffer::BitCodec) bit packer
//! - [`crypto`] — RSA-bootstrapped AES session encryption and the
//!   nonce-headed encrypted frame layer
//! - [`mux`] — the single-driver connection multiplexer
//! - [`session`] — [`Communicator`](session::Communicator),
//!   [`InitializationPipeline`](session::InitializationPipeline) and the
//!   [`PeerHost`](session::PeerHost) contexts
//!
//! ## What this crate deliberately does not do
//!
//! No outbound flow control or backpressure, no automatic reconnection,
//! no message-level integrity (the encrypted channel is
//! confidentiality-only), and no deadlines for connect, handshake or
//! initialization. All of these are the caller's responsibility.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peermux::buffer::ByteFrame;
//! use peermux::config::NetworkConfig;
//! use peermux::crypto::ServerIdentity;
//! use peermux::session::{Communicator, PeerEvents, PeerHost};
//!
//! struct Echo;
//!
//! impl PeerEvents for Echo {
//!     fn on_message(&self, communicator: &Arc<Communicator>, mut frame: ByteFrame) {
//!         let payload = frame.take_remaining();
//!         let _ = communicator.send(&payload);
//!     }
//! }
//!
//! # async fn run() -> peermux::error::Result<()> {
//! let config = NetworkConfig::default();
//! let identity = Arc::new(ServerIdentity::generate()?);
//! let host = PeerHost::server(&config, identity, Arc::new(Echo), PeerHost::empty_pipeline());
//! let (_listener, addr) = host.listen("127.0.0.1:0").await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod crypto;
pub mod error;
pub mod mux;
pub mod session;

pub use buffer::{BitCodec, ByteFrame};
pub use error::{PeermuxError, Result};
pub use mux::{ConnectionId, ListenerId, Multiplexer, UdpDirection, UdpRegistrationId};
pub use session::{Communicator, ConnectionState, InitializationPipeline, PeerEvents, PeerHost};
