//! # Sessions
//!
//! The per-peer layer above the multiplexer: a [`Communicator`] wraps
//! one registration and exposes plaintext and encrypted read/write, an
//! [`InitializationPipeline`] runs once per new peer before steady-state
//! messaging, and a [`PeerHost`] glues handshake, pipeline and message
//! dispatch together for one role.

pub mod communicator;
pub mod host;
pub mod pipeline;

pub use communicator::{Communicator, ConnectionState};
pub use host::{PeerEvents, PeerHost, PipelineFactory};
pub use pipeline::{
    ContextValue, InitTask, InitializationContext, InitializationPipeline, PipelineConfig,
    PipelineState, PipelineStatus, TaskIo,
};
