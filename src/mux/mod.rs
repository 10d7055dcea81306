//! # Connection Multiplexer
//!
//! A single driver task owns every listener, TCP connection and UDP
//! registration. External callers — any thread — interact exclusively
//! through a thread-safe command queue; posting a command wakes the
//! driver, so new write interest is observed promptly instead of the
//! loop sleeping on a stale interest set. No other task touches channel
//! state.
//!
//! Events flow back out through a [`ChannelEvents`] sink invoked on the
//! driver task, one event at a time. A slow sink therefore stalls
//! delivery for every channel; handlers must return quickly.
//!
//! Failure isolation: an I/O error on one channel tears down only that
//! channel and captures the cause for the `closed` callback. Outbound
//! queues are unbounded — a slow peer can grow memory without limit,
//! which is an explicit non-goal left to callers. No connect or
//! handshake deadlines are imposed here either.

pub mod driver;
pub mod framing;

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};

use crate::error::{constants, PeermuxError, Result};
use driver::Driver;

/// Stable integer id for one TCP connection. Ids are never reused, so a
/// stale id after close simply misses the arena instead of dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Stable id for a bound listener socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Stable id for a UDP registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpRegistrationId(pub(crate) u64);

/// Direction capability of a UDP registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpDirection {
    Read,
    Write,
    Both,
}

impl UdpDirection {
    pub fn can_read(self) -> bool {
        matches!(self, UdpDirection::Read | UdpDirection::Both)
    }

    pub fn can_write(self) -> bool {
        matches!(self, UdpDirection::Write | UdpDirection::Both)
    }
}

/// Sink for everything the driver observes. Implementations run on the
/// driver task and must not block.
pub trait ChannelEvents: Send + 'static {
    /// A listener produced a new inbound connection.
    fn accepted(&mut self, listener: ListenerId, id: ConnectionId, peer: SocketAddr);

    /// An outbound connect completed.
    fn connected(&mut self, id: ConnectionId, peer: SocketAddr);

    /// An outbound connect failed.
    fn connect_failed(&mut self, endpoint: &str, cause: PeermuxError);

    /// Bytes arrived on a connection.
    fn data(&mut self, id: ConnectionId, bytes: Bytes);

    /// A framed datagram arrived on a UDP registration. The transmission
    /// id is surfaced verbatim; duplicate/reorder policy belongs to the
    /// receiver.
    fn datagram(
        &mut self,
        registration: UdpRegistrationId,
        from: SocketAddr,
        transmission_id: i32,
        payload: Bytes,
    );

    /// A connection closed — orderly end-of-stream, local disconnect, or
    /// an I/O failure whose cause is captured here. Fired at most once
    /// per connection.
    fn closed(&mut self, id: ConnectionId, cause: Option<PeermuxError>);
}

pub(crate) enum Command {
    Listen {
        addr: String,
        reply: oneshot::Sender<Result<(ListenerId, SocketAddr)>>,
    },
    Connect {
        addr: String,
    },
    Send {
        id: ConnectionId,
        bytes: Bytes,
    },
    Disconnect {
        id: ConnectionId,
        drain: bool,
    },
    RegisterUdp {
        bind: String,
        peer: Option<SocketAddr>,
        direction: UdpDirection,
        reply: oneshot::Sender<Result<(UdpRegistrationId, SocketAddr)>>,
    },
    SendUdp {
        registration: UdpRegistrationId,
        payload: Bytes,
    },
    Shutdown,
}

/// Cloneable, thread-safe handle to the driver task.
#[derive(Clone)]
pub struct Multiplexer {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Multiplexer {
    /// Spawn the driver task. The `events` factory receives the handle
    /// so the sink can issue commands (send replies, disconnect) from
    /// inside its callbacks.
    pub fn spawn<F>(events: F) -> Self
    where
        F: FnOnce(Multiplexer) -> Box<dyn ChannelEvents>,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = Self { cmd_tx };
        let sink = events(handle.clone());
        tokio::spawn(Driver::new(sink, cmd_rx).run());
        handle
    }

    fn post(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| PeermuxError::Custom(constants::ERR_MUX_STOPPED.into()))
    }

    /// Bind a passive socket. Resolves with the listener id and the
    /// actual bound address (port 0 reports the ephemeral port chosen).
    #[instrument(skip(self))]
    pub async fn listen(&self, addr: &str) -> Result<(ListenerId, SocketAddr)> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Listen {
            addr: addr.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| PeermuxError::Custom(constants::ERR_MUX_STOPPED.into()))?
    }

    /// Issue an async connect. Completion or failure surfaces through
    /// the [`ChannelEvents`] sink.
    #[instrument(skip(self))]
    pub fn connect(&self, addr: &str) -> Result<()> {
        self.post(Command::Connect {
            addr: addr.to_string(),
        })
    }

    /// Enqueue bytes on a connection's outbound queue. Safe from any
    /// thread; never blocks. Bytes sent after close are dropped.
    pub fn send(&self, id: ConnectionId, bytes: Bytes) -> Result<()> {
        self.post(Command::Send { id, bytes })
    }

    /// Close immediately, discarding any queued-but-unsent bytes.
    pub fn disconnect(&self, id: ConnectionId) -> Result<()> {
        debug!(%id, "Disconnect requested");
        self.post(Command::Disconnect { id, drain: false })
    }

    /// Close once the outbound queue has fully flushed.
    pub fn disconnect_after_drain(&self, id: ConnectionId) -> Result<()> {
        debug!(%id, "Drain-then-close requested");
        self.post(Command::Disconnect { id, drain: true })
    }

    /// Bind a UDP socket with the given direction capability and an
    /// optional fixed peer address for sending.
    #[instrument(skip(self))]
    pub async fn register_udp(
        &self,
        bind: &str,
        peer: Option<SocketAddr>,
        direction: UdpDirection,
    ) -> Result<(UdpRegistrationId, SocketAddr)> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::RegisterUdp {
            bind: bind.to_string(),
            peer,
            direction,
            reply,
        })?;
        rx.await
            .map_err(|_| PeermuxError::Custom(constants::ERR_MUX_STOPPED.into()))?
    }

    /// Send one datagram, stamped with this registration's next
    /// transmission id.
    pub fn send_udp(&self, registration: UdpRegistrationId, payload: Bytes) -> Result<()> {
        self.post(Command::SendUdp {
            registration,
            payload,
        })
    }

    /// Stop the driver: close every listener and connection without
    /// draining pending writes.
    pub fn shutdown(&self) {
        let _ = self.post(Command::Shutdown);
    }
}
