//! # PeerHost
//!
//! The owning context for one role (server or client): it implements
//! the multiplexer event sink and drives each connection through
//! handshake, initialization pipeline and steady-state dispatch,
//! surfacing lifecycle callbacks to the application through
//! [`PeerEvents`].
//!
//! All session state lives in an arena the sink alone mutates, on the
//! driver task. The public handle only posts commands and flushes
//! mailboxes, so it is safe to hold anywhere.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, instrument, trace, warn};

use crate::buffer::ByteFrame;
use crate::config::NetworkConfig;
use crate::crypto::handshake::{identity_message, ClientHandshake, ServerHandshake};
use crate::crypto::ServerIdentity;
use crate::error::{PeermuxError, Result};
use crate::mux::{
    framing, ChannelEvents, ConnectionId, ListenerId, Multiplexer, UdpRegistrationId,
};
use crate::session::communicator::{Communicator, ConnectionState};
use crate::session::pipeline::{
    InitializationContext, InitializationPipeline, PipelineStatus,
};

/// Builds the per-connection pipeline once the handshake completes.
pub type PipelineFactory =
    Arc<dyn Fn(&Arc<Communicator>) -> InitializationPipeline + Send + Sync>;

/// Callbacks the core exposes to the application layer. Handlers run on
/// the driver task, one at a time — return quickly.
pub trait PeerEvents: Send + Sync + 'static {
    /// A connection was established (accepted or connect completed).
    fn on_connected(&self, _communicator: &Arc<Communicator>) {}

    /// An outbound connect failed before a connection existed.
    fn on_connection_failed(&self, _endpoint: &str, _cause: &PeermuxError) {}

    /// The handshake finished and the encryption pair is installed.
    fn on_authenticated(
        &self,
        _context: &InitializationContext,
        _communicator: &Arc<Communicator>,
    ) {
    }

    /// The initialization pipeline completed; the session is Active.
    fn on_initialized(
        &self,
        _context: &InitializationContext,
        _communicator: &Arc<Communicator>,
    ) {
    }

    /// A complete inbound frame on an Active session. Encrypted frames
    /// arrive already decrypted.
    fn on_message(&self, communicator: &Arc<Communicator>, frame: ByteFrame);

    /// A stamped datagram on a UDP registration. Duplicate and reorder
    /// policy is the receiver's.
    fn on_datagram(
        &self,
        _registration: UdpRegistrationId,
        _from: SocketAddr,
        _transmission_id: i32,
        _frame: ByteFrame,
    ) {
    }

    /// The session ended. `was_pending` is true when it never reached
    /// Active. Fired exactly once per session.
    fn on_disconnected(
        &self,
        _communicator: &Arc<Communicator>,
        _was_pending: bool,
        _cause: Option<&PeermuxError>,
    ) {
    }
}

enum Role {
    Server(Arc<ServerIdentity>),
    Client,
}

enum HandshakeRole {
    Client(ClientHandshake),
    Server(ServerHandshake),
}

enum Phase {
    Authenticating(HandshakeRole),
    Initializing(InitializationPipeline),
    Active,
}

struct SessionState {
    communicator: Arc<Communicator>,
    inbox: ByteFrame,
    context: InitializationContext,
    phase: Phase,
}

type Registry = Mutex<HashMap<ConnectionId, Arc<Communicator>>>;

/// Owning context for one role. Cheap to clone.
#[derive(Clone)]
pub struct PeerHost {
    mux: Multiplexer,
    registry: Arc<Registry>,
}

impl PeerHost {
    /// Server role: holds the long-lived identity whose public half is
    /// sent to every accepted connection.
    pub fn server(
        config: &NetworkConfig,
        identity: Arc<ServerIdentity>,
        events: Arc<dyn PeerEvents>,
        pipeline: PipelineFactory,
    ) -> Self {
        Self::new(Role::Server(identity), config, events, pipeline)
    }

    /// Client role: outbound connections bootstrap against the peer's
    /// identity message.
    pub fn client(
        config: &NetworkConfig,
        events: Arc<dyn PeerEvents>,
        pipeline: PipelineFactory,
    ) -> Self {
        Self::new(Role::Client, config, events, pipeline)
    }

    /// A factory for sessions that need no initialization tasks.
    pub fn empty_pipeline() -> PipelineFactory {
        Arc::new(|_| InitializationPipeline::new())
    }

    fn new(
        role: Role,
        config: &NetworkConfig,
        events: Arc<dyn PeerEvents>,
        pipeline: PipelineFactory,
    ) -> Self {
        let registry: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));
        let sink_registry = registry.clone();
        let max_frame_len = config.transport.max_frame_len;
        let mux = Multiplexer::spawn(move |mux| {
            Box::new(HostSink {
                mux,
                role,
                events,
                pipeline_factory: pipeline,
                registry: sink_registry,
                sessions: HashMap::new(),
                max_frame_len,
            })
        });
        Self { mux, registry }
    }

    /// Bind a listener; reports the actual bound address.
    pub async fn listen(&self, addr: &str) -> Result<(ListenerId, SocketAddr)> {
        self.mux.listen(addr).await
    }

    /// Issue an async connect; completion surfaces via [`PeerEvents`].
    pub fn connect(&self, addr: &str) -> Result<()> {
        self.mux.connect(addr)
    }

    /// The underlying multiplexer, for UDP registrations and raw sends.
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn communicator(&self, id: ConnectionId) -> Option<Arc<Communicator>> {
        self.lock_registry().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.lock_registry().len()
    }

    /// Externally driven tick: flush every Active session's outbound
    /// mailbox. Interval regularity does not matter; queued payloads
    /// simply wait for the next call.
    #[instrument(skip(self), fields(delta_ms = delta.as_millis() as u64))]
    pub fn update(&self, delta: Duration) {
        let communicators: Vec<Arc<Communicator>> =
            self.lock_registry().values().cloned().collect();
        for communicator in communicators {
            if let Err(cause) = communicator.flush_mailbox() {
                warn!(id = %communicator.id(), error = %cause, "Mailbox flush failed");
            }
        }
    }

    /// Stop the driver, closing listeners and every connection without
    /// draining.
    pub fn shutdown(&self) {
        self.mux.shutdown();
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<Communicator>>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct HostSink {
    mux: Multiplexer,
    role: Role,
    events: Arc<dyn PeerEvents>,
    pipeline_factory: PipelineFactory,
    registry: Arc<Registry>,
    sessions: HashMap<ConnectionId, SessionState>,
    max_frame_len: usize,
}

impl HostSink {
    fn open_session(&mut self, id: ConnectionId, peer: SocketAddr, handshake: HandshakeRole) {
        let communicator = Arc::new(Communicator::new(id, peer.to_string(), self.mux.clone()));
        communicator.set_state(ConnectionState::Authenticating);
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, communicator.clone());

        let mut inbox = ByteFrame::new();
        inbox.flip();
        self.sessions.insert(
            id,
            SessionState {
                communicator: communicator.clone(),
                inbox,
                context: InitializationContext::new(),
                phase: Phase::Authenticating(handshake),
            },
        );
        self.events.on_connected(&communicator);
    }

    /// Drive one session's state machine as far as buffered input
    /// allows; tear the session down on any error.
    fn pump(&mut self, id: ConnectionId) {
        if let Err(cause) = self.drive(id) {
            self.fail(id, cause);
        }
    }

    fn drive(&mut self, id: ConnectionId) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(());
        };

        loop {
            match &mut session.phase {
                Phase::Authenticating(role) => {
                    let outcome = match role {
                        HandshakeRole::Client(handshake) => handshake.advance(&mut session.inbox)?,
                        HandshakeRole::Server(handshake) => handshake.advance(&mut session.inbox)?,
                    };
                    let Some(outcome) = outcome else {
                        return Ok(());
                    };

                    let (reply, reader, writer) = outcome.into_channel();
                    if let Some(reply) = reply {
                        session.communicator.send_raw(Bytes::from(reply))?;
                    }
                    session.communicator.install_encryption(reader, writer);
                    session.communicator.set_state(ConnectionState::Initializing);
                    self.events
                        .on_authenticated(&session.context, &session.communicator);

                    let pipeline = self.pipeline_factory.as_ref()(&session.communicator);
                    debug!(%id, tasks = pipeline.len(), "Starting initialization pipeline");
                    session.phase = Phase::Initializing(pipeline);
                    // First pass runs immediately: producers never wait
                    // for input.
                }
                Phase::Initializing(pipeline) => {
                    match pipeline.resume(
                        &mut session.context,
                        &session.communicator,
                        &mut session.inbox,
                    )? {
                        PipelineStatus::Suspended => return Ok(()),
                        PipelineStatus::Complete => {
                            session.communicator.set_state(ConnectionState::Active);
                            self.events
                                .on_initialized(&session.context, &session.communicator);
                            session.phase = Phase::Active;
                            // Any buffered tail falls through to normal
                            // dispatch.
                        }
                    }
                }
                Phase::Active => loop {
                    if let Some(plain) = session.communicator.read_encrypted(&mut session.inbox)? {
                        self.events
                            .on_message(&session.communicator, ByteFrame::from_vec(plain));
                        continue;
                    }
                    match framing::extract_tcp_frame(&mut session.inbox, self.max_frame_len)? {
                        Some(frame) => self.events.on_message(&session.communicator, frame),
                        None => return Ok(()),
                    }
                },
            }
        }
    }

    /// Tear down one session after a local failure and notify once. The
    /// multiplexer-side close that follows finds the session already
    /// gone and stays silent.
    fn fail(&mut self, id: ConnectionId, cause: PeermuxError) {
        if let Some(mut session) = self.sessions.remove(&id) {
            warn!(%id, error = %cause, "Session failed");
            // Partially consumed inbox bytes are discarded.
            session.inbox.clear();
            let was_pending = session.communicator.state() != ConnectionState::Active;
            session.communicator.set_state(ConnectionState::Disconnected);
            self.registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            let _ = self.mux.disconnect(id);
            self.events
                .on_disconnected(&session.communicator, was_pending, Some(&cause));
        }
    }
}

impl ChannelEvents for HostSink {
    fn accepted(&mut self, _listener: ListenerId, id: ConnectionId, peer: SocketAddr) {
        let identity = match &self.role {
            Role::Server(identity) => identity.clone(),
            Role::Client => {
                warn!(%id, %peer, "Rejecting inbound connection: no server identity");
                let _ = self.mux.disconnect(id);
                return;
            }
        };

        self.open_session(id, peer, HandshakeRole::Server(ServerHandshake::new(identity.clone())));

        // The server speaks first.
        match identity_message(&identity) {
            Ok(message) => {
                if let Some(session) = self.sessions.get(&id) {
                    if let Err(cause) = session.communicator.send_raw(Bytes::from(message)) {
                        self.fail(id, cause);
                    }
                }
            }
            Err(cause) => self.fail(id, cause),
        }
    }

    fn connected(&mut self, id: ConnectionId, peer: SocketAddr) {
        self.open_session(id, peer, HandshakeRole::Client(ClientHandshake::new()));
    }

    fn connect_failed(&mut self, endpoint: &str, cause: PeermuxError) {
        self.events.on_connection_failed(endpoint, &cause);
    }

    fn data(&mut self, id: ConnectionId, bytes: Bytes) {
        let Some(session) = self.sessions.get_mut(&id) else {
            trace!(%id, "Dropping data for unknown session");
            return;
        };
        session.inbox.compact();
        session.inbox.put_slice(&bytes);
        session.inbox.flip();
        self.pump(id);
    }

    fn datagram(
        &mut self,
        registration: UdpRegistrationId,
        from: SocketAddr,
        transmission_id: i32,
        payload: Bytes,
    ) {
        self.events.on_datagram(
            registration,
            from,
            transmission_id,
            ByteFrame::from_vec(payload.to_vec()),
        );
    }

    fn closed(&mut self, id: ConnectionId, cause: Option<PeermuxError>) {
        if let Some(session) = self.sessions.remove(&id) {
            let was_pending = session.communicator.state() != ConnectionState::Active;
            session.communicator.set_state(ConnectionState::Disconnected);
            self.registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            self.events
                .on_disconnected(&session.communicator, was_pending, cause.as_ref());
        }
    }
}
