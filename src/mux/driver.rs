//! The multiplexer driver task.
//!
//! Owns the connection arena, the listener map and the UDP registration
//! map. Blocks on its two queues — external commands and internal I/O
//! events — and processes whatever arrives, one item at a time. Sockets
//! themselves are serviced by small per-channel tasks (an accept loop, a
//! read loop, a write loop) that only ever talk back through the event
//! queue, so every piece of shared state is mutated here and nowhere
//! else.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{
    framing, ChannelEvents, Command, ConnectionId, ListenerId, UdpDirection, UdpRegistrationId,
};
use crate::error::PeermuxError;

/// Read buffer chunk size for connection read loops.
const READ_CHUNK: usize = 16 * 1024;

/// Maximum datagram size accepted on a UDP registration.
const MAX_DATAGRAM: usize = 64 * 1024;

enum WriteOp {
    Data(Bytes),
    /// Drain marker: everything queued before it is flushed, then the
    /// socket shuts down.
    DrainAndClose,
}

enum IoEvent {
    Accepted {
        listener: ListenerId,
        stream: TcpStream,
        peer: SocketAddr,
    },
    AcceptFailed {
        listener: ListenerId,
        cause: io::Error,
    },
    ConnectOk {
        endpoint: String,
        stream: TcpStream,
        peer: SocketAddr,
    },
    ConnectErr {
        endpoint: String,
        cause: io::Error,
    },
    Data {
        id: ConnectionId,
        bytes: Bytes,
    },
    Eof {
        id: ConnectionId,
    },
    ReadError {
        id: ConnectionId,
        cause: io::Error,
    },
    WriteError {
        id: ConnectionId,
        cause: io::Error,
    },
    /// The writer finished a drain-then-close.
    Drained {
        id: ConnectionId,
    },
    Datagram {
        registration: UdpRegistrationId,
        from: SocketAddr,
        datagram: Bytes,
    },
}

struct Connection {
    peer: SocketAddr,
    write_tx: mpsc::UnboundedSender<WriteOp>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    /// Drain-close pending; further sends are dropped.
    draining: bool,
}

struct Listener {
    task: JoinHandle<()>,
}

struct UdpRegistration {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    direction: UdpDirection,
    next_transmission: i32,
    reader: Option<JoinHandle<()>>,
}

pub(crate) struct Driver {
    events: Box<dyn ChannelEvents>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    ev_tx: mpsc::UnboundedSender<IoEvent>,
    ev_rx: mpsc::UnboundedReceiver<IoEvent>,
    connections: HashMap<ConnectionId, Connection>,
    listeners: HashMap<ListenerId, Listener>,
    udp: HashMap<UdpRegistrationId, UdpRegistration>,
    next_connection: u64,
    next_listener: u64,
    next_udp: u64,
}

impl Driver {
    pub(crate) fn new(
        events: Box<dyn ChannelEvents>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        Self {
            events,
            cmd_rx,
            ev_tx,
            ev_rx,
            connections: HashMap::new(),
            listeners: HashMap::new(),
            udp: HashMap::new(),
            next_connection: 0,
            next_listener: 0,
            next_udp: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Multiplexer driver started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    // Every handle dropped: same as shutdown.
                    None => break,
                },
                Some(event) = self.ev_rx.recv() => self.handle_event(event),
            }
        }
        self.teardown();
        debug!("Multiplexer driver stopped");
    }

    /// Returns true when the driver should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Listen { addr, reply } => {
                let result = self.bind_listener(&addr).await;
                let _ = reply.send(result);
            }
            Command::Connect { addr } => {
                let ev_tx = self.ev_tx.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(&addr).await {
                        Ok(stream) => {
                            let peer = stream
                                .peer_addr()
                                .unwrap_or_else(|_| SocketAddr::from(([0u8, 0, 0, 0], 0)));
                            let _ = ev_tx.send(IoEvent::ConnectOk {
                                endpoint: addr,
                                stream,
                                peer,
                            });
                        }
                        Err(cause) => {
                            let _ = ev_tx.send(IoEvent::ConnectErr {
                                endpoint: addr,
                                cause,
                            });
                        }
                    }
                });
            }
            Command::Send { id, bytes } => {
                match self.connections.get(&id) {
                    Some(conn) if conn.draining => {
                        debug!(%id, "Dropping send queued after drain-close");
                    }
                    Some(conn) => {
                        let _ = conn.write_tx.send(WriteOp::Data(bytes));
                    }
                    // Sends racing a close are tolerated and dropped.
                    None => trace!(%id, "Dropping send for closed connection"),
                }
            }
            Command::Disconnect { id, drain: false } => {
                if let Some(conn) = self.connections.remove(&id) {
                    conn.reader.abort();
                    conn.writer.abort();
                    debug!(%id, "Disconnected, unsent bytes discarded");
                    self.events.closed(id, None);
                }
            }
            Command::Disconnect { id, drain: true } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.draining = true;
                    let _ = conn.write_tx.send(WriteOp::DrainAndClose);
                }
            }
            Command::RegisterUdp {
                bind,
                peer,
                direction,
                reply,
            } => {
                let result = self.bind_udp(&bind, peer, direction).await;
                let _ = reply.send(result);
            }
            Command::SendUdp {
                registration,
                payload,
            } => self.send_udp(registration, payload),
            Command::Shutdown => return true,
        }
        false
    }

    fn handle_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Accepted {
                listener,
                stream,
                peer,
            } => {
                let id = self.register_stream(stream, peer);
                info!(%id, %peer, "Accepted connection");
                self.events.accepted(listener, id, peer);
            }
            IoEvent::AcceptFailed { listener, cause } => {
                // A failed accept leaves the listener itself usable.
                error!(?listener, error = %cause, "Accept failed");
            }
            IoEvent::ConnectOk {
                endpoint,
                stream,
                peer,
            } => {
                let id = self.register_stream(stream, peer);
                info!(%id, endpoint = %endpoint, "Connected");
                self.events.connected(id, peer);
            }
            IoEvent::ConnectErr { endpoint, cause } => {
                warn!(endpoint = %endpoint, error = %cause, "Connect failed");
                self.events
                    .connect_failed(&endpoint, PeermuxError::Io(cause));
            }
            IoEvent::Data { id, bytes } => {
                if self.connections.contains_key(&id) {
                    self.events.data(id, bytes);
                }
            }
            IoEvent::Eof { id } => self.close_connection(id, None),
            IoEvent::ReadError { id, cause } => {
                self.close_connection(id, Some(PeermuxError::Io(cause)));
            }
            IoEvent::WriteError { id, cause } => {
                self.close_connection(id, Some(PeermuxError::Io(cause)));
            }
            IoEvent::Drained { id } => self.close_connection(id, None),
            IoEvent::Datagram {
                registration,
                from,
                datagram,
            } => match framing::parse_udp_datagram(&datagram) {
                Ok((transmission_id, payload)) => {
                    self.events
                        .datagram(registration, from, transmission_id, payload);
                }
                Err(cause) => {
                    warn!(?registration, %from, error = %cause, "Dropping malformed datagram");
                }
            },
        }
    }

    async fn bind_listener(
        &mut self,
        addr: &str,
    ) -> crate::error::Result<(ListenerId, SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;

        let ev_tx = self.ev_tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if ev_tx
                            .send(IoEvent::Accepted {
                                listener: id,
                                stream,
                                peer,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(cause) => {
                        if ev_tx
                            .send(IoEvent::AcceptFailed {
                                listener: id,
                                cause,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        self.listeners.insert(id, Listener { task });
        info!(?id, %local, "Listening");
        Ok((id, local))
    }

    async fn bind_udp(
        &mut self,
        bind: &str,
        peer: Option<SocketAddr>,
        direction: UdpDirection,
    ) -> crate::error::Result<(UdpRegistrationId, SocketAddr)> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let local = socket.local_addr()?;
        let id = UdpRegistrationId(self.next_udp);
        self.next_udp += 1;

        let reader = if direction.can_read() {
            let socket = socket.clone();
            let ev_tx = self.ev_tx.clone();
            Some(tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, from)) => {
                            let datagram = Bytes::copy_from_slice(&buf[..len]);
                            if ev_tx
                                .send(IoEvent::Datagram {
                                    registration: id,
                                    from,
                                    datagram,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(cause) => {
                            warn!(?id, error = %cause, "UDP receive failed");
                            break;
                        }
                    }
                }
            }))
        } else {
            None
        };

        self.udp.insert(
            id,
            UdpRegistration {
                socket,
                peer,
                direction,
                next_transmission: 0,
                reader,
            },
        );
        info!(?id, %local, ?direction, "UDP registration bound");
        Ok((id, local))
    }

    fn send_udp(&mut self, id: UdpRegistrationId, payload: Bytes) {
        let Some(reg) = self.udp.get_mut(&id) else {
            trace!(?id, "Dropping datagram for unknown registration");
            return;
        };
        if !reg.direction.can_write() {
            warn!(?id, "Dropping datagram: registration is read-only");
            return;
        }
        let Some(peer) = reg.peer else {
            warn!(?id, "Dropping datagram: no peer address");
            return;
        };

        let transmission_id = reg.next_transmission;
        reg.next_transmission = reg.next_transmission.wrapping_add(1);
        let framed = framing::frame_udp_message(transmission_id, &payload);

        let socket = reg.socket.clone();
        tokio::spawn(async move {
            if let Err(cause) = socket.send_to(&framed, peer).await {
                warn!(?id, %peer, error = %cause, "UDP send failed");
            }
        });
    }

    fn register_stream(&mut self, stream: TcpStream, peer: SocketAddr) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;

        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(id, read_half, self.ev_tx.clone()));
        let writer = tokio::spawn(write_loop(id, write_half, write_rx, self.ev_tx.clone()));

        self.connections.insert(
            id,
            Connection {
                peer,
                write_tx,
                reader,
                writer,
                draining: false,
            },
        );
        id
    }

    /// Tear down one connection and notify the sink exactly once. Events
    /// already queued for the id after this point miss the arena and are
    /// ignored.
    fn close_connection(&mut self, id: ConnectionId, cause: Option<PeermuxError>) {
        if let Some(conn) = self.connections.remove(&id) {
            conn.reader.abort();
            conn.writer.abort();
            match &cause {
                Some(err) => warn!(%id, peer = %conn.peer, error = %err, "Connection failed"),
                None => info!(%id, peer = %conn.peer, "Connection closed"),
            }
            self.events.closed(id, cause);
        }
    }

    fn teardown(&mut self) {
        for (_, listener) in self.listeners.drain() {
            listener.task.abort();
        }
        for (_, reg) in self.udp.drain() {
            if let Some(reader) = reg.reader {
                reader.abort();
            }
        }
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id, None);
        }
    }
}

async fn read_loop(
    id: ConnectionId,
    mut half: OwnedReadHalf,
    ev_tx: mpsc::UnboundedSender<IoEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        match half.read_buf(&mut buf).await {
            // End-of-stream is an orderly close.
            Ok(0) => {
                let _ = ev_tx.send(IoEvent::Eof { id });
                break;
            }
            Ok(_) => {
                let bytes = buf.split().freeze();
                if ev_tx.send(IoEvent::Data { id, bytes }).is_err() {
                    break;
                }
                buf.reserve(READ_CHUNK);
            }
            Err(cause) => {
                let _ = ev_tx.send(IoEvent::ReadError { id, cause });
                break;
            }
        }
    }
}

async fn write_loop(
    id: ConnectionId,
    mut half: OwnedWriteHalf,
    mut write_rx: mpsc::UnboundedReceiver<WriteOp>,
    ev_tx: mpsc::UnboundedSender<IoEvent>,
) {
    while let Some(op) = write_rx.recv().await {
        match op {
            WriteOp::Data(bytes) => {
                // write_all resumes across partial writes; a large
                // payload completes over multiple write readiness
                // events without reordering.
                if let Err(cause) = half.write_all(&bytes).await {
                    let _ = ev_tx.send(IoEvent::WriteError { id, cause });
                    return;
                }
            }
            WriteOp::DrainAndClose => {
                let _ = half.shutdown().await;
                let _ = ev_tx.send(IoEvent::Drained { id });
                return;
            }
        }
    }
}
