//! # Communicator
//!
//! Per-peer session object. Wraps one multiplexer registration and
//! exposes plaintext and encrypted read/write plus an outbound mailbox
//! flushed by the externally driven update tick.

use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::buffer::ByteFrame;
use crate::crypto::{EncryptionReader, EncryptionWriter};
use crate::error::{constants, PeermuxError, Result};
use crate::mux::{framing, ConnectionId, Multiplexer};

/// Lifecycle of one session. Transitions are one-way:
/// `Connecting -> Authenticating -> Initializing -> Active ->
/// Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Initializing,
    Active,
    Disconnected,
}

struct EncryptionPair {
    reader: EncryptionReader,
    writer: EncryptionWriter,
}

struct Inner {
    state: ConnectionState,
    /// Set atomically as a pair — never one half without the other.
    crypto: Option<EncryptionPair>,
    /// Queued application payloads, framed and sent on the next update
    /// tick. Discarded when the session ends without a drain request.
    mailbox: Vec<Bytes>,
}

/// One peer session.
pub struct Communicator {
    id: ConnectionId,
    remote: String,
    mux: Multiplexer,
    inner: Mutex<Inner>,
}

impl Communicator {
    pub(crate) fn new(id: ConnectionId, remote: String, mux: Multiplexer) -> Self {
        Self {
            id,
            remote,
            mux,
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                crypto: None,
                mailbox: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Recover the guard on poison; session state stays usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote endpoint as `host:port`.
    pub fn remote_endpoint(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut inner = self.lock();
        trace!(id = %self.id, ?state, "Session state change");
        inner.state = state;
    }

    /// Install the encryption reader/writer pair produced by the
    /// handshake. One lock, both halves: a reader is never observable
    /// without its writer.
    pub(crate) fn install_encryption(&self, reader: EncryptionReader, writer: EncryptionWriter) {
        let mut inner = self.lock();
        inner.crypto = Some(EncryptionPair { reader, writer });
        debug!(id = %self.id, "Encryption pair installed");
    }

    pub fn has_encryption(&self) -> bool {
        self.lock().crypto.is_some()
    }

    /// Send a payload immediately as one framed message. Safe from any
    /// thread.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.mux.send(self.id, framing::frame_tcp_message(payload))
    }

    /// Send pre-framed bytes (handshake and encrypted frames go raw on
    /// the stream).
    pub(crate) fn send_raw(&self, bytes: Bytes) -> Result<()> {
        self.mux.send(self.id, bytes)
    }

    /// Append a payload to the outbound mailbox; it is framed and sent
    /// on the next update tick.
    pub fn queue(&self, payload: &[u8]) {
        self.lock().mailbox.push(Bytes::copy_from_slice(payload));
    }

    /// Flush the mailbox. Only Active sessions flush; queued payloads on
    /// a session that never activates are discarded with it.
    pub(crate) fn flush_mailbox(&self) -> Result<()> {
        let drained: Vec<Bytes> = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Active || inner.mailbox.is_empty() {
                return Ok(());
            }
            inner.mailbox.drain(..).collect()
        };
        trace!(id = %self.id, messages = drained.len(), "Flushing mailbox");
        for payload in drained {
            self.mux.send(self.id, framing::frame_tcp_message(&payload))?;
        }
        Ok(())
    }

    /// Seal `plain` into an encrypted frame and send it. Available once
    /// the handshake has installed the encryption pair.
    pub fn write_encrypted(&self, plain: &[u8]) -> Result<()> {
        let sealed = {
            let inner = self.lock();
            let pair = inner.crypto.as_ref().ok_or_else(|| {
                PeermuxError::Initialization(constants::ERR_ENCRYPTION_NOT_READY.into())
            })?;
            pair.writer.seal_frame(plain)?
        };
        self.send_raw(Bytes::from(sealed))
    }

    /// True when the bytes at the frame cursor start with this
    /// connection's encryption nonce.
    pub fn is_encrypted_frame(&self, frame: &ByteFrame) -> bool {
        let inner = self.lock();
        match inner.crypto.as_ref() {
            Some(pair) => pair.reader.is_encrypted(frame),
            None => false,
        }
    }

    /// Open an encrypted frame at the cursor. `Ok(None)` when the frame
    /// is plaintext, incomplete, or encryption is not yet installed.
    pub fn read_encrypted(&self, frame: &mut ByteFrame) -> Result<Option<Vec<u8>>> {
        let inner = self.lock();
        match inner.crypto.as_ref() {
            Some(pair) => pair.reader.open_frame(frame),
            None => Ok(None),
        }
    }

    /// Close immediately, discarding buffered outbound bytes.
    pub fn disconnect(&self) -> Result<()> {
        self.mux.disconnect(self.id)
    }

    /// Close after every previously sent byte has flushed.
    pub fn disconnect_after_drain(&self) -> Result<()> {
        self.mux.disconnect_after_drain(self.id)
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}
