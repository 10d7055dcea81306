//! Handshake state machines: public-key exchange and symmetric session
//! bootstrap.
//!
//! One run per connection, two roles. The server sends its identity
//! message immediately after accept:
//!
//! ```text
//! [i32 len][algorithm][i32 len][SPKI-DER public key]
//! ```
//!
//! The client answers with a session-key proposal:
//!
//! ```text
//! [nonce(8)][i32 ciphertext_len][RSA-OAEP ciphertext]
//! ```
//!
//! where the ciphertext transports freshly generated
//! [`SessionKeyMaterial`]. Both roles are fed inbound bytes
//! incrementally; a partial message suspends (`Ok(None)`) and is retried
//! on the next read event, never failing on short data.

use tracing::debug;

use crate::buffer::ByteFrame;
use crate::crypto::cipher::{
    CipherTransform, PublicEncryptor, ServerIdentity, SessionKeyMaterial,
};
use crate::crypto::framing::{
    generate_header_nonce, EncryptionReader, EncryptionWriter, HEADER_NONCE_LEN,
};
use crate::error::{constants, PeermuxError, Result};
use std::sync::Arc;

/// Build the identity message a server sends on accept.
pub fn identity_message(identity: &ServerIdentity) -> Result<Vec<u8>> {
    let mut frame = ByteFrame::new();
    frame.put_str(identity.algorithm());
    frame.put_blob(&identity.encoded_public_key()?);
    frame.flip();
    Ok(frame.take_remaining())
}

/// Product of a completed handshake run.
pub struct HandshakeOutcome {
    /// Bytes to send to the peer, if this step produced any.
    pub reply: Option<Vec<u8>>,
    material: SessionKeyMaterial,
    nonce: [u8; HEADER_NONCE_LEN],
}

impl HandshakeOutcome {
    /// The negotiated session key, for verification.
    pub fn key_bytes(&self) -> &[u8] {
        self.material.key_bytes()
    }

    pub fn transform(&self) -> CipherTransform {
        self.material.transform()
    }

    /// Build the matching reader/writer pair. Always installed together;
    /// the caller never holds one half without the other.
    pub fn into_channel(self) -> (Option<Vec<u8>>, EncryptionReader, EncryptionWriter) {
        let reader = EncryptionReader::new(self.nonce, self.material.decryptor());
        let writer = EncryptionWriter::new(self.nonce, self.material.encryptor());
        (self.reply, reader, writer)
    }
}

enum ClientState {
    AwaitIdentity,
    Complete,
}

/// Client role: waits for the server identity, generates and transports
/// the session key.
pub struct ClientHandshake {
    state: ClientState,
    transform: CipherTransform,
}

impl ClientHandshake {
    pub fn new() -> Self {
        Self {
            state: ClientState::AwaitIdentity,
            transform: CipherTransform::default(),
        }
    }

    /// Feed buffered inbound bytes. `Ok(None)` means more data is needed
    /// and nothing was consumed.
    pub fn advance(&mut self, inbox: &mut ByteFrame) -> Result<Option<HandshakeOutcome>> {
        match self.state {
            ClientState::Complete => Err(PeermuxError::Handshake(
                constants::ERR_HANDSHAKE_STATE.into(),
            )),
            ClientState::AwaitIdentity => {
                let mark = inbox.position();
                let Some(algorithm) = inbox.get_str_opt()? else {
                    return Ok(None);
                };
                let Some(encoded_key) = inbox.get_blob_opt()? else {
                    inbox.set_position(mark)?;
                    return Ok(None);
                };

                let encryptor = PublicEncryptor::from_encoded(&algorithm, &encoded_key)?;
                let material = SessionKeyMaterial::generate(self.transform);
                let nonce = generate_header_nonce();

                let ciphertext = encryptor.encrypt(&material.serialize())?;
                let mut reply = ByteFrame::with_capacity(
                    HEADER_NONCE_LEN + 4 + ciphertext.len(),
                );
                reply.put_slice(&nonce);
                reply.put_i32(ciphertext.len() as i32);
                reply.put_slice(&ciphertext);
                reply.flip();

                debug!(algorithm = %algorithm, "Client completed session bootstrap");
                self.state = ClientState::Complete;
                Ok(Some(HandshakeOutcome {
                    reply: Some(reply.take_remaining()),
                    material,
                    nonce,
                }))
            }
        }
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

enum ServerState {
    AwaitProposal,
    Complete,
}

/// Server role: recovers the client's session key with the long-lived
/// private key.
pub struct ServerHandshake {
    identity: Arc<ServerIdentity>,
    state: ServerState,
}

impl ServerHandshake {
    pub fn new(identity: Arc<ServerIdentity>) -> Self {
        Self {
            identity,
            state: ServerState::AwaitProposal,
        }
    }

    /// Feed buffered inbound bytes. `Ok(None)` means more data is needed
    /// and nothing was consumed.
    pub fn advance(&mut self, inbox: &mut ByteFrame) -> Result<Option<HandshakeOutcome>> {
        match self.state {
            ServerState::Complete => Err(PeermuxError::Handshake(
                constants::ERR_HANDSHAKE_STATE.into(),
            )),
            ServerState::AwaitProposal => {
                if inbox.remaining() < HEADER_NONCE_LEN + 4 {
                    return Ok(None);
                }
                let mark = inbox.position();
                let nonce_bytes = inbox.get_bytes(HEADER_NONCE_LEN)?;
                let len = inbox.get_i32()?;
                if len < 0 {
                    return Err(PeermuxError::ProtocolViolation(
                        constants::ERR_NEGATIVE_LENGTH.into(),
                    ));
                }
                if inbox.remaining() < len as usize {
                    inbox.set_position(mark)?;
                    return Ok(None);
                }
                let ciphertext = inbox.get_bytes(len as usize)?;

                let material = SessionKeyMaterial::deserialize(&self.identity.decrypt(&ciphertext)?)?;
                let mut nonce = [0u8; HEADER_NONCE_LEN];
                nonce.copy_from_slice(&nonce_bytes);

                debug!(transform = material.transform().name(), "Server accepted session key");
                self.state = ServerState::Complete;
                Ok(Some(HandshakeOutcome {
                    reply: None,
                    material,
                    nonce,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Arc<ServerIdentity> {
        // Small modulus keeps unit tests fast; production uses 2048.
        Arc::new(ServerIdentity::with_bits(1024).unwrap())
    }

    #[test]
    fn both_sides_derive_the_same_session_key() {
        let identity = identity();
        let mut client = ClientHandshake::new();
        let mut server = ServerHandshake::new(identity.clone());

        let mut client_inbox = ByteFrame::from_vec(identity_message(&identity).unwrap());
        let client_outcome = client.advance(&mut client_inbox).unwrap().unwrap();
        assert!(!client_inbox.has_remaining());

        let reply = client_outcome.reply.clone().unwrap();
        let mut server_inbox = ByteFrame::from_vec(reply);
        let server_outcome = server.advance(&mut server_inbox).unwrap().unwrap();

        assert_eq!(client_outcome.key_bytes(), server_outcome.key_bytes());
        assert_eq!(client_outcome.key_bytes().len(), 16);
        assert!(server_outcome.reply.is_none());
    }

    #[test]
    fn sealed_traffic_crosses_sides_for_multiple_messages() {
        let identity = identity();
        let mut client = ClientHandshake::new();
        let mut server = ServerHandshake::new(identity.clone());

        let mut client_inbox = ByteFrame::from_vec(identity_message(&identity).unwrap());
        let client_outcome = client.advance(&mut client_inbox).unwrap().unwrap();
        let mut server_inbox = ByteFrame::from_vec(client_outcome.reply.clone().unwrap());
        let server_outcome = server.advance(&mut server_inbox).unwrap().unwrap();

        let (_, client_reader, client_writer) = client_outcome.into_channel();
        let (_, server_reader, server_writer) = server_outcome.into_channel();

        for round in 0..4u8 {
            let msg = vec![round; 33];
            let mut stream = ByteFrame::from_vec(client_writer.seal_frame(&msg).unwrap());
            assert_eq!(server_reader.open_frame(&mut stream).unwrap().unwrap(), msg);

            let mut stream = ByteFrame::from_vec(server_writer.seal_frame(&msg).unwrap());
            assert_eq!(client_reader.open_frame(&mut stream).unwrap().unwrap(), msg);
        }
    }

    #[test]
    fn trickled_identity_suspends_then_completes() {
        let identity = identity();
        let mut client = ClientHandshake::new();
        let full = identity_message(&identity).unwrap();

        let mut inbox = ByteFrame::new();
        let mut outcome = None;
        for chunk in full.chunks(10) {
            inbox.put_slice(chunk);
            inbox.flip();
            if let Some(done) = client.advance(&mut inbox).unwrap() {
                outcome = Some(done);
                break;
            }
            assert_eq!(inbox.position(), 0, "suspension must not consume");
            inbox.compact();
        }
        assert!(outcome.unwrap().reply.is_some());
    }

    #[test]
    fn garbage_proposal_fails_key_decrypt() {
        let identity = identity();
        let mut server = ServerHandshake::new(identity);

        let mut inbox = ByteFrame::new();
        inbox.put_slice(&[0u8; HEADER_NONCE_LEN]);
        inbox.put_i32(128);
        inbox.put_slice(&[0x5A; 128]);
        inbox.flip();

        assert!(matches!(
            server.advance(&mut inbox),
            Err(PeermuxError::Handshake(_))
        ));
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let mut client = ClientHandshake::new();
        let mut inbox = ByteFrame::new();
        inbox.put_str("dsa-1024/legacy");
        inbox.put_blob(&[0u8; 32]);
        inbox.flip();
        assert!(matches!(
            client.advance(&mut inbox),
            Err(PeermuxError::Handshake(_))
        ));
    }

    #[test]
    fn advancing_a_finished_handshake_is_an_error() {
        let identity = identity();
        let mut client = ClientHandshake::new();
        let mut inbox = ByteFrame::from_vec(identity_message(&identity).unwrap());
        client.advance(&mut inbox).unwrap().unwrap();
        assert!(client.advance(&mut inbox).is_err());
    }
}
