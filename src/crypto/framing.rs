//! Encrypted frame layer atop [`ByteFrame`].
//!
//! Both directions of a connection share one random 8-byte header nonce
//! chosen by the client during the handshake. Every encrypted frame is
//! `[nonce(8)][i32 ciphertext_len][IV || ciphertext]`; the nonce lets a
//! reader recognize and decrypt an encrypted frame even when plaintext
//! frames are interleaved on the same stream.

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::trace;

use crate::buffer::ByteFrame;
use crate::crypto::cipher::{SymmetricDecryptor, SymmetricEncryptor};
use crate::error::{constants, PeermuxError, Result};

/// Length of the shared per-connection header nonce.
pub const HEADER_NONCE_LEN: usize = 8;

/// Generate a fresh header nonce for a new connection.
pub fn generate_header_nonce() -> [u8; HEADER_NONCE_LEN] {
    let mut nonce = [0u8; HEADER_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seals plaintext into nonce-headed encrypted frames.
pub struct EncryptionWriter {
    nonce: [u8; HEADER_NONCE_LEN],
    encryptor: SymmetricEncryptor,
}

impl EncryptionWriter {
    pub fn new(nonce: [u8; HEADER_NONCE_LEN], encryptor: SymmetricEncryptor) -> Self {
        Self { nonce, encryptor }
    }

    pub fn nonce(&self) -> &[u8; HEADER_NONCE_LEN] {
        &self.nonce
    }

    /// Produce a complete encrypted frame for `plain`.
    pub fn seal_frame(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.encryptor.seal(plain)?;
        let mut frame = ByteFrame::with_capacity(HEADER_NONCE_LEN + 4 + sealed.len());
        frame.put_slice(&self.nonce);
        frame.put_i32(sealed.len() as i32);
        frame.put_slice(&sealed);
        frame.flip();
        trace!(bytes = sealed.len(), "Sealed encrypted frame");
        Ok(frame.take_remaining())
    }
}

/// Recognizes and opens nonce-headed encrypted frames.
pub struct EncryptionReader {
    nonce: [u8; HEADER_NONCE_LEN],
    decryptor: SymmetricDecryptor,
}

impl EncryptionReader {
    pub fn new(nonce: [u8; HEADER_NONCE_LEN], decryptor: SymmetricDecryptor) -> Self {
        Self { nonce, decryptor }
    }

    /// Peek whether the frame at the cursor starts with our nonce. A
    /// short buffer reads as "not encrypted (yet)" — callers treat that
    /// as a suspension, not a classification.
    pub fn is_encrypted(&self, frame: &ByteFrame) -> bool {
        let head = frame.remaining_slice();
        head.len() >= HEADER_NONCE_LEN && head[..HEADER_NONCE_LEN] == self.nonce
    }

    /// Open the encrypted frame at the cursor.
    ///
    /// Returns `Ok(None)` without consuming anything when the frame is
    /// not yet fully buffered, or when the bytes at the cursor do not
    /// start with our nonce (a plaintext frame). A negative length or a
    /// failed decrypt is an error.
    pub fn open_frame(&self, frame: &mut ByteFrame) -> Result<Option<Vec<u8>>> {
        if !self.is_encrypted(frame) {
            return Ok(None);
        }
        if frame.remaining() < HEADER_NONCE_LEN + 4 {
            return Ok(None);
        }

        let mark = frame.position();
        frame.advance(HEADER_NONCE_LEN)?;
        let len = frame.get_i32()?;
        if len < 0 {
            return Err(PeermuxError::ProtocolViolation(
                constants::ERR_NEGATIVE_LENGTH.into(),
            ));
        }
        if frame.remaining() < len as usize {
            frame.set_position(mark)?;
            return Ok(None);
        }

        let sealed = frame.get_bytes(len as usize)?;
        let plain = self.decryptor.open(&sealed)?;
        trace!(bytes = plain.len(), "Opened encrypted frame");
        Ok(Some(plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::{CipherTransform, SessionKeyMaterial};

    fn pair() -> (EncryptionWriter, EncryptionReader) {
        let material = SessionKeyMaterial::generate(CipherTransform::Aes128CbcPkcs7);
        let nonce = generate_header_nonce();
        (
            EncryptionWriter::new(nonce, material.encryptor()),
            EncryptionReader::new(nonce, material.decryptor()),
        )
    }

    #[test]
    fn sealed_frames_roundtrip_in_sequence() {
        let (writer, reader) = pair();
        let mut stream = ByteFrame::new();
        for i in 0..5u8 {
            stream.put_slice(&writer.seal_frame(&[i; 20]).unwrap());
        }
        stream.flip();
        for i in 0..5u8 {
            let plain = reader.open_frame(&mut stream).unwrap().unwrap();
            assert_eq!(plain, vec![i; 20]);
        }
        assert!(!stream.has_remaining());
    }

    #[test]
    fn plaintext_frames_are_left_untouched() {
        let (_, reader) = pair();
        let mut stream = ByteFrame::from_slice(b"plaintext that is long enough");
        assert!(!reader.is_encrypted(&stream));
        assert!(reader.open_frame(&mut stream).unwrap().is_none());
        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn partial_frame_suspends_without_consuming() {
        let (writer, reader) = pair();
        let full = writer.seal_frame(b"split me").unwrap();

        let mut stream = ByteFrame::new();
        stream.put_slice(&full[..full.len() - 3]);
        stream.flip();
        assert!(reader.is_encrypted(&stream));
        assert!(reader.open_frame(&mut stream).unwrap().is_none());
        assert_eq!(stream.position(), 0);

        stream.compact();
        stream.put_slice(&full[full.len() - 3..]);
        stream.flip();
        assert_eq!(reader.open_frame(&mut stream).unwrap().unwrap(), b"split me");
    }

    #[test]
    fn mixed_plain_and_encrypted_stream() {
        let (writer, reader) = pair();
        let mut stream = ByteFrame::new();
        stream.put_slice(&writer.seal_frame(b"secret").unwrap());
        stream.flip();

        assert!(reader.is_encrypted(&stream));
        assert_eq!(reader.open_frame(&mut stream).unwrap().unwrap(), b"secret");

        // Followed by plaintext the reader refuses to touch.
        stream.compact();
        stream.put_slice(b"plain frame bytes");
        stream.flip();
        assert!(!reader.is_encrypted(&stream));
        assert!(reader.open_frame(&mut stream).unwrap().is_none());
    }

    #[test]
    fn corrupted_ciphertext_fails_decryption() {
        let (writer, reader) = pair();
        let mut bytes = writer.seal_frame(b"payload").unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut stream = ByteFrame::from_vec(bytes);
        assert!(matches!(
            reader.open_frame(&mut stream),
            Err(PeermuxError::DecryptionFailure)
        ));
    }
}
