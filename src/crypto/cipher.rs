//! Cipher wrappers: RSA identity for the bootstrap, AES-CBC for the
//! session.
//!
//! Key material is zeroized on drop. Every fallible primitive maps into
//! the crate error taxonomy; decryption failures never reveal why.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::buffer::ByteFrame;
use crate::error::{constants, PeermuxError, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Wire label for the bootstrap algorithm, sent in the identity message.
pub const ASYMMETRIC_ALGORITHM: &str = "rsa-2048/oaep-sha256";

/// Default modulus size for generated identities.
pub const DEFAULT_RSA_BITS: usize = 2048;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Symmetric transform negotiated during the handshake. The label and
/// IV length travel on the wire so an unknown transform is rejected
/// explicitly rather than misinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherTransform {
    #[default]
    Aes128CbcPkcs7,
}

impl CipherTransform {
    pub fn name(self) -> &'static str {
        match self {
            CipherTransform::Aes128CbcPkcs7 => "aes-128/cbc-pkcs7",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherTransform::Aes128CbcPkcs7 => 16,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            CipherTransform::Aes128CbcPkcs7 => 16,
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "aes-128/cbc-pkcs7" => Ok(CipherTransform::Aes128CbcPkcs7),
            _ => Err(PeermuxError::Handshake(
                constants::ERR_UNKNOWN_TRANSFORM.into(),
            )),
        }
    }
}

/// Long-lived asymmetric key pair held by the server side.
pub struct ServerIdentity {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl ServerIdentity {
    /// Generate a fresh identity with the default modulus size.
    pub fn generate() -> Result<Self> {
        Self::with_bits(DEFAULT_RSA_BITS)
    }

    pub fn with_bits(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| PeermuxError::Custom(format!("RSA key generation failed: {e}")))?;
        let public = RsaPublicKey::from(&private);
        debug!(bits, "Generated server identity");
        Ok(Self { private, public })
    }

    pub fn algorithm(&self) -> &'static str {
        ASYMMETRIC_ALGORITHM
    }

    /// SPKI DER encoding of the public half, as sent on the wire.
    pub fn encoded_public_key(&self) -> Result<Vec<u8>> {
        Ok(self
            .public
            .to_public_key_der()
            .map_err(|e| PeermuxError::Custom(format!("Public key encoding failed: {e}")))?
            .into_vec())
    }

    /// Recover session key material transported under our public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(oaep(), ciphertext)
            .map_err(|_| PeermuxError::Handshake(constants::ERR_KEY_DECRYPT_FAILED.into()))
    }
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("algorithm", &ASYMMETRIC_ALGORITHM)
            .finish_non_exhaustive()
    }
}

/// Encrypting half built by the client from a peer's encoded public key.
#[derive(Debug)]
pub struct PublicEncryptor {
    key: RsaPublicKey,
}

impl PublicEncryptor {
    pub fn from_encoded(algorithm: &str, der: &[u8]) -> Result<Self> {
        if algorithm != ASYMMETRIC_ALGORITHM {
            return Err(PeermuxError::Handshake(
                constants::ERR_UNKNOWN_ALGORITHM.into(),
            ));
        }
        let key = RsaPublicKey::from_public_key_der(der)
            .map_err(|_| PeermuxError::Handshake(constants::ERR_BAD_PUBLIC_KEY.into()))?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        self.key
            .encrypt(&mut OsRng, oaep(), plain)
            .map_err(|_| PeermuxError::EncryptionFailure)
    }
}

/// Session key plus the transform it belongs to, as generated by the
/// client and recovered by the server. Serializes to
/// `[i32 key_len][key][i32 name_len][name][i32 iv_len]`.
pub struct SessionKeyMaterial {
    key: Zeroizing<Vec<u8>>,
    transform: CipherTransform,
}

impl SessionKeyMaterial {
    /// Generate a fresh random key for `transform`.
    pub fn generate(transform: CipherTransform) -> Self {
        let mut key = vec![0u8; transform.key_len()];
        OsRng.fill_bytes(&mut key);
        Self {
            key: Zeroizing::new(key),
            transform,
        }
    }

    pub fn transform(&self) -> CipherTransform {
        self.transform
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = ByteFrame::new();
        frame.put_blob(&self.key);
        frame.put_str(self.transform.name());
        frame.put_i32(self.transform.iv_len() as i32);
        frame.flip();
        frame.take_remaining()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut frame = ByteFrame::from_slice(bytes);
        let key = frame
            .get_blob_opt()?
            .ok_or_else(|| PeermuxError::Handshake(constants::ERR_BAD_KEY_MATERIAL.into()))?;
        let name = frame
            .get_str_opt()?
            .ok_or_else(|| PeermuxError::Handshake(constants::ERR_BAD_KEY_MATERIAL.into()))?;
        let iv_len = frame
            .get_i32()
            .map_err(|_| PeermuxError::Handshake(constants::ERR_BAD_KEY_MATERIAL.into()))?;

        let transform = CipherTransform::from_name(&name)?;
        if key.len() != transform.key_len() || iv_len as usize != transform.iv_len() {
            return Err(PeermuxError::Handshake(
                constants::ERR_BAD_KEY_MATERIAL.into(),
            ));
        }
        Ok(Self {
            key: Zeroizing::new(key),
            transform,
        })
    }

    pub fn encryptor(&self) -> SymmetricEncryptor {
        SymmetricEncryptor {
            key: self.key.clone(),
            transform: self.transform,
        }
    }

    pub fn decryptor(&self) -> SymmetricDecryptor {
        SymmetricDecryptor {
            key: self.key.clone(),
            transform: self.transform,
        }
    }
}

impl std::fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeyMaterial")
            .field("transform", &self.transform.name())
            .finish_non_exhaustive()
    }
}

/// Symmetric sealing half. `seal` picks a fresh random IV per frame and
/// returns `IV || ciphertext`.
pub struct SymmetricEncryptor {
    key: Zeroizing<Vec<u8>>,
    transform: CipherTransform,
}

impl SymmetricEncryptor {
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        match self.transform {
            CipherTransform::Aes128CbcPkcs7 => {
                let mut iv = vec![0u8; self.transform.iv_len()];
                OsRng.fill_bytes(&mut iv);
                let cipher = Aes128CbcEnc::new_from_slices(&self.key, &iv)
                    .map_err(|_| PeermuxError::EncryptionFailure)?;
                let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plain);
                iv.extend_from_slice(&ciphertext);
                Ok(iv)
            }
        }
    }
}

/// Symmetric opening half, the inverse of [`SymmetricEncryptor::seal`].
pub struct SymmetricDecryptor {
    key: Zeroizing<Vec<u8>>,
    transform: CipherTransform,
}

impl SymmetricDecryptor {
    pub fn open(&self, iv_and_ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.transform {
            CipherTransform::Aes128CbcPkcs7 => {
                let iv_len = self.transform.iv_len();
                if iv_and_ciphertext.len() < iv_len {
                    return Err(PeermuxError::DecryptionFailure);
                }
                let (iv, ciphertext) = iv_and_ciphertext.split_at(iv_len);
                let cipher = Aes128CbcDec::new_from_slices(&self.key, iv)
                    .map_err(|_| PeermuxError::DecryptionFailure)?;
                cipher
                    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| PeermuxError::DecryptionFailure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_seal_open_roundtrip() {
        let material = SessionKeyMaterial::generate(CipherTransform::Aes128CbcPkcs7);
        let enc = material.encryptor();
        let dec = material.decryptor();

        for msg in [&b""[..], b"x", b"hello world", &[0xAA; 1000][..]] {
            let sealed = enc.seal(msg).unwrap();
            assert_ne!(&sealed[16..], msg);
            assert_eq!(dec.open(&sealed).unwrap(), msg);
        }
    }

    #[test]
    fn fresh_iv_per_frame() {
        let material = SessionKeyMaterial::generate(CipherTransform::Aes128CbcPkcs7);
        let enc = material.encryptor();
        let a = enc.seal(b"same plaintext").unwrap();
        let b = enc.seal(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn open_rejects_truncated_input() {
        let material = SessionKeyMaterial::generate(CipherTransform::Aes128CbcPkcs7);
        let dec = material.decryptor();
        assert!(matches!(
            dec.open(&[0u8; 5]),
            Err(PeermuxError::DecryptionFailure)
        ));
    }

    #[test]
    fn key_material_serialization_roundtrip() {
        let material = SessionKeyMaterial::generate(CipherTransform::Aes128CbcPkcs7);
        let bytes = material.serialize();
        let restored = SessionKeyMaterial::deserialize(&bytes).unwrap();
        assert_eq!(restored.key_bytes(), material.key_bytes());
        assert_eq!(restored.transform(), material.transform());
    }

    #[test]
    fn key_material_rejects_wrong_key_length() {
        let mut frame = ByteFrame::new();
        frame.put_blob(&[0u8; 7]);
        frame.put_str("aes-128/cbc-pkcs7");
        frame.put_i32(16);
        frame.flip();
        let result = SessionKeyMaterial::deserialize(frame.remaining_slice());
        assert!(matches!(result, Err(PeermuxError::Handshake(_))));
    }

    #[test]
    fn unknown_transform_rejected() {
        assert!(matches!(
            CipherTransform::from_name("des-56/ecb"),
            Err(PeermuxError::Handshake(_))
        ));
    }
}
