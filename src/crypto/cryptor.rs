//! Authenticated symmetric payload encryption.
//!
//! AES-256-GCM with a random 12-byte nonce per message.
//! Wire format: `nonce (12 bytes) || ciphertext (includes 16-byte GCM tag)`.
//! Keys are provisioned out-of-band, base64-encoded.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("bad key material: {0}")]
    BadKey(String),

    // Deliberately detail-free: crypt failures reach clients as status codes
    // and must not describe what went wrong.
    #[error("encrypt failed")]
    Encrypt,

    #[error("decrypt failed")]
    Decrypt,
}

/// Authenticated encryption over byte sequences: ciphertexts are both
/// confidential and tamper-evident.
pub trait Cryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptError>;
}

pub struct AesGcmCryptor {
    cipher: Aes256Gcm,
}

impl AesGcmCryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        AesGcmCryptor {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Builds a cryptor from a base64-encoded 256-bit key, the provisioning
    /// format. Fails on malformed base64 or wrong key length.
    pub fn from_base64(key: &str) -> Result<Self, CryptError> {
        let bytes = BASE64
            .decode(key)
            .map_err(|e| CryptError::BadKey(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptError::BadKey("key must be 32 bytes".to_string()))?;
        Ok(AesGcmCryptor::new(&arr))
    }
}

impl Cryptor for AesGcmCryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptError> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptError::Decrypt);
        }
        let nonce = Nonce::from_slice(&ciphertext[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &ciphertext[NONCE_LEN..])
            .map_err(|_| CryptError::Decrypt)
    }
}
