//! Detached signatures over byte sequences.
//!
//! Two deployments are supported behind one trait: a shared-secret
//! HMAC-SHA256 scheme and an asymmetric Ed25519 scheme with split key roles
//! (the remote side's public key verifies inbound data, the local private
//! key signs outbound data). Signatures travel as raw bytes inside framed
//! packets and base64-encoded inside HTTP headers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("bad key material: {0}")]
    BadKey(String),

    #[error("sign failed: {0}")]
    Sign(String),
}

/// Computes and verifies detached signatures.
pub trait Signer: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignError>;

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;

    /// Byte length of every signature this signer produces.
    fn signature_len(&self) -> usize;

    /// Signs and renders the signature base64, the HTTP header transport form.
    fn sign_base64(&self, data: &[u8]) -> Result<String, SignError> {
        Ok(BASE64.encode(self.sign(data)?))
    }

    /// Verifies a base64-encoded signature as carried in an HTTP header.
    fn verify_base64(&self, data: &[u8], signature: &str) -> bool {
        match BASE64.decode(signature) {
            Ok(raw) => self.verify(data, &raw),
            Err(_) => false,
        }
    }
}

/// Shared-secret HMAC-SHA256 signer. 32-byte signatures.
pub struct HmacSha256Signer {
    secret: Vec<u8>,
}

impl HmacSha256Signer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        HmacSha256Signer { secret: secret.into() }
    }
}

impl Signer for HmacSha256Signer {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(data);
        // Constant-time comparison.
        mac.verify_slice(signature).is_ok()
    }

    fn signature_len(&self) -> usize {
        32
    }
}

/// Ed25519 signer with split key material: the remote peer's public key
/// verifies what they sent, the local private key signs what we send.
/// 64-byte signatures.
pub struct Ed25519Signer {
    remote_public: VerifyingKey,
    local_private: SigningKey,
}

impl Ed25519Signer {
    pub fn new(remote_public: VerifyingKey, local_private: SigningKey) -> Self {
        Ed25519Signer { remote_public, local_private }
    }

    /// Builds a signer from base64-encoded key material, the provisioning
    /// format. Fails on malformed base64 or wrong key lengths.
    pub fn from_base64(remote_public: &str, local_private: &str) -> Result<Self, SignError> {
        let public_bytes = BASE64
            .decode(remote_public)
            .map_err(|e| SignError::BadKey(format!("remote public key: {e}")))?;
        let private_bytes = BASE64
            .decode(local_private)
            .map_err(|e| SignError::BadKey(format!("local private key: {e}")))?;

        let public_arr: [u8; 32] = public_bytes
            .try_into()
            .map_err(|_| SignError::BadKey("remote public key must be 32 bytes".to_string()))?;
        let private_arr: [u8; 32] = private_bytes
            .try_into()
            .map_err(|_| SignError::BadKey("local private key must be 32 bytes".to_string()))?;

        let remote_public = VerifyingKey::from_bytes(&public_arr)
            .map_err(|e| SignError::BadKey(format!("remote public key: {e}")))?;
        Ok(Ed25519Signer {
            remote_public,
            local_private: SigningKey::from_bytes(&private_arr),
        })
    }

    pub fn remote_public_base64(&self) -> String {
        BASE64.encode(self.remote_public.as_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignError> {
        Ok(self.local_private.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        self.remote_public.verify(data, &sig).is_ok()
    }

    fn signature_len(&self) -> usize {
        64
    }
}

/// Fresh Ed25519 keypair from the process RNG. Built from raw random bytes
/// to stay off the rand_core version boundary between rand and dalek.
pub fn generate_ed25519_keypair() -> (SigningKey, VerifyingKey) {
    use rand::Rng;
    let secret: [u8; 32] = rand::rng().random();
    let signing = SigningKey::from_bytes(&secret);
    let verifying = signing.verifying_key();
    (signing, verifying)
}
