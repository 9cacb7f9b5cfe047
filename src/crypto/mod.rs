//! Signatures and authenticated payload encryption.

pub mod cryptor;
pub mod signer;

pub use cryptor::{AesGcmCryptor, CryptError, Cryptor};
pub use signer::{generate_ed25519_keypair, Ed25519Signer, HmacSha256Signer, SignError, Signer};
