//! Symmetric payload encryption with key rotation.
//!
//! Uses XChaCha20-Poly1305. Each configured key string is stretched to a
//! 256-bit key with SHA-256. The first key encrypts; every key is tried in
//! order when decrypting, so a new key can be put first while the old one
//! still opens messages already in flight.
//!
//! Token layout: `nonce (24 bytes) || ciphertext+tag`.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use sha2::{Digest, Sha256};

/// XChaCha20 nonce length.
pub const NONCE_LEN: usize = 24;
/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("No encryption keys configured")]
    NoKeys,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Token too short ({0} bytes)")]
    Truncated(usize),

    #[error("No configured key could decrypt the token")]
    NoMatchingKey,
}

/// One derived key.
#[derive(Clone)]
struct DerivedKey {
    cipher: XChaCha20Poly1305,
}

impl DerivedKey {
    fn derive(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        Self {
            cipher: XChaCha20Poly1305::new(&digest),
        }
    }
}

/// Encrypter/decrypter over an ordered key list.
#[derive(Clone)]
pub struct Crypter {
    keys: Vec<DerivedKey>,
}

impl std::fmt::Debug for Crypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypter")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl Crypter {
    pub fn new<S: AsRef<str>>(secrets: &[S]) -> Result<Self, CryptoError> {
        if secrets.is_empty() {
            return Err(CryptoError::NoKeys);
        }
        Ok(Self {
            keys: secrets.iter().map(|s| DerivedKey::derive(s.as_ref())).collect(),
        })
    }

    /// Encrypt with the first key under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.keys.first().ok_or(CryptoError::NoKeys)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = key
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(nonce.as_slice());
        token.extend_from_slice(&ciphertext);
        Ok(token)
    }

    /// Decrypt with the first key that authenticates the token.
    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if token.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(token.len()));
        }
        let (nonce, ciphertext) = token.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce);

        self.keys
            .iter()
            .find_map(|key| key.cipher.decrypt(nonce, ciphertext).ok())
            .ok_or(CryptoError::NoMatchingKey)
    }
}
