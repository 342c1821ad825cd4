//! Message serialization.
//!
//! Messages travel as JSON bytes, optionally sealed by [`crypto::Crypter`].
//! Encoding and decoding happen on the calling thread, never on the
//! connection thread.

pub mod crypto;

use tracing::debug;

use crate::layer::{LayerError, Message, Result};
use crypto::{CryptoError, Crypter};

/// Encodes messages for the wire and decodes them back.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    crypter: Option<Crypter>,
}

impl MessageCodec {
    /// Plain JSON codec.
    pub fn plain() -> Self {
        Self { crypter: None }
    }

    /// Codec encrypting with `keys[0]` and decrypting with any of `keys`.
    ///
    /// An empty key list gives a plain codec.
    pub fn with_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        if keys.is_empty() {
            return Ok(Self::plain());
        }
        let crypter = Crypter::new(keys).map_err(|e| LayerError::Config(e.to_string()))?;
        Ok(Self {
            crypter: Some(crypter),
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypter.is_some()
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let body =
            serde_json::to_vec(message).map_err(|e| LayerError::Serialization(e.to_string()))?;
        match &self.crypter {
            Some(crypter) => crypter.encrypt(&body).map_err(|e| match e {
                CryptoError::EncryptionFailed(msg) => LayerError::Serialization(msg),
                other => LayerError::Config(other.to_string()),
            }),
            None => Ok(body),
        }
    }

    /// Decode a payload.
    ///
    /// With keys configured, anything that does not decrypt is
    /// `UndecryptablePayload`, plaintext included.
    pub fn decode(&self, payload: &[u8]) -> Result<Message> {
        let body = match &self.crypter {
            Some(crypter) => crypter.decrypt(payload).map_err(|e| {
                debug!(error = %e, len = payload.len(), "Payload did not decrypt");
                LayerError::UndecryptablePayload(e.to_string())
            })?,
            None => payload.to_vec(),
        };
        serde_json::from_slice(&body).map_err(|e| LayerError::Serialization(e.to_string()))
    }
}
