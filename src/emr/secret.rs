//! Secret-bearing values.
//!
//! [`SecretString`] keeps client secrets and provider tokens out of `Debug`
//! output and serialized forms. [`TokenCipher`] encrypts tokens before they reach
//! a session backend and decrypts them on the way back out.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use super::EmrError;

/// A string that must never be logged or serialized.
///
/// Provider token responses deserialize straight into it. It has no `Serialize`
/// or `Display` impl.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext for an outbound request
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretString)
    }
}

/// Token ciphertext as stored by a session backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedToken {
    /// Base64 12-byte nonce
    pub nonce: String,
    /// Base64 ciphertext with the Poly1305 tag appended
    pub ciphertext: String,
}

/// ChaCha20-Poly1305 encryption for tokens at rest.
///
/// Callers pass the session key as associated data, so a ciphertext copied onto
/// another user's or system's record fails to decrypt.
pub struct TokenCipher {
    cipher: ChaCha20Poly1305,
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn encrypt(&self, token: &SecretString, aad: &[u8]) -> Result<EncryptedToken, EmrError> {
        let nonce_bytes: [u8; 12] = rand::thread_rng().gen();
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: token.expose().as_bytes(),
                    aad,
                },
            )
            .map_err(|_| EmrError::Crypto)?;

        Ok(EncryptedToken {
            nonce: STANDARD.encode(nonce_bytes),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    pub fn decrypt(&self, token: &EncryptedToken, aad: &[u8]) -> Result<SecretString, EmrError> {
        let nonce = STANDARD.decode(&token.nonce).map_err(|_| EmrError::Crypto)?;
        if nonce.len() != 12 {
            return Err(EmrError::Crypto);
        }
        let ciphertext = STANDARD
            .decode(&token.ciphertext)
            .map_err(|_| EmrError::Crypto)?;

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad,
                },
            )
            .map_err(|_| EmrError::Crypto)?;

        String::from_utf8(plaintext)
            .map(SecretString)
            .map_err(|_| EmrError::Crypto)
    }
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}
