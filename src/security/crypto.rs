use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;

use crate::error::ConfigError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for credentials at rest.
///
/// Ciphertext wire form is base64(nonce || ciphertext+tag).
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
    ephemeral: bool,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("ephemeral", &self.ephemeral)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cipher operation failed")]
pub struct CipherError;

impl TokenCipher {
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, ConfigError> {
        if key.len() != KEY_LEN {
            return Err(ConfigError::Invalid {
                name: "TOKEN_ENCRYPTION_KEY",
                reason: format!("expected {} key bytes, got {}", KEY_LEN, key.len()),
            });
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ConfigError::Invalid {
            name: "TOKEN_ENCRYPTION_KEY",
            reason: "unusable key material".to_string(),
        })?;
        Ok(Self {
            cipher,
            ephemeral: false,
        })
    }

    /// Accepts standard or url-safe base64, padded or not.
    pub fn from_base64(encoded: &str) -> Result<Self, ConfigError> {
        let trimmed = encoded.trim();
        let bytes = STANDARD
            .decode(trimmed)
            .or_else(|_| URL_SAFE.decode(trimmed))
            .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
            .map_err(|_| ConfigError::Invalid {
                name: "TOKEN_ENCRYPTION_KEY",
                reason: "not valid base64".to_string(),
            })?;
        Self::from_key_bytes(&bytes)
    }

    /// Process-local key. Anything written with it is lost on restart.
    pub fn ephemeral() -> Self {
        let key = generate_key();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self {
            cipher,
            ephemeral: true,
        }
    }

    /// Configured key when present, otherwise an ephemeral one with a warning.
    pub fn from_config(encoded: Option<&str>) -> Result<Self, ConfigError> {
        match encoded {
            Some(key) => Self::from_base64(key),
            None => {
                warn!(
                    "TOKEN_ENCRYPTION_KEY not set; using an ephemeral key. \
                     Stored credentials will be unrecoverable after restart"
                );
                Ok(Self::ephemeral())
            }
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CipherError> {
        let raw = STANDARD.decode(encoded).map_err(|_| CipherError)?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CipherError)?;
        String::from_utf8(plaintext).map_err(|_| CipherError)
    }
}

/// Fresh random key, base64 encoded for configuration.
pub fn generate_key_base64() -> String {
    STANDARD.encode(generate_key())
}

fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}
