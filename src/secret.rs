use secrecy::{ExposeSecret, SecretSlice};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypt::MASTER_KEY_LEN;
use crate::error::{ConfigurationError, DecryptionError};

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// A credential private key as it is compiled into the device image.
///
/// Wire format: `salt(16) || nonce(12) || ciphertext || tag(16)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyMaterial {
    /// Salt mixed with the credential diversifier to derive the
    /// key-encryption key. Unique per sealed blob.
    salt: [u8; MASTER_KEY_LEN],
    /// Nonce used for encryption
    nonce: [u8; NONCE_LEN],
    /// Ciphertext with the authentication tag appended
    ciphertext: Vec<u8>,
}

impl EncryptedKeyMaterial {
    pub fn new(salt: [u8; MASTER_KEY_LEN], nonce: [u8; NONCE_LEN], ciphertext: Vec<u8>) -> Self {
        Self {
            salt,
            nonce,
            ciphertext,
        }
    }

    /// Parse the wire format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecryptionError> {
        let header = MASTER_KEY_LEN + NONCE_LEN;
        if bytes.len() < header + TAG_LEN {
            return Err(DecryptionError::Truncated { len: bytes.len() });
        }

        let mut salt = [0u8; MASTER_KEY_LEN];
        salt.copy_from_slice(&bytes[..MASTER_KEY_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[MASTER_KEY_LEN..header]);

        Ok(Self::new(salt, nonce, bytes[header..].to_vec()))
    }

    /// Parse a hex encoded blob, as found in configuration files.
    pub fn from_hex(what: &'static str, encoded: &str) -> Result<Self, ConfigurationError> {
        let bytes = decode_hex(what, encoded)?;
        Self::from_bytes(&bytes).map_err(|e| ConfigurationError::Malformed {
            what,
            reason: e.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MASTER_KEY_LEN + NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn salt(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.salt
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &Vec<u8> {
        &self.ciphertext
    }
}

/// Decrypted credential key material, held only for the token session.
pub struct PlaintextKeyMaterial {
    key: SecretSlice<u8>,
}

impl PlaintextKeyMaterial {
    pub fn new(plaintext: Zeroizing<Vec<u8>>) -> Self {
        Self {
            key: SecretSlice::new(plaintext.as_slice().to_vec().into()),
        }
    }

    pub fn expose(&self) -> &[u8] {
        self.key.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.expose().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PlaintextKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlaintextKeyMaterial([REDACTED; {}])", self.len())
    }
}

pub(crate) fn decode_hex(what: &'static str, encoded: &str) -> Result<Vec<u8>, ConfigurationError> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Err(ConfigurationError::Missing { what });
    }
    hex::decode(trimmed).map_err(|e| ConfigurationError::Malformed {
        what,
        reason: e.to_string(),
    })
}
