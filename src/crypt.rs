use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretSlice};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{DecryptionError, KeyDerivationError};
use crate::secret::{EncryptedKeyMaterial, NONCE_LEN, PlaintextKeyMaterial};

/// Length of every key produced by the key store.
pub const MASTER_KEY_LEN: usize = 16;

/// Length of a session key expanded from a master key.
pub const SESSION_KEY_LEN: usize = 32;

/// A struct containing a key derived from the hardware root of trust,
/// which can then be used to derive other keys from.
///
/// A `MasterKey` exists only for the lifetime of a boot session. It is
/// never persisted and is zeroed when dropped.
pub struct MasterKey {
    key: SecretSlice<u8>,
}

impl MasterKey {
    pub fn from_slice(key: &[u8]) -> Result<Self, KeyDerivationError> {
        if key.len() != MASTER_KEY_LEN {
            return Err(KeyDerivationError::KeyLength {
                expected: MASTER_KEY_LEN,
                actual: key.len(),
            });
        }
        Ok(Self {
            key: SecretSlice::new(key.to_vec().into()),
        })
    }

    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

impl Zeroize for MasterKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for MasterKey {}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// A session key derived from a MasterKey
///
/// Used by the token protocol layer to wrap and unwrap per-application key
/// handles. Two different `info` labels never yield the same key.
#[derive(Clone, Debug)]
pub struct SessionKey {
    key: SecretSlice<u8>,
}

impl SessionKey {
    pub fn new(
        master_key: &MasterKey,
        starting_salt: Option<&[u8]>,
        info: &[u8],
    ) -> Result<Self, KeyDerivationError> {
        if info.is_empty() {
            return Err(KeyDerivationError::Engine(
                "session key label cannot be empty".to_string(),
            ));
        }

        let mut key = [0u8; SESSION_KEY_LEN];
        let hkdf = Hkdf::<sha2::Sha256>::new(starting_salt, master_key.key().expose_secret());
        hkdf.expand(info, &mut key)
            .map_err(|e| KeyDerivationError::Engine(e.to_string()))?;

        let session_key = Self {
            key: SecretSlice::new(key.to_vec().into()),
        };

        key.zeroize();

        Ok(session_key)
    }

    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }
}

impl Zeroize for SessionKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for SessionKey {}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Encrypt key material under `key` with a fresh random nonce.
pub fn seal(
    key: &MasterKey,
    salt: [u8; MASTER_KEY_LEN],
    plaintext: &[u8],
) -> Result<EncryptedKeyMaterial, DecryptionError> {
    let cipher = Aes128Gcm::new_from_slice(key.key().expose_secret())
        .map_err(|_| DecryptionError::Encryption)?;
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| DecryptionError::Encryption)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce.as_slice());
    Ok(EncryptedKeyMaterial::new(salt, nonce_bytes, ciphertext))
}

/// Authenticated decryption of key material.
///
/// Nothing is returned unless the tag verifies; the plaintext buffer is
/// moved straight into zeroizing storage.
pub fn open(
    key: &MasterKey,
    material: &EncryptedKeyMaterial,
) -> Result<PlaintextKeyMaterial, DecryptionError> {
    let cipher = Aes128Gcm::new_from_slice(key.key().expose_secret())
        .map_err(|_| DecryptionError::Authentication)?;
    let nonce = Nonce::from_slice(material.nonce());
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(nonce, material.ciphertext().as_slice())
            .map_err(|_| DecryptionError::Authentication)?,
    );
    Ok(PlaintextKeyMaterial::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> MasterKey {
        MasterKey::from_slice(&[byte; MASTER_KEY_LEN]).unwrap()
    }

    #[test]
    fn test_master_key_length_checked() {
        let err = MasterKey::from_slice(&[0u8; 32]).unwrap_err();
        assert!(matches!(
            err,
            KeyDerivationError::KeyLength {
                expected: 16,
                actual: 32
            }
        ));
    }

    #[test]
    fn test_master_key_debug_redacted() {
        assert_eq!(format!("{:?}", key(7)), "MasterKey([REDACTED])");
    }

    #[test]
    fn test_seal_open() {
        let master = key(1);
        let sealed = seal(&master, [9u8; MASTER_KEY_LEN], b"token private key").unwrap();
        assert_ne!(sealed.ciphertext().as_slice(), b"token private key");

        let opened = open(&master, &sealed).unwrap();
        assert_eq!(opened.expose(), b"token private key");
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let sealed = seal(&key(1), [0u8; MASTER_KEY_LEN], b"secret").unwrap();
        let err = open(&key(2), &sealed).unwrap_err();
        assert_eq!(err, DecryptionError::Authentication);
    }

    #[test]
    fn test_open_tampered_fails() {
        let master = key(3);
        let sealed = seal(&master, [0u8; MASTER_KEY_LEN], b"secret").unwrap();
        let mut bytes = sealed.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = EncryptedKeyMaterial::from_bytes(&bytes).unwrap();

        assert_eq!(
            open(&master, &tampered).unwrap_err(),
            DecryptionError::Authentication
        );
    }

    #[test]
    fn test_session_keys_differ_per_label() {
        let master = key(4);
        let a = SessionKey::new(&master, None, b"app-a").unwrap();
        let b = SessionKey::new(&master, None, b"app-b").unwrap();
        assert_ne!(a.key().expose_secret(), b.key().expose_secret());
        assert_eq!(a.key().expose_secret().len(), SESSION_KEY_LEN);

        let again = SessionKey::new(&master, None, b"app-a").unwrap();
        assert_eq!(a.key().expose_secret(), again.key().expose_secret());
    }

    #[test]
    fn test_session_key_rejects_empty_label() {
        assert!(SessionKey::new(&key(5), None, b"").is_err());
    }
}
