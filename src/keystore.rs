//! Secure key store.
//!
//! Keys are derived either inside a hardware engine that never exposes its
//! root secret, or, on boards without one, by PBKDF2 over the device unique
//! ID and the secure element identity. The strategy is picked once by
//! [`SecureKeyStore::probe`] and never re-checked.

use std::sync::Mutex;

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::counter::MonotonicCounter;
use crate::crypt::{self, MASTER_KEY_LEN, MasterKey};
use crate::error::{CustodyResult, KeyDerivationError};
use crate::secret::{EncryptedKeyMaterial, PlaintextKeyMaterial};
use crate::secure_element::SecureElementBus;

/// PBKDF2 iteration count for the software derivation path.
pub const PBKDF2_ITERATIONS: u32 = 4096;

/// Diversifier reserved for the second-factor token credential.
pub const TOKEN_DIVERSIFIER: &[u8] = b"warden:u2f-token";

/// Diversifier reserved for the smart-card credential.
pub const SMART_CARD_DIVERSIFIER: &[u8] = b"warden:openpgp-c";

/// Salt used when deriving a credential's session master key.
pub const MASTER_KEY_SALT: [u8; MASTER_KEY_LEN] = [0u8; MASTER_KEY_LEN];

/// Hardware key-derivation engine port
///
/// The root secret stays inside the engine; only derived keys come out.
pub trait KeyDerivationEngine: Send {
    /// Capability probe: whether the hardware root secret is usable.
    fn is_available(&mut self) -> bool;

    fn derive_key(
        &mut self,
        diversifier: &[u8],
        salt: &[u8],
        key_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, KeyDerivationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeriverKind {
    Hardware,
    Software,
}

/// Strategy for turning a diversifier and salt into a key
pub trait KeyDeriver: Send + Sync {
    fn kind(&self) -> DeriverKind;

    fn derive_key(&self, diversifier: &[u8], salt: &[u8]) -> Result<MasterKey, KeyDerivationError>;
}

/// Derives keys inside a hardware engine.
pub struct HardwareBackedDeriver {
    engine: Mutex<Box<dyn KeyDerivationEngine>>,
}

impl HardwareBackedDeriver {
    pub fn new(engine: Box<dyn KeyDerivationEngine>) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }
}

impl KeyDeriver for HardwareBackedDeriver {
    fn kind(&self) -> DeriverKind {
        DeriverKind::Hardware
    }

    fn derive_key(&self, diversifier: &[u8], salt: &[u8]) -> Result<MasterKey, KeyDerivationError> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| KeyDerivationError::Engine("engine poisoned".to_string()))?;
        let key = engine.derive_key(diversifier, salt, MASTER_KEY_LEN)?;
        MasterKey::from_slice(&key)
    }
}

/// PBKDF2-SHA256 fallback seeded by the device unique ID and the secure
/// element identity string.
pub struct SoftwareDeriver {
    identity: Zeroizing<Vec<u8>>,
    unique_id: Vec<u8>,
}

impl SoftwareDeriver {
    pub fn new(identity: &str, unique_id: &[u8]) -> Self {
        Self {
            identity: Zeroizing::new(identity.as_bytes().to_vec()),
            unique_id: unique_id.to_vec(),
        }
    }
}

impl KeyDeriver for SoftwareDeriver {
    fn kind(&self) -> DeriverKind {
        DeriverKind::Software
    }

    fn derive_key(&self, diversifier: &[u8], salt: &[u8]) -> Result<MasterKey, KeyDerivationError> {
        let mut kdf_salt = Vec::with_capacity(self.unique_id.len() + diversifier.len() + salt.len());
        kdf_salt.extend_from_slice(&self.unique_id);
        kdf_salt.extend_from_slice(diversifier);
        kdf_salt.extend_from_slice(salt);

        let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        pbkdf2_hmac::<Sha256>(&self.identity, &kdf_salt, PBKDF2_ITERATIONS, &mut key[..]);
        MasterKey::from_slice(&key[..])
    }
}

/// Key store front end used by every credential.
pub struct SecureKeyStore {
    deriver: Box<dyn KeyDeriver>,
}

impl SecureKeyStore {
    pub fn new(deriver: Box<dyn KeyDeriver>) -> Self {
        Self { deriver }
    }

    /// Select the derivation strategy for this boot.
    ///
    /// A usable hardware engine always wins. Otherwise the secure element
    /// identity is read once and the software deriver is used.
    #[instrument(level = "debug", skip_all)]
    pub fn probe(
        engine: Option<Box<dyn KeyDerivationEngine>>,
        bus: &SecureElementBus,
        unique_id: &[u8],
    ) -> Result<Self, KeyDerivationError> {
        if let Some(mut engine) = engine {
            if engine.is_available() {
                info!("key store using hardware derivation engine");
                return Ok(Self::new(Box::new(HardwareBackedDeriver::new(engine))));
            }
            warn!("hardware derivation engine unavailable, falling back to software KDF");
        }

        let identity = MonotonicCounter::new(bus.clone()).info()?;
        debug!("key store using software KDF");
        Ok(Self::new(Box::new(SoftwareDeriver::new(&identity, unique_id))))
    }

    pub fn kind(&self) -> DeriverKind {
        self.deriver.kind()
    }

    pub fn derive_key(&self, diversifier: &[u8], salt: &[u8]) -> Result<MasterKey, KeyDerivationError> {
        self.deriver.derive_key(diversifier, salt)
    }

    /// Decrypt compiled key material for the credential owning `diversifier`.
    pub fn decrypt(
        &self,
        material: &EncryptedKeyMaterial,
        diversifier: &[u8],
    ) -> CustodyResult<PlaintextKeyMaterial> {
        let key = self.derive_key(diversifier, material.salt())?;
        Ok(crypt::open(&key, material)?)
    }

    /// Encrypt plaintext key material for compilation into a device image.
    pub fn seal(&self, plaintext: &[u8], diversifier: &[u8]) -> CustodyResult<EncryptedKeyMaterial> {
        let mut salt = [0u8; MASTER_KEY_LEN];
        rand::rng().fill_bytes(&mut salt);

        let key = self.derive_key(diversifier, &salt)?;
        Ok(crypt::seal(&key, salt, plaintext)?)
    }
}

impl std::fmt::Debug for SecureKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureKeyStore")
            .field("kind", &self.kind())
            .finish()
    }
}
