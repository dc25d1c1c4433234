//! Software stand-ins for the secure element and the key-derivation engine.
//!
//! Used on development hosts and in tests. The emulated secure element keeps
//! the counter semantics of the real part: two monotonic slots, read or
//! increment, saturating at the hardware maximum. With a [`SlotStore`]
//! every increment is on disk before it is reported.

use std::path::Path;

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::counter::{MODE_INCREMENT, MODE_READ};
use crate::error::{KeyDerivationError, SecureElementError};
use crate::keystore::KeyDerivationEngine;
use crate::kv::{ElementIdentity, SlotStore};
use crate::secure_element::{COUNTER_OPCODE, Command, ElementInfo, SecureElement};

/// Largest value a counter slot can hold.
pub const COUNTER_MAX: u32 = 2_097_151;

pub const COUNTER_SLOTS: usize = 2;

const SERIAL_LEN: usize = 9;
const UNIQUE_ID_LEN: usize = 16;
const MODEL: &str = "EMU608";

fn storage_error(e: impl std::fmt::Display) -> SecureElementError {
    SecureElementError::Communication(format!("slot store: {e}"))
}

#[derive(Debug)]
pub struct EmulatedSecureElement {
    counters: [u32; COUNTER_SLOTS],
    identity: ElementIdentity,
    store: Option<SlotStore>,
}

impl EmulatedSecureElement {
    /// Element with a fresh random identity and zeroed counters, lost on drop.
    pub fn in_memory() -> Self {
        Self {
            counters: [0; COUNTER_SLOTS],
            identity: random_identity(),
            store: None,
        }
    }

    /// Element persisted in a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SecureElementError> {
        let store = SlotStore::open(path).map_err(storage_error)?;

        let identity = match store.get_identity().map_err(storage_error)? {
            Some(identity) => identity,
            None => {
                let identity = random_identity();
                store.set_identity(&identity).map_err(storage_error)?;
                info!(serial = %hex::encode(&identity.serial), "created emulated secure element");
                identity
            }
        };

        let mut counters = [0; COUNTER_SLOTS];
        for (slot, value) in counters.iter_mut().enumerate() {
            *value = store
                .get_counter(slot as u8)
                .map_err(storage_error)?
                .unwrap_or(0);
        }
        debug!(?counters, "emulated secure element loaded");

        Ok(Self {
            counters,
            identity,
            store: Some(store),
        })
    }

    /// Device unique ID, the per-board entropy of the software KDF.
    pub fn unique_id(&self) -> &[u8] {
        &self.identity.unique_id
    }

    fn counter(&mut self, command: &Command) -> Result<Vec<u8>, SecureElementError> {
        let slot = command.key_id[0];
        let index = usize::from(slot);
        if index >= COUNTER_SLOTS {
            return Err(SecureElementError::InvalidSlot(slot));
        }

        match command.mode {
            MODE_READ => Ok(self.counters[index].to_le_bytes().to_vec()),
            MODE_INCREMENT => {
                let next = self.counters[index] + 1;
                if next > COUNTER_MAX {
                    return Err(SecureElementError::CounterExhausted(slot));
                }
                // persist first, a crash must never let a value be reissued
                if let Some(store) = &self.store {
                    store.set_counter(slot, next).map_err(storage_error)?;
                }
                self.counters[index] = next;
                Ok(next.to_le_bytes().to_vec())
            }
            mode => Err(SecureElementError::Unsupported {
                opcode: command.opcode,
                mode,
            }),
        }
    }
}

fn random_identity() -> ElementIdentity {
    let mut rng = rand::rng();
    let mut serial = vec![0u8; SERIAL_LEN];
    rng.fill_bytes(&mut serial);
    let mut unique_id = vec![0u8; UNIQUE_ID_LEN];
    rng.fill_bytes(&mut unique_id);
    ElementIdentity { serial, unique_id }
}

impl SecureElement for EmulatedSecureElement {
    fn self_test(&mut self) -> Result<(), SecureElementError> {
        Ok(())
    }

    fn info(&mut self) -> Result<ElementInfo, SecureElementError> {
        Ok(ElementInfo {
            serial: hex::encode(&self.identity.serial),
            model: MODEL.to_string(),
        })
    }

    fn execute(&mut self, command: &Command) -> Result<Vec<u8>, SecureElementError> {
        match command.opcode {
            COUNTER_OPCODE => self.counter(command),
            opcode => Err(SecureElementError::Unsupported {
                opcode,
                mode: command.mode,
            }),
        }
    }
}

/// HKDF-SHA256 over a root secret that never leaves this struct.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EmulatedKeyEngine {
    root: Option<[u8; 32]>,
}

impl EmulatedKeyEngine {
    pub fn from_root_secret(root: [u8; 32]) -> Self {
        Self { root: Some(root) }
    }

    pub fn generate() -> Self {
        let mut root = [0u8; 32];
        rand::rng().fill_bytes(&mut root);
        Self::from_root_secret(root)
    }

    /// Engine whose root secret is not provisioned.
    pub fn unavailable() -> Self {
        Self { root: None }
    }
}

impl KeyDerivationEngine for EmulatedKeyEngine {
    fn is_available(&mut self) -> bool {
        self.root.is_some()
    }

    fn derive_key(
        &mut self,
        diversifier: &[u8],
        salt: &[u8],
        key_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, KeyDerivationError> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| KeyDerivationError::Engine("root secret not provisioned".to_string()))?;

        let hk = Hkdf::<Sha256>::new(Some(salt), root);
        let mut key = Zeroizing::new(vec![0u8; key_len]);
        hk.expand(diversifier, &mut key)
            .map_err(|e| KeyDerivationError::Engine(e.to_string()))?;
        Ok(key)
    }
}

impl std::fmt::Debug for EmulatedKeyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedKeyEngine")
            .field("available", &self.root.is_some())
            .finish()
    }
}
