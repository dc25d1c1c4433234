//! On-disk state for the emulated secure element.
//!
//! Keys are laid out as
//! `counter/<slot>` for counter slots and `identity` for the element's
//! serial number and device unique ID.

use std::path::Path;
use std::sync::{Arc, Mutex};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sled::Db;
use thiserror::Error;

const IDENTITY_KEY: &str = "identity";

#[derive(Error, Debug)]
pub enum SlotStoreError {
    #[error("Database error: {0}")]
    Db(#[from] sled::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode record: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Identity of an emulated element, generated once and then persisted.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ElementIdentity {
    pub serial: Vec<u8>,
    pub unique_id: Vec<u8>,
}

/// Persistent counter slots and identity, a wrapper around sled's `Db`.
#[derive(Clone)]
pub struct SlotStore {
    db: Arc<Mutex<Db>>,
}

impl SlotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SlotStoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn counter_path(slot: u8) -> String {
        format!("counter/{slot}")
    }

    fn get<T: Decode<()>>(&self, key: &str) -> Result<Option<T>, SlotStoreError> {
        let db = self.db.lock().map_err(|_| SlotStoreError::Poisoned)?;
        match db.get(key)? {
            Some(value) => {
                let (record, _): (T, usize) =
                    bincode::decode_from_slice(&value, bincode::config::standard())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Stores `value` and waits for it to reach disk.
    fn put<T: Encode>(&self, key: &str, value: &T) -> Result<(), SlotStoreError> {
        let encoded = bincode::encode_to_vec(value, bincode::config::standard())?;
        let db = self.db.lock().map_err(|_| SlotStoreError::Poisoned)?;
        db.insert(key, encoded)?;
        db.flush()?;
        Ok(())
    }

    pub fn get_counter(&self, slot: u8) -> Result<Option<u32>, SlotStoreError> {
        self.get(&Self::counter_path(slot))
    }

    pub fn set_counter(&self, slot: u8, value: u32) -> Result<(), SlotStoreError> {
        self.put(&Self::counter_path(slot), &value)
    }

    pub fn get_identity(&self) -> Result<Option<ElementIdentity>, SlotStoreError> {
        self.get(IDENTITY_KEY)
    }

    pub fn set_identity(&self, identity: &ElementIdentity) -> Result<(), SlotStoreError> {
        self.put(IDENTITY_KEY, identity)
    }
}

impl std::fmt::Debug for SlotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotStore").finish_non_exhaustive()
    }
}
