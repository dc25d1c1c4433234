//! Secure element command port and the single-owner bus in front of it.
//!
//! The secure element serves both the key store (identity query) and the
//! monotonic counter. Commands from independent tasks must never interleave
//! on the physical bus, so every access goes through [`SecureElementBus`].

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{instrument, trace};

use crate::error::SecureElementError;

/// Counter command opcode.
pub const COUNTER_OPCODE: u8 = 0x24;

/// A single request to the secure element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub mode: u8,
    pub key_id: [u8; 2],
    pub payload: Vec<u8>,
    pub require_auth: bool,
}

impl Command {
    pub fn new(opcode: u8, mode: u8, key_id: [u8; 2]) -> Self {
        Self {
            opcode,
            mode,
            key_id,
            payload: Vec::new(),
            require_auth: true,
        }
    }
}

/// Identification returned by the secure element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementInfo {
    pub serial: String,
    pub model: String,
}

impl fmt::Display for ElementInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} S/N:{}", self.model, self.serial)
    }
}

/// Capability to talk to a secure element
///
/// Implementations own the physical transport. They are not required to be
/// `Sync`: the bus serializes all callers.
pub trait SecureElement: Send {
    /// Run the device self test.
    fn self_test(&mut self) -> Result<(), SecureElementError>;

    /// Query the device serial number and model.
    fn info(&mut self) -> Result<ElementInfo, SecureElementError>;

    /// Execute a raw command and return the response payload.
    fn execute(&mut self, command: &Command) -> Result<Vec<u8>, SecureElementError>;
}

/// Shared, serialized access path to one secure element.
#[derive(Clone)]
pub struct SecureElementBus {
    element: Arc<Mutex<Box<dyn SecureElement>>>,
}

impl SecureElementBus {
    pub fn new<E: SecureElement + 'static>(element: E) -> Self {
        Self {
            element: Arc::new(Mutex::new(Box::new(element))),
        }
    }

    /// Run `f` with exclusive ownership of the element.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut dyn SecureElement) -> Result<R, SecureElementError>,
    ) -> Result<R, SecureElementError> {
        let mut element = self
            .element
            .lock()
            .map_err(|_| SecureElementError::Poisoned)?;
        f(element.as_mut())
    }

    pub fn self_test(&self) -> Result<(), SecureElementError> {
        self.with(|element| element.self_test())
    }

    pub fn info(&self) -> Result<ElementInfo, SecureElementError> {
        self.with(|element| element.info())
    }

    #[instrument(level = "trace", skip(self))]
    pub fn execute(&self, command: &Command) -> Result<Vec<u8>, SecureElementError> {
        let response = self.with(|element| element.execute(command))?;
        trace!(len = response.len(), "secure element response");
        Ok(response)
    }
}

impl fmt::Debug for SecureElementBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureElementBus").finish_non_exhaustive()
    }
}
