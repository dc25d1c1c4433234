//! Monotonic replay counter held in the secure element.
//!
//! The secure element is authoritative. This module never caches a value it
//! could hand out again: `last_seen` is for logging only.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{error, info, instrument};

use crate::error::CounterHardwareError;
use crate::secure_element::{COUNTER_OPCODE, Command, SecureElementBus};

pub const MODE_READ: u8 = 0;
pub const MODE_INCREMENT: u8 = 1;

/// Counter slot #1 is used as it is never attached to any key.
pub const COUNTER_KEY_ID: u8 = 0x01;

/// Secure element backed monotonic counter
#[derive(Debug)]
pub struct MonotonicCounter {
    bus: SecureElementBus,
    last_seen: AtomicU32,
}

impl MonotonicCounter {
    pub fn new(bus: SecureElementBus) -> Self {
        Self {
            bus,
            last_seen: AtomicU32::new(0),
        }
    }

    /// Self-test the secure element and return the current counter value.
    #[instrument(level = "debug", skip(self))]
    pub fn init(&self) -> Result<u32, CounterHardwareError> {
        self.bus.self_test()?;
        self.read()
    }

    /// Secure element identity, used as KDF entropy by the software deriver.
    #[instrument(level = "debug", skip(self))]
    pub fn info(&self) -> Result<String, CounterHardwareError> {
        Ok(self.bus.info()?.to_string())
    }

    pub fn read(&self) -> Result<u32, CounterHardwareError> {
        self.cmd(MODE_READ)
    }

    /// Advance the counter and return the new value.
    ///
    /// Never retried: an increment whose response is lost leaves a gap,
    /// which verifiers accept.
    pub fn increment(&self) -> Result<u32, CounterHardwareError> {
        match self.cmd(MODE_INCREMENT) {
            Ok(cnt) => {
                info!(counter = cnt, "token counter increment");
                Ok(cnt)
            }
            Err(e) => {
                error!(error = %e, "token counter increment failed");
                Err(e)
            }
        }
    }

    /// Last value observed from the hardware. Not authoritative.
    pub fn last_seen(&self) -> u32 {
        self.last_seen.load(Ordering::Relaxed)
    }

    fn cmd(&self, mode: u8) -> Result<u32, CounterHardwareError> {
        let command = Command::new(COUNTER_OPCODE, mode, [COUNTER_KEY_ID, 0x00]);
        let response = self.bus.execute(&command)?;

        let bytes: [u8; 4] = response
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(CounterHardwareError::MalformedResponse {
                len: response.len(),
            })?;
        let cnt = u32::from_le_bytes(bytes);
        self.last_seen.store(cnt, Ordering::Relaxed);
        Ok(cnt)
    }
}
