//! Error types for the custody core
//!
//! Errors are grouped by the component that raises them. Each group is fatal
//! to a different scope: configuration and key errors disable one credential,
//! counter and presence errors abort one signing operation.

use thiserror::Error;

/// Result type alias for custody operations
pub type CustodyResult<T> = Result<T, CustodyError>;

/// Top-level error type for all custody operations
#[derive(Error, Debug)]
pub enum CustodyError {
    /// Missing or malformed compiled key material
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Key derivation failed in the hardware engine or the software KDF
    #[error("Key derivation error: {0}")]
    KeyDerivation(#[from] KeyDerivationError),

    /// Authenticated decryption of key material failed
    #[error("Decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    /// The monotonic counter could not be read or advanced
    #[error("Counter hardware error: {0}")]
    CounterHardware(#[from] CounterHardwareError),

    /// Endpoint allocation on the composite device failed
    #[error("Endpoint allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// User presence was not confirmed within the timeout
    #[error("User presence not confirmed")]
    PresenceDenied,

    /// The credential was already configured
    #[error("Credential already configured")]
    AlreadyConfigured,

    /// The credential has not been configured yet
    #[error("Credential not configured")]
    NotConfigured,

    /// Operation attempted in the wrong lifecycle state
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The protocol layer failed to produce a signature
    #[error("Signing failed: {0}")]
    Signing(String),

    /// A signing request holds the device
    #[error("Device busy")]
    Busy,
}

/// Compiled key material errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A required key is absent
    #[error("Missing {what}")]
    Missing { what: &'static str },

    /// Key material could not be parsed
    #[error("Malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

/// Key derivation errors
#[derive(Error, Debug)]
pub enum KeyDerivationError {
    /// The hardware derivation engine reported a fault
    #[error("Hardware engine fault: {0}")]
    Engine(String),

    /// The secure element identity could not be obtained for the software KDF
    #[error("Secure element identity unavailable: {0}")]
    Identity(#[from] CounterHardwareError),

    /// The engine returned a key of unexpected length
    #[error("Derived key has length {actual}, expected {expected}")]
    KeyLength { expected: usize, actual: usize },
}

/// Key material decryption errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecryptionError {
    /// Ciphertext is too short to contain a nonce and tag
    #[error("Ciphertext truncated ({len} bytes)")]
    Truncated { len: usize },

    /// Integrity check failed (wrong key or tampered ciphertext)
    #[error("Authentication tag mismatch")]
    Authentication,

    /// Encryption for provisioning failed
    #[error("Encryption failed")]
    Encryption,
}

/// Monotonic counter errors
#[derive(Error, Debug)]
pub enum CounterHardwareError {
    /// The secure element bus reported a fault
    #[error("Secure element fault: {0}")]
    Bus(#[from] SecureElementError),

    /// The counter response could not be decoded
    #[error("Malformed counter response ({len} bytes)")]
    MalformedResponse { len: usize },
}

/// Secure element transport and command errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecureElementError {
    /// Communication with the device failed
    #[error("Bus communication failed: {0}")]
    Communication(String),

    /// The self test did not pass
    #[error("Self test failed")]
    SelfTest,

    /// Opcode or mode not supported by this element
    #[error("Unsupported command: opcode {opcode:#04x} mode {mode:#04x}")]
    Unsupported { opcode: u8, mode: u8 },

    /// Command addressed an invalid slot
    #[error("Invalid slot {0}")]
    InvalidSlot(u8),

    /// Counter slot reached its maximum value
    #[error("Counter slot {0} exhausted")]
    CounterExhausted(u8),

    /// A previous holder of the bus panicked
    #[error("Bus poisoned")]
    Poisoned,
}

/// Composite endpoint allocation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// Two interfaces asked for the same endpoint address
    #[error("Endpoint {address:#04x} requested by {role} already assigned")]
    Conflict { address: u8, role: String },

    /// No free endpoint number is left
    #[error("No free endpoint pair left for {role}")]
    Exhausted { role: String },

    /// The same interface role was attached twice
    #[error("Interface {role} attached twice")]
    DuplicateRole { role: String },
}

/// Management console input errors
#[derive(Error, Debug, PartialEq)]
pub enum ConsoleError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] hex::FromHexError),
}

/// Device configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<SecureElementError> for CustodyError {
    fn from(err: SecureElementError) -> Self {
        CustodyError::CounterHardware(CounterHardwareError::Bus(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CustodyError::PresenceDenied;
        assert!(err.to_string().contains("presence"));

        let err = CustodyError::from(SecureElementError::Unsupported {
            opcode: 0x24,
            mode: 7,
        });
        assert!(err.to_string().contains("0x24"));
    }

    #[test]
    fn test_counter_error_conversion() {
        let err: CustodyError = SecureElementError::Poisoned.into();
        assert!(matches!(
            err,
            CustodyError::CounterHardware(CounterHardwareError::Bus(SecureElementError::Poisoned))
        ));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = CustodyError::InvalidState {
            expected: "Ready",
            actual: "Unconfigured",
        };
        assert_eq!(
            err.to_string(),
            "Invalid state: expected Ready, found Unconfigured"
        );
    }
}
