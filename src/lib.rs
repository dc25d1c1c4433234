//! Key custody, replay counter and user presence gate for a USB security
//! token exposing a smart card and a second-factor token on one composite
//! device.

pub mod config;
pub mod console;
pub mod counter;
pub mod crypt;
pub mod custody;
pub mod device;
pub mod emulated;
pub mod error;
pub mod keystore;
pub mod kv;
pub mod presence;
pub mod secret;
pub mod secure_element;
#[cfg(feature = "tpm")]
pub mod tpm;
pub mod usb;

pub use config::DeviceConfig;
pub use console::{Console, ConsoleCommand};
pub use counter::MonotonicCounter;
pub use crypt::{MasterKey, SessionKey};
pub use custody::{CredentialSigner, SignedAssertion, TokenCustodyManager, TokenHooks, TokenState};
pub use device::{Device, Hardware};
pub use error::{CustodyError, CustodyResult};
pub use keystore::SecureKeyStore;
pub use presence::{PresenceGate, PresenceHandle};
pub use secret::{EncryptedKeyMaterial, PlaintextKeyMaterial};
pub use secure_element::{SecureElement, SecureElementBus};
pub use usb::{CompositeAllocator, CompositeEndpointMap};
