//! Device configuration.
//!
//! Everything that is compiled into a device image: credential key
//! material, boot flags and presence settings. Loaded from TOML.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

use crate::custody::PresenceSettings;
use crate::error::{ConfigError, ConfigurationError};
use crate::presence::{Indicator, LogIndicator, SysfsLed};
use crate::secret::decode_hex;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub presence: PresenceConfig,
    pub boot: BootConfig,
    pub token: Option<TokenConfig>,
    pub card: Option<CardConfig>,
    pub network: NetworkConfig,
    pub emulator: EmulatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PresenceConfig {
    /// Whether a confirmation channel exists. Without one presence is
    /// assumed.
    pub managed: bool,
    pub timeout_secs: u64,
    pub blink_interval_ms: u64,
    /// LED class device name under `/sys/class/leds`.
    pub led: Option<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            managed: true,
            timeout_secs: 10,
            blink_interval_ms: 200,
            led: None,
        }
    }
}

impl PresenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn blink_interval(&self) -> Duration {
        Duration::from_millis(self.blink_interval_ms)
    }

    pub fn indicator(&self) -> Arc<dyn Indicator> {
        match &self.led {
            Some(name) => Arc::new(SysfsLed::new(name)),
            None => Arc::new(LogIndicator),
        }
    }

    pub fn settings(&self) -> PresenceSettings {
        PresenceSettings {
            timeout: self.timeout(),
            blink_interval: self.blink_interval(),
            indicator: self.indicator(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootConfig {
    /// Initialize credentials at boot instead of waiting for the console.
    pub init_at_boot: bool,
    /// Private keys are ciphertext sealed by the secure key store.
    pub hardware_backed: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            init_at_boot: true,
            hardware_backed: true,
        }
    }
}

/// Hex encoded secret from the configuration file. Wiped on drop and
/// redacted in `Debug`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretHex(Zeroizing<String>);

impl SecretHex {
    pub fn expose(&self) -> &str {
        &self.0
    }

    fn decode(&self, what: &'static str) -> Result<Zeroizing<Vec<u8>>, ConfigurationError> {
        decode_hex(what, &self.0).map(Zeroizing::new)
    }
}

impl From<String> for SecretHex {
    fn from(encoded: String) -> Self {
        Self(Zeroizing::new(encoded))
    }
}

impl fmt::Debug for SecretHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretHex([REDACTED])")
    }
}

impl Serialize for SecretHex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecretHex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Second-factor token key pair, hex encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
    pub public_key: String,
    pub private_key: SecretHex,
}

impl TokenConfig {
    pub fn public_key(&self) -> Result<Vec<u8>, ConfigurationError> {
        decode_hex("token public key", &self.public_key)
    }

    pub fn private_key(&self) -> Result<Zeroizing<Vec<u8>>, ConfigurationError> {
        self.private_key.decode("token private key")
    }
}

/// Smart-card credential.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CardConfig {
    pub private_key: SecretHex,
    pub name: String,
    pub language: String,
}

impl CardConfig {
    pub fn private_key(&self) -> Result<Zeroizing<Vec<u8>>, ConfigurationError> {
        self.private_key.decode("smart card private key")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Attach the Ethernet over USB interface.
    pub enabled: bool,
}

/// Host-only settings for the emulated hardware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorConfig {
    /// Directory for the persistent secure element state. In memory when
    /// unset.
    pub state_dir: Option<PathBuf>,
    /// Hex encoded 32 byte root secret for the emulated derivation engine.
    /// Without one the software KDF is used.
    pub root_secret: Option<SecretHex>,
}

impl EmulatorConfig {
    pub fn root_secret(&self) -> Result<Option<[u8; 32]>, ConfigurationError> {
        let Some(encoded) = &self.root_secret else {
            return Ok(None);
        };
        let bytes = encoded.decode("emulator root secret")?;
        let root: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ConfigurationError::Malformed {
                what: "emulator root secret",
                reason: format!("expected 32 bytes, got {}", bytes.len()),
            })?;
        Ok(Some(root))
    }
}

impl DeviceConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Checks that do not depend on key material. Credential errors are
    /// reported when the credential is configured so that one bad key does
    /// not stop the device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.presence.blink_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "presence.blink_interval_ms must be greater than zero".to_string(),
            ));
        }
        self.emulator
            .root_secret()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}
