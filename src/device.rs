//! Boot orchestration of the composite token device.
//!
//! Interfaces are configured in descriptor order: smart card, network, then
//! the second-factor token. A credential that fails to configure or
//! initialize is logged and left out; the rest of the device still starts.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::config::{CardConfig, DeviceConfig, EmulatorConfig};
use crate::custody::TokenCustodyManager;
use crate::emulated::{EmulatedKeyEngine, EmulatedSecureElement};
use crate::error::{ConfigurationError, CustodyError, CustodyResult};
use crate::keystore::{DeriverKind, KeyDerivationEngine, SMART_CARD_DIVERSIFIER, SecureKeyStore};
use crate::presence::PresenceHandle;
use crate::secret::{EncryptedKeyMaterial, PlaintextKeyMaterial};
use crate::secure_element::SecureElementBus;
use crate::usb::{CompositeAllocator, CompositeEndpointMap, InterfaceRequest};

/// Hardware the device boots on.
pub struct Hardware {
    pub bus: SecureElementBus,
    pub engine: Option<Box<dyn KeyDerivationEngine>>,
    /// Device unique ID (at least 8 bytes).
    pub unique_id: Vec<u8>,
}

impl Hardware {
    /// Emulated secure element and key engine for development hosts.
    pub fn emulated(config: &EmulatorConfig) -> CustodyResult<Self> {
        let element = match &config.state_dir {
            Some(dir) => EmulatedSecureElement::open(dir)?,
            None => EmulatedSecureElement::in_memory(),
        };
        let unique_id = element.unique_id().to_vec();
        let engine = config
            .root_secret()?
            .map(|root| Box::new(EmulatedKeyEngine::from_root_secret(root)) as Box<dyn KeyDerivationEngine>);

        Ok(Self {
            bus: SecureElementBus::new(element),
            engine,
            unique_id,
        })
    }
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware")
            .field("engine", &self.engine.is_some())
            .field("unique_id", &hex::encode(&self.unique_id))
            .finish()
    }
}

/// Card serial number: the second half of the device unique ID.
pub fn card_serial(unique_id: &[u8]) -> Result<[u8; 4], ConfigurationError> {
    unique_id
        .get(4..8)
        .and_then(|s| s.try_into().ok())
        .ok_or(ConfigurationError::Malformed {
            what: "device unique id",
            reason: format!("{} bytes, need at least 8", unique_id.len()),
        })
}

/// The smart-card credential as seen by the custody core: its identity and
/// its key, which is only decrypted by `init`.
pub struct SmartCard {
    serial: [u8; 4],
    name: String,
    language: String,
    sealed_key: Zeroizing<Vec<u8>>,
    hardware_backed: bool,
    key: Option<PlaintextKeyMaterial>,
}

impl SmartCard {
    pub fn new(
        config: &CardConfig,
        unique_id: &[u8],
        hardware_backed: bool,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            serial: card_serial(unique_id)?,
            name: config.name.clone(),
            language: config.language.clone(),
            sealed_key: config.private_key()?,
            hardware_backed,
            key: None,
        })
    }

    #[instrument(level = "debug", skip_all)]
    pub fn init(&mut self, key_store: &SecureKeyStore) -> CustodyResult<()> {
        if self.key.is_some() {
            return Err(CustodyError::AlreadyConfigured);
        }

        let key = if self.hardware_backed {
            let material = EncryptedKeyMaterial::from_bytes(&self.sealed_key)?;
            key_store.decrypt(&material, SMART_CARD_DIVERSIFIER)?
        } else {
            PlaintextKeyMaterial::new(self.sealed_key.clone())
        };
        self.key = Some(key);

        info!(serial = %hex::encode(self.serial), "smart card initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.key.is_some()
    }

    pub fn serial(&self) -> [u8; 4] {
        self.serial
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn key(&self) -> Option<&PlaintextKeyMaterial> {
        self.key.as_ref()
    }
}

impl std::fmt::Debug for SmartCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartCard")
            .field("serial", &hex::encode(self.serial))
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    key_store: Option<Arc<SecureKeyStore>>,
    card: Option<SmartCard>,
    token: Option<TokenCustodyManager>,
    presence: Option<PresenceHandle>,
    endpoints: CompositeEndpointMap,
}

impl Device {
    /// Configure every credential present in `config` and lay out the
    /// composite device. Only an endpoint allocation failure is fatal.
    #[instrument(level = "debug", skip_all)]
    pub fn boot(config: DeviceConfig, hardware: Hardware) -> CustodyResult<Self> {
        let Hardware {
            bus,
            engine,
            unique_id,
        } = hardware;

        let key_store = match SecureKeyStore::probe(engine, &bus, &unique_id) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                error!(error = %e, "secure key store unavailable");
                None
            }
        };

        let mut allocator = CompositeAllocator::new();

        let card = match &config.card {
            Some(card_config) => {
                match SmartCard::new(card_config, &unique_id, config.boot.hardware_backed) {
                    Ok(card) => {
                        allocator.attach(InterfaceRequest::smart_card())?;
                        Some(card)
                    }
                    Err(e) => {
                        error!(error = %e, "smart card configuration error");
                        None
                    }
                }
            }
            None => None,
        };

        if config.network.enabled {
            allocator.attach(InterfaceRequest::network())?;
        }

        let token = match (&config.token, &key_store) {
            (Some(_), None) => {
                error!("token configuration error: no key store");
                None
            }
            (Some(_), Some(store)) => match Self::configure_token(&config, store.clone(), bus) {
                Ok(token) => {
                    allocator.attach(InterfaceRequest::security_token())?;
                    Some(token)
                }
                Err(e) => {
                    error!(error = %e, "token configuration error");
                    None
                }
            },
            (None, _) => None,
        };

        let mut device = Self {
            config,
            key_store,
            card,
            token,
            presence: None,
            endpoints: allocator.build(),
        };

        if device.config.boot.init_at_boot {
            device.init_credentials();
        }

        Ok(device)
    }

    /// Initialize every configured credential that is not initialized yet.
    /// Failures are logged; the other credential is still initialized.
    pub fn init_credentials(&mut self) {
        if self.card.as_ref().is_some_and(|card| !card.is_initialized()) {
            if let Err(e) = self.init_card() {
                error!(error = %e, "smart card initialization error");
            }
        }
        if self.token.as_ref().is_some_and(|token| !token.is_initialized()) {
            if let Err(e) = self.init_token() {
                error!(error = %e, "token initialization error");
            }
        }
    }

    fn configure_token(
        config: &DeviceConfig,
        key_store: Arc<SecureKeyStore>,
        bus: SecureElementBus,
    ) -> CustodyResult<TokenCustodyManager> {
        let token_config = config.token.as_ref().ok_or(CustodyError::NotConfigured)?;
        let public_key = token_config.public_key()?;
        let private_key = token_config.private_key()?;

        let mut token = TokenCustodyManager::new(key_store, bus, config.presence.settings());
        token.configure(&public_key, &private_key, config.boot.hardware_backed)?;
        Ok(token)
    }

    /// Initialize the smart card credential (at boot, or on console
    /// request).
    pub fn init_card(&mut self) -> CustodyResult<()> {
        let key_store = self.key_store.as_ref().ok_or(CustodyError::NotConfigured)?;
        let card = self.card.as_mut().ok_or(CustodyError::NotConfigured)?;
        card.init(key_store)
    }

    /// Initialize the token with the configured presence mode. Replaces
    /// the presence handle.
    pub fn init_token(&mut self) -> CustodyResult<Option<PresenceHandle>> {
        let managed = self.config.presence.managed;
        let token = self.token.as_mut().ok_or(CustodyError::NotConfigured)?;
        let handle = token.init(managed)?;
        self.presence = handle.clone();
        Ok(handle)
    }

    /// Wait for the management console, if any, then hand the device to
    /// the USB transport.
    pub async fn start(&self, console_started: Option<oneshot::Receiver<()>>) -> &CompositeEndpointMap {
        if let Some(started) = console_started {
            if started.await.is_err() {
                warn!("management console exited before starting");
            }
        }

        for interface in self.endpoints.iter() {
            info!(
                role = %interface.role,
                out = %interface.pair.out,
                inbound = %interface.pair.inbound,
                "interface ready"
            );
        }
        info!(interfaces = self.endpoints.len(), "USB transport started");

        &self.endpoints
    }

    pub fn key_store_kind(&self) -> Option<DeriverKind> {
        self.key_store.as_ref().map(|store| store.kind())
    }

    pub fn card(&self) -> Option<&SmartCard> {
        self.card.as_ref()
    }

    pub fn token(&self) -> Option<&TokenCustodyManager> {
        self.token.as_ref()
    }

    pub fn presence_handle(&self) -> Option<&PresenceHandle> {
        self.presence.as_ref()
    }

    pub fn endpoints(&self) -> &CompositeEndpointMap {
        &self.endpoints
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::fixtures::{CounterSigner, config, hardware, sealed};
    use super::*;
    use crate::custody::TokenState;
    use crate::usb::InterfaceRole;
    use tracing_test::traced_test;

    #[test]
    fn test_card_serial_from_unique_id() {
        assert_eq!(card_serial(&(0u8..16).collect::<Vec<_>>()).unwrap(), [4, 5, 6, 7]);
        assert!(card_serial(&[1, 2, 3]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_boot() {
        let device = Device::boot(config(), hardware()).unwrap();

        assert_eq!(device.key_store_kind(), Some(DeriverKind::Hardware));

        let card = device.card().unwrap();
        assert!(card.is_initialized());
        assert_eq!(card.serial(), [4, 5, 6, 7]);
        assert_eq!(card.key().unwrap().expose(), b"openpgp secret key");

        let token = device.token().unwrap();
        assert!(token.is_initialized());
        assert_eq!(token.state(), TokenState::Ready);
        assert!(device.presence_handle().is_none());

        let endpoints = device.endpoints();
        assert_eq!(endpoints.len(), 3);
        let token_pair = endpoints.get(InterfaceRole::SecurityToken).unwrap().pair;
        assert_eq!(token_pair.out.raw(), 0x04);
        assert_eq!(token_pair.inbound.raw(), 0x84);

        let first = token.sign(b"challenge", &CounterSigner).await.unwrap();
        let second = token.sign(b"challenge", &CounterSigner).await.unwrap();
        assert_eq!(first.counter, 1);
        assert_eq!(second.counter, 2);
    }

    #[test]
    #[traced_test]
    fn test_bad_token_key_does_not_stop_card() {
        let mut config = config();
        // sealed for the card, not the token
        config.token.as_mut().unwrap().private_key = sealed(&[0x11; 32], SMART_CARD_DIVERSIFIER).into();

        let device = Device::boot(config, hardware()).unwrap();

        assert!(device.token().is_none());
        assert!(device.card().unwrap().is_initialized());
        assert!(device.endpoints().get(InterfaceRole::SecurityToken).is_none());
        assert!(device.endpoints().get(InterfaceRole::SmartCard).is_some());
        assert!(logs_contain("token configuration error"));
    }

    #[test]
    #[traced_test]
    fn test_bad_card_key_does_not_stop_token() {
        let mut config = config();
        config.card.as_mut().unwrap().private_key = "00".repeat(40).into();

        let device = Device::boot(config, hardware()).unwrap();

        assert!(!device.card().unwrap().is_initialized());
        assert!(device.token().unwrap().is_initialized());
        assert!(logs_contain("smart card initialization error"));
    }

    #[test]
    fn test_deferred_initialization() {
        let mut config = config();
        config.boot.init_at_boot = false;
        config.presence.managed = true;

        let mut device = Device::boot(config, hardware()).unwrap();
        assert!(!device.token().unwrap().is_initialized());
        assert!(!device.card().unwrap().is_initialized());

        device.init_card().unwrap();
        let handle = device.init_token().unwrap();
        assert!(handle.is_some());
        assert!(device.presence_handle().is_some());
        assert!(device.token().unwrap().is_initialized());
    }

    #[test]
    fn test_init_credentials_skips_initialized() {
        let mut config = config();
        config.boot.init_at_boot = false;

        let mut device = Device::boot(config, hardware()).unwrap();
        device.init_card().unwrap();

        device.init_credentials();
        assert!(device.card().unwrap().is_initialized());
        assert!(device.token().unwrap().is_initialized());

        // a second pass is a no-op
        device.init_credentials();
        assert!(device.card().unwrap().is_initialized());
    }

    #[test]
    fn test_plaintext_keys() {
        let mut config = config();
        config.boot.hardware_backed = false;
        config.token.as_mut().unwrap().private_key = "11".repeat(32).into();
        config.card.as_mut().unwrap().private_key = hex::encode(b"card key").into();

        let device = Device::boot(config, hardware()).unwrap();
        assert_eq!(device.card().unwrap().key().unwrap().expose(), b"card key");
        assert!(device.token().unwrap().is_initialized());
    }

    #[test]
    fn test_software_key_store_without_engine() {
        let mut hw = hardware();
        hw.engine = None;
        let mut config = config();
        config.card = None;
        config.token = None;
        config.network.enabled = false;

        let device = Device::boot(config, hw).unwrap();
        assert_eq!(device.key_store_kind(), Some(DeriverKind::Software));
        assert!(device.endpoints().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_for_console() {
        let device = Device::boot(config(), hardware()).unwrap();
        let (started_tx, started_rx) = oneshot::channel();

        let start = device.start(Some(started_rx));
        tokio::pin!(start);
        assert!(
            tokio::time::timeout(Duration::from_secs(60), &mut start)
                .await
                .is_err()
        );

        started_tx.send(()).unwrap();
        assert_eq!(start.await.len(), 3);
    }

    #[tokio::test]
    async fn test_start_without_console() {
        let device = Device::boot(DeviceConfig::default(), hardware()).unwrap();
        assert!(device.start(None).await.is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn test_emulated_hardware_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let emulator = EmulatorConfig {
            state_dir: Some(dir.path().to_path_buf()),
            root_secret: Some("42".repeat(32).into()),
        };

        let first = Hardware::emulated(&emulator).unwrap();
        let unique_id = first.unique_id.clone();
        assert!(first.engine.is_some());
        drop(first);

        let second = Hardware::emulated(&emulator).unwrap();
        assert_eq!(second.unique_id, unique_id);
    }
}
