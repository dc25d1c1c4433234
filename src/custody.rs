//! Token custody manager.
//!
//! Owns the second-factor token's key material, its counter binding and
//! its presence gate. The protocol layer reaches the counter and the gate
//! only through [`TokenHooks`], which enforce that the counter never moves
//! without a confirmed presence.
//!
//! ```text
//! Unconfigured -> Configuring -> Ready -> AwaitingPresence -> Signing -> Ready
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::counter::MonotonicCounter;
use crate::crypt::{MasterKey, SessionKey};
use crate::error::{ConfigurationError, CustodyError, CustodyResult};
use crate::keystore::{MASTER_KEY_SALT, SecureKeyStore, TOKEN_DIVERSIFIER};
use crate::presence::{DEFAULT_BLINK_INTERVAL, DEFAULT_TIMEOUT, Indicator, LogIndicator, PresenceGate, PresenceHandle};
use crate::secret::{EncryptedKeyMaterial, PlaintextKeyMaterial};
use crate::secure_element::SecureElementBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unconfigured,
    Configuring,
    Ready,
    AwaitingPresence,
    Signing,
}

impl TokenState {
    pub fn name(&self) -> &'static str {
        match self {
            TokenState::Unconfigured => "Unconfigured",
            TokenState::Configuring => "Configuring",
            TokenState::Ready => "Ready",
            TokenState::AwaitingPresence => "AwaitingPresence",
            TokenState::Signing => "Signing",
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How long a presence confirmed through [`TokenHooks::user_presence`]
/// stays usable by [`TokenHooks::increment`].
pub const PRESENCE_GRANT_TTL: Duration = Duration::from_secs(10);

/// Presence gate wiring used by [`TokenCustodyManager::init`].
#[derive(Clone)]
pub struct PresenceSettings {
    pub timeout: Duration,
    pub blink_interval: Duration,
    pub indicator: Arc<dyn Indicator>,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            blink_interval: DEFAULT_BLINK_INTERVAL,
            indicator: Arc::new(LogIndicator),
        }
    }
}

impl fmt::Debug for PresenceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceSettings")
            .field("timeout", &self.timeout)
            .field("blink_interval", &self.blink_interval)
            .finish_non_exhaustive()
    }
}

/// Counter and presence hooks consumed by the token protocol layer.
pub trait TokenHooks {
    /// Advance the replay counter. Requires a presence grant from
    /// `user_presence` no older than [`PRESENCE_GRANT_TTL`], which it
    /// consumes.
    fn increment(&self) -> CustodyResult<u32>;

    /// Current counter value.
    fn read(&self) -> CustodyResult<u32>;

    /// Ask the user to confirm presence.
    fn user_presence(&self) -> impl Future<Output = bool> + Send;
}

/// Produces the protocol signature once the custody checks have passed.
pub trait CredentialSigner {
    fn sign(
        &self,
        key: &PlaintextKeyMaterial,
        message: &[u8],
        counter: u32,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Result of a granted signing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAssertion {
    pub counter: u32,
    pub user_present: bool,
    pub signature: Vec<u8>,
}

/// The configured credential: public key and decrypted private key.
struct TokenCredential {
    public_key: Vec<u8>,
    private_key: PlaintextKeyMaterial,
}

/// State established by `init`.
struct TokenSession {
    counter: MonotonicCounter,
    master_key: MasterKey,
    presence: PresenceGate,
}

pub struct TokenCustodyManager {
    key_store: Arc<SecureKeyStore>,
    bus: SecureElementBus,
    settings: PresenceSettings,
    state: Mutex<TokenState>,
    credential: Option<TokenCredential>,
    session: Option<TokenSession>,
    presence_grant: Mutex<Option<Instant>>,
}

impl TokenCustodyManager {
    pub fn new(key_store: Arc<SecureKeyStore>, bus: SecureElementBus, settings: PresenceSettings) -> Self {
        Self {
            key_store,
            bus,
            settings,
            state: Mutex::new(TokenState::Unconfigured),
            credential: None,
            session: None,
            presence_grant: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TokenState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TokenState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    pub fn public_key(&self) -> Option<&[u8]> {
        self.credential.as_ref().map(|c| c.public_key.as_slice())
    }

    /// Bind the token to its compiled key material.
    ///
    /// When `hardware_backed` is set the private key is ciphertext and is
    /// decrypted with the token diversifier. A failed configuration leaves
    /// the manager unconfigured; a second successful call is refused.
    #[instrument(level = "debug", skip(self, public_key, private_key))]
    pub fn configure(
        &mut self,
        public_key: &[u8],
        private_key: &[u8],
        hardware_backed: bool,
    ) -> CustodyResult<()> {
        if self.state() != TokenState::Unconfigured {
            return Err(CustodyError::AlreadyConfigured);
        }
        self.set_state(TokenState::Configuring);

        match self.load_credential(public_key, private_key, hardware_backed) {
            Ok(credential) => {
                self.credential = Some(credential);
                self.set_state(TokenState::Ready);
                debug!("token credential configured");
                Ok(())
            }
            Err(e) => {
                self.set_state(TokenState::Unconfigured);
                Err(e)
            }
        }
    }

    fn load_credential(
        &self,
        public_key: &[u8],
        private_key: &[u8],
        hardware_backed: bool,
    ) -> CustodyResult<TokenCredential> {
        if public_key.is_empty() {
            return Err(ConfigurationError::Missing {
                what: "token public key",
            }
            .into());
        }
        if private_key.is_empty() {
            return Err(ConfigurationError::Missing {
                what: "token private key",
            }
            .into());
        }

        let private_key = if hardware_backed {
            let material = EncryptedKeyMaterial::from_bytes(private_key)?;
            self.key_store.decrypt(&material, TOKEN_DIVERSIFIER)?
        } else {
            PlaintextKeyMaterial::new(zeroize::Zeroizing::new(private_key.to_vec()))
        };

        Ok(TokenCredential {
            public_key: public_key.to_vec(),
            private_key,
        })
    }

    /// Establish the counter binding, the token master key and the presence
    /// gate. Returns the confirmation handle when presence is managed.
    ///
    /// May be called again to switch between managed and unmanaged presence.
    #[instrument(level = "debug", skip(self))]
    pub fn init(&mut self, presence_managed: bool) -> CustodyResult<Option<PresenceHandle>> {
        if self.credential.is_none() {
            return Err(CustodyError::NotConfigured);
        }
        let state = self.state();
        if state != TokenState::Ready {
            return Err(CustodyError::InvalidState {
                expected: TokenState::Ready.name(),
                actual: state.name(),
            });
        }

        let counter = MonotonicCounter::new(self.bus.clone());
        let cnt = counter.init()?;

        let master_key = self.key_store.derive_key(TOKEN_DIVERSIFIER, &MASTER_KEY_SALT)?;

        let (presence, handle) = if presence_managed {
            let (gate, handle) =
                PresenceGate::managed(self.settings.indicator.clone(), self.settings.blink_interval);
            (gate, Some(handle))
        } else {
            (PresenceGate::unmanaged(), None)
        };

        self.session = Some(TokenSession {
            counter,
            master_key,
            presence,
        });
        *self
            .presence_grant
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        info!(managed = presence_managed, counter = cnt, "token initialized");

        Ok(handle)
    }

    fn session(&self) -> CustodyResult<&TokenSession> {
        self.session.as_ref().ok_or(CustodyError::NotConfigured)
    }

    /// Key for wrapping the key handles of one relying party.
    pub fn application_key(&self, application: &[u8]) -> CustodyResult<SessionKey> {
        let session = self.session()?;
        Ok(SessionKey::new(&session.master_key, None, application)?)
    }

    /// Run one signing operation: presence, then counter, then signature.
    ///
    /// The counter is advanced only after presence is confirmed. A failure
    /// after the increment does not roll the counter back.
    pub async fn sign<S: CredentialSigner>(
        &self,
        message: &[u8],
        signer: &S,
    ) -> CustodyResult<SignedAssertion> {
        let credential = self.credential.as_ref().ok_or(CustodyError::NotConfigured)?;
        let session = self.session()?;

        let operation = Operation::begin(&self.state)?;

        if !session.presence.confirm(self.settings.timeout).await {
            return Err(CustodyError::PresenceDenied);
        }

        operation.advance(TokenState::Signing);
        let counter = session.counter.increment()?;

        let signature = signer
            .sign(&credential.private_key, message, counter)
            .map_err(|e| CustodyError::Signing(e.to_string()))?;

        Ok(SignedAssertion {
            counter,
            user_present: true,
            signature,
        })
    }

    fn take_grant(&self) -> bool {
        let grant = self
            .presence_grant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        grant.is_some_and(|granted_at| granted_at.elapsed() <= PRESENCE_GRANT_TTL)
    }
}

impl TokenHooks for TokenCustodyManager {
    fn increment(&self) -> CustodyResult<u32> {
        let session = self.session()?;
        if !self.take_grant() {
            warn!("counter increment refused without user presence");
            return Err(CustodyError::PresenceDenied);
        }
        Ok(session.counter.increment()?)
    }

    fn read(&self) -> CustodyResult<u32> {
        Ok(self.session()?.counter.read()?)
    }

    fn user_presence(&self) -> impl Future<Output = bool> + Send {
        async move {
            let Ok(session) = self.session() else {
                return false;
            };

            // a new request always clears an unused grant
            *self
                .presence_grant
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = None;

            let present = session.presence.confirm(self.settings.timeout).await;
            if present {
                *self
                    .presence_grant
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
            }
            present
        }
    }
}

impl fmt::Debug for TokenCustodyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCustodyManager")
            .field("state", &self.state())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

/// Tracks one in-flight signing operation and returns the manager to
/// `Ready` when dropped, including on early return or cancellation.
struct Operation<'a> {
    state: &'a Mutex<TokenState>,
}

impl<'a> Operation<'a> {
    fn begin(state: &'a Mutex<TokenState>) -> CustodyResult<Self> {
        let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != TokenState::Ready {
            return Err(CustodyError::InvalidState {
                expected: TokenState::Ready.name(),
                actual: current.name(),
            });
        }
        *current = TokenState::AwaitingPresence;
        Ok(Self { state })
    }

    fn advance(&self, next: TokenState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = TokenState::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MODE_INCREMENT;
    use crate::emulated::EmulatedSecureElement;
    use crate::error::{CounterHardwareError, DecryptionError, SecureElementError};
    use crate::keystore::{SMART_CARD_DIVERSIFIER, SoftwareDeriver};
    use crate::presence::recording::RecordingIndicator;
    use crate::secure_element::scripted::{CommandLog, ScriptedSecureElement};
    use secrecy::ExposeSecret;
    use tracing_test::traced_test;

    /// Signer that echoes the counter and key length so tests can see what
    /// was bound into the signature.
    struct EchoSigner;

    impl CredentialSigner for EchoSigner {
        fn sign(
            &self,
            key: &PlaintextKeyMaterial,
            message: &[u8],
            counter: u32,
        ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
            let mut out = counter.to_be_bytes().to_vec();
            out.push(key.len() as u8);
            out.extend_from_slice(message);
            Ok(out)
        }
    }

    struct FailingSigner;

    impl CredentialSigner for FailingSigner {
        fn sign(
            &self,
            _: &PlaintextKeyMaterial,
            _: &[u8],
            _: u32,
        ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
            Err("usb stall".into())
        }
    }

    fn key_store() -> Arc<SecureKeyStore> {
        Arc::new(SecureKeyStore::new(Box::new(SoftwareDeriver::new(
            "EMU608 S/N:test",
            &[0x5a; 16],
        ))))
    }

    fn settings(indicator: Arc<RecordingIndicator>) -> PresenceSettings {
        PresenceSettings {
            timeout: Duration::from_secs(10),
            blink_interval: Duration::from_millis(200),
            indicator,
        }
    }

    fn manager_with(bus: SecureElementBus) -> TokenCustodyManager {
        let store = key_store();
        let sealed = store.seal(&[0x11; 32], TOKEN_DIVERSIFIER).unwrap();
        let mut manager =
            TokenCustodyManager::new(store, bus, settings(Arc::new(RecordingIndicator::default())));
        manager
            .configure(&[0x04; 65], &sealed.to_bytes(), true)
            .unwrap();
        manager
    }

    fn scripted(responses: Vec<Result<u32, SecureElementError>>) -> (SecureElementBus, CommandLog) {
        let element = ScriptedSecureElement::new(responses);
        let log = element.log.clone();
        (SecureElementBus::new(element), log)
    }

    #[test]
    fn test_configure_decrypts_key_material() {
        let manager = manager_with(SecureElementBus::new(EmulatedSecureElement::in_memory()));
        assert_eq!(manager.state(), TokenState::Ready);
        assert_eq!(manager.public_key(), Some(&[0x04; 65][..]));
        assert_eq!(
            manager.credential.as_ref().unwrap().private_key.expose(),
            &[0x11; 32]
        );
    }

    #[test]
    fn test_configure_twice_is_refused() {
        let mut manager = manager_with(SecureElementBus::new(EmulatedSecureElement::in_memory()));
        let err = manager.configure(&[0x02; 33], &[0x22; 32], false).unwrap_err();

        assert!(matches!(err, CustodyError::AlreadyConfigured));
        assert_eq!(manager.public_key(), Some(&[0x04; 65][..]));
        assert_eq!(
            manager.credential.as_ref().unwrap().private_key.expose(),
            &[0x11; 32]
        );
    }

    #[test]
    fn test_configure_with_wrong_diversifier_fails_cleanly() {
        let store = key_store();
        let sealed = store.seal(&[0x11; 32], SMART_CARD_DIVERSIFIER).unwrap();
        let mut manager = TokenCustodyManager::new(
            store,
            SecureElementBus::new(EmulatedSecureElement::in_memory()),
            PresenceSettings::default(),
        );

        let err = manager
            .configure(&[0x04; 65], &sealed.to_bytes(), true)
            .unwrap_err();
        assert!(matches!(
            err,
            CustodyError::Decryption(DecryptionError::Authentication)
        ));
        assert_eq!(manager.state(), TokenState::Unconfigured);
        assert!(manager.credential.is_none());
    }

    #[test]
    fn test_configure_rejects_missing_keys() {
        let mut manager = TokenCustodyManager::new(
            key_store(),
            SecureElementBus::new(EmulatedSecureElement::in_memory()),
            PresenceSettings::default(),
        );
        assert!(matches!(
            manager.configure(&[], &[1], false),
            Err(CustodyError::Configuration(ConfigurationError::Missing { .. }))
        ));
        assert!(matches!(
            manager.configure(&[1], &[0u8; 8], true),
            Err(CustodyError::Decryption(DecryptionError::Truncated { len: 8 }))
        ));
        manager.configure(&[1], &[2], false).unwrap();
        assert_eq!(manager.state(), TokenState::Ready);
    }

    #[test]
    fn test_init_requires_configuration() {
        let mut manager = TokenCustodyManager::new(
            key_store(),
            SecureElementBus::new(EmulatedSecureElement::in_memory()),
            PresenceSettings::default(),
        );
        assert!(matches!(manager.init(false), Err(CustodyError::NotConfigured)));
    }

    #[test]
    #[traced_test]
    fn test_init_logs_counter() {
        let (bus, _log) = scripted(vec![Ok(41)]);
        let mut manager = manager_with(bus);

        let handle = manager.init(true).unwrap();
        assert!(handle.is_some());
        assert!(manager.is_initialized());
        assert!(logs_contain("token initialized"));
        assert!(logs_contain("counter=41"));

        let (bus, _log) = scripted(vec![Ok(41)]);
        let mut manager = manager_with(bus);
        assert!(manager.init(false).unwrap().is_none());
    }

    #[test]
    fn test_init_counter_fault() {
        let (bus, _log) = scripted(vec![Err(SecureElementError::Communication(
            "nack".to_string(),
        ))]);
        let mut manager = manager_with(bus);
        assert!(matches!(
            manager.init(false),
            Err(CustodyError::CounterHardware(CounterHardwareError::Bus(_)))
        ));
        assert!(!manager.is_initialized());
    }

    #[test]
    fn test_application_keys_are_per_application() {
        let mut manager = manager_with(SecureElementBus::new(EmulatedSecureElement::in_memory()));
        assert!(manager.application_key(b"example.com").is_err());
        manager.init(false).unwrap();

        let a = manager.application_key(b"example.com").unwrap();
        let b = manager.application_key(b"example.org").unwrap();
        assert_ne!(a.key().expose_secret(), b.key().expose_secret());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_binds_hardware_counter_sequence() {
        let (bus, _log) = scripted(vec![Ok(4), Ok(5), Ok(6), Ok(7)]);
        let mut manager = manager_with(bus);
        manager.init(false).unwrap();

        let mut counters = Vec::new();
        for _ in 0..3 {
            let assertion = manager.sign(b"challenge", &EchoSigner).await.unwrap();
            assert!(assertion.user_present);
            assert_eq!(&assertion.signature[..4], &assertion.counter.to_be_bytes());
            assert_eq!(assertion.signature[4], 32);
            counters.push(assertion.counter);
        }
        assert_eq!(counters, vec![5, 6, 7]);
        assert_eq!(manager.state(), TokenState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_strictly_increase() {
        let mut manager = manager_with(SecureElementBus::new(EmulatedSecureElement::in_memory()));
        manager.init(false).unwrap();

        let mut previous = manager.read().unwrap();
        for _ in 0..20 {
            let assertion = manager.sign(b"m", &EchoSigner).await.unwrap();
            assert!(assertion.counter > previous);
            previous = assertion.counter;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_denied_does_not_touch_counter() {
        let (bus, log) = scripted(vec![Ok(10), Ok(11)]);
        let mut manager = manager_with(bus);
        let _handle = manager.init(true).unwrap().unwrap();

        let start = Instant::now();
        let err = manager.sign(b"challenge", &EchoSigner).await.unwrap_err();

        assert!(matches!(err, CustodyError::PresenceDenied));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(log.count_mode(MODE_INCREMENT), 0);
        assert_eq!(manager.state(), TokenState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_presence_allows_increment() {
        let (bus, log) = scripted(vec![Ok(10), Ok(11)]);
        let mut manager = manager_with(bus);
        let handle = manager.init(true).unwrap().unwrap();
        let manager = Arc::new(manager);

        let signing = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.sign(b"challenge", &EchoSigner).await })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.state(), TokenState::AwaitingPresence);
        assert!(handle.confirm());

        let assertion = signing.await.unwrap().unwrap();
        assert_eq!(assertion.counter, 11);
        assert_eq!(log.count_mode(MODE_INCREMENT), 1);
        assert_eq!(manager.state(), TokenState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sign_is_rejected() {
        let (bus, log) = scripted(vec![Ok(0), Ok(1)]);
        let mut manager = manager_with(bus);
        let handle = manager.init(true).unwrap().unwrap();
        let manager = Arc::new(manager);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.sign(b"a", &EchoSigner).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = manager.sign(b"b", &EchoSigner).await.unwrap_err();
        assert!(matches!(
            err,
            CustodyError::InvalidState {
                actual: "AwaitingPresence",
                ..
            }
        ));

        assert!(handle.confirm());
        assert_eq!(first.await.unwrap().unwrap().counter, 1);
        assert_eq!(log.count_mode(MODE_INCREMENT), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_fault_aborts_operation() {
        let (bus, _log) = scripted(vec![
            Ok(1),
            Err(SecureElementError::Communication("bus reset".to_string())),
            Ok(3),
        ]);
        let mut manager = manager_with(bus);
        manager.init(false).unwrap();

        let err = manager.sign(b"m", &EchoSigner).await.unwrap_err();
        assert!(matches!(err, CustodyError::CounterHardware(_)));
        assert_eq!(manager.state(), TokenState::Ready);

        // the next caller gets a fresh attempt
        assert_eq!(manager.sign(b"m", &EchoSigner).await.unwrap().counter, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signer_failure_keeps_counter_advanced() {
        let mut manager = manager_with(SecureElementBus::new(EmulatedSecureElement::in_memory()));
        manager.init(false).unwrap();

        let err = manager.sign(b"m", &FailingSigner).await.unwrap_err();
        assert!(matches!(err, CustodyError::Signing(ref reason) if reason == "usb stall"));
        assert_eq!(manager.read().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_require_presence_grant() {
        let (bus, log) = scripted(vec![Ok(0), Ok(1), Ok(2)]);
        let mut manager = manager_with(bus);
        manager.init(false).unwrap();

        assert!(matches!(manager.increment(), Err(CustodyError::PresenceDenied)));
        assert_eq!(log.count_mode(MODE_INCREMENT), 0);

        assert!(manager.user_presence().await);
        assert_eq!(manager.increment().unwrap(), 1);
        // the grant is single use
        assert!(matches!(manager.increment(), Err(CustodyError::PresenceDenied)));

        assert!(manager.user_presence().await);
        tokio::time::advance(PRESENCE_GRANT_TTL + Duration::from_secs(1)).await;
        assert!(matches!(manager.increment(), Err(CustodyError::PresenceDenied)));
        assert_eq!(log.count_mode(MODE_INCREMENT), 1);
    }

    fn unmanaged_zero_timeout() -> TokenCustodyManager {
        let store = key_store();
        let sealed = store.seal(&[0x11; 32], TOKEN_DIVERSIFIER).unwrap();
        let mut manager = TokenCustodyManager::new(
            store,
            SecureElementBus::new(EmulatedSecureElement::in_memory()),
            PresenceSettings {
                timeout: Duration::ZERO,
                ..PresenceSettings::default()
            },
        );
        manager
            .configure(&[0x04; 65], &sealed.to_bytes(), true)
            .unwrap();
        manager.init(false).unwrap();
        manager
    }

    // real clock: time always moves between confirmation and increment
    #[tokio::test]
    async fn test_unmanaged_presence_with_zero_timeout_signs() {
        let manager = unmanaged_zero_timeout();

        for expected in 1..=20 {
            let assertion = manager.sign(b"challenge", &EchoSigner).await.unwrap();
            assert_eq!(assertion.counter, expected);
        }
        assert_eq!(manager.state(), TokenState::Ready);
    }

    #[tokio::test]
    async fn test_hook_grant_outlives_zero_confirm_timeout() {
        let manager = unmanaged_zero_timeout();

        assert!(manager.user_presence().await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.increment().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_before_init_fails() {
        let manager = manager_with(SecureElementBus::new(EmulatedSecureElement::in_memory()));
        assert!(matches!(
            manager.sign(b"m", &EchoSigner).await,
            Err(CustodyError::NotConfigured)
        ));
        assert!(!manager.user_presence().await);
    }
}
