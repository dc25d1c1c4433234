//! TPM 2.0 adapters for the key-derivation engine and the counter.
//!
//! Each call opens its own ESAPI context from the configured TCTI, so the
//! adapters hold no TPM resources between calls.

use tracing::{debug, error, instrument, trace};
use tss_esapi::attributes::{NvIndexAttributesBuilder, ObjectAttributesBuilder};
use tss_esapi::constants::{AlgorithmIdentifier, CapabilityType, NvIndexType, PropertyTag};
use tss_esapi::handles::{KeyHandle, NvIndexHandle, NvIndexTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm, SymmetricMode};
use tss_esapi::interface_types::resource_handles::{Hierarchy, NvAuth, Provision};
use tss_esapi::structures::{
    CapabilityData, Digest, InitialValue, MaxBuffer, NvPublicBuilder, PublicBuilder,
    SymmetricCipherParameters, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TabrmdConfig;
use tss_esapi::{Context, TctiNameConf};
use zeroize::Zeroizing;

use crate::counter::{MODE_INCREMENT, MODE_READ};
use crate::error::{KeyDerivationError, SecureElementError};
use crate::keystore::KeyDerivationEngine;
use crate::secure_element::{COUNTER_OPCODE, Command, ElementInfo, SecureElement};

const AES_BLOCK_SIZE: usize = 16;

/// First NV index used for counter slots (owner range).
pub const DEFAULT_NV_COUNTER_BASE: u32 = 0x0150_0020;

/// NV counters are 64 bit.
const NV_COUNTER_SIZE: u16 = 8;

const COUNTER_SLOTS: u8 = 2;

pub fn default_tcti_handle() -> TctiNameConf {
    TctiNameConf::from_environment_variable()
        .unwrap_or(TctiNameConf::Tabrmd(TabrmdConfig::default()))
}

fn engine_error(e: tss_esapi::Error) -> KeyDerivationError {
    KeyDerivationError::Engine(e.to_string())
}

fn bus_error(e: tss_esapi::Error) -> SecureElementError {
    SecureElementError::Communication(e.to_string())
}

pub fn is_aes_cfb_supported(ctx: &mut Context) -> Result<bool, tss_esapi::Error> {
    let (data, _) = ctx.get_capability(CapabilityType::Algorithms, 0, 50)?;

    if let CapabilityData::Algorithms(algorithms) = data {
        let has = |id| algorithms.iter().any(|algo| algo.algorithm_identifier() == id);
        Ok(has(AlgorithmIdentifier::Aes) && has(AlgorithmIdentifier::Cfb))
    } else {
        error!("Unexpected capability data type: {:?}", data);
        Err(tss_esapi::Error::WrapperError(
            tss_esapi::WrapperErrorKind::UnsupportedParam,
        ))
    }
}

/// PKCS#7 padding to a whole number of AES blocks.
fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let padding = AES_BLOCK_SIZE - (data.len() % AES_BLOCK_SIZE);
    let mut padded = data.to_vec();
    padded.resize(data.len() + padding, padding as u8);
    padded
}

/// Key derivation inside the TPM.
///
/// The root is an AES-128-CFB primary key in the owner hierarchy. Its
/// sensitive part is derived from the hierarchy seed, so the same key comes
/// back on every boot and never leaves the TPM. A derived key is the last
/// CFB block of the padded diversifier encrypted with the salt as IV.
pub struct TpmKeyEngine {
    tcti: TctiNameConf,
}

impl TpmKeyEngine {
    pub fn new(tcti: TctiNameConf) -> Self {
        Self { tcti }
    }

    #[instrument(level = "debug", skip(ctx))]
    fn create_root(ctx: &mut Context) -> Result<KeyHandle, tss_esapi::Error> {
        // unrestricted so that it may encrypt caller data directly
        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_sign_encrypt(true)
            .with_restricted(false)
            .build()?;

        let public = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::SymCipher)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
                SymmetricDefinitionObject::AES_128_CFB,
            ))
            .with_symmetric_cipher_unique_identifier(Digest::default())
            .build()?;

        trace!(?public, "Creating derivation root");

        let result = ctx.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
        })?;
        Ok(result.key_handle)
    }

    fn derive(
        ctx: &mut Context,
        diversifier: &[u8],
        salt: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KeyDerivationError> {
        let iv = InitialValue::try_from(salt.to_vec()).map_err(engine_error)?;
        let data = MaxBuffer::try_from(pkcs7_pad(diversifier)).map_err(engine_error)?;

        let root = Self::create_root(ctx).map_err(engine_error)?;
        let result = ctx.execute_with_nullauth_session(|ctx| {
            ctx.encrypt_decrypt_2(root, false, SymmetricMode::Cfb, data, iv)
        });
        if let Err(e) = ctx.flush_context(root.into()) {
            debug!(error = %e, "failed to flush derivation root");
        }

        let (encrypted, _) = result.map_err(engine_error)?;
        let encrypted = Zeroizing::new(encrypted.to_vec());
        Ok(Zeroizing::new(
            encrypted[encrypted.len() - AES_BLOCK_SIZE..].to_vec(),
        ))
    }
}

impl KeyDerivationEngine for TpmKeyEngine {
    fn is_available(&mut self) -> bool {
        match Context::new(self.tcti.clone()) {
            Ok(mut ctx) => is_aes_cfb_supported(&mut ctx).unwrap_or_else(|e| {
                debug!(error = %e, "TPM capability query failed");
                false
            }),
            Err(e) => {
                debug!(error = %e, "TPM not reachable");
                false
            }
        }
    }

    #[instrument(level = "debug", skip_all)]
    fn derive_key(
        &mut self,
        diversifier: &[u8],
        salt: &[u8],
        key_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, KeyDerivationError> {
        if key_len != AES_BLOCK_SIZE {
            return Err(KeyDerivationError::KeyLength {
                expected: AES_BLOCK_SIZE,
                actual: key_len,
            });
        }
        if salt.len() != AES_BLOCK_SIZE {
            return Err(KeyDerivationError::Engine(format!(
                "salt must be {AES_BLOCK_SIZE} bytes, got {}",
                salt.len()
            )));
        }

        let mut ctx = Context::new(self.tcti.clone()).map_err(engine_error)?;
        Self::derive(&mut ctx, diversifier, salt)
    }
}

impl std::fmt::Debug for TpmKeyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmKeyEngine").finish_non_exhaustive()
    }
}

/// Counter slots kept in TPM NV counter indices.
///
/// Slot `n` lives at `nv_base + n`. A missing index is defined and
/// incremented once, since an NV counter cannot be read before its first
/// increment. Its starting value is chosen by the TPM.
pub struct TpmSecureElement {
    tcti: TctiNameConf,
    nv_base: u32,
}

impl TpmSecureElement {
    pub fn new(tcti: TctiNameConf) -> Self {
        Self::with_nv_base(tcti, DEFAULT_NV_COUNTER_BASE)
    }

    pub fn with_nv_base(tcti: TctiNameConf, nv_base: u32) -> Self {
        Self { tcti, nv_base }
    }

    fn context(&self) -> Result<Context, SecureElementError> {
        Context::new(self.tcti.clone()).map_err(bus_error)
    }

    fn counter_index(ctx: &mut Context, nv_index: NvIndexTpmHandle) -> Result<NvIndexHandle, tss_esapi::Error> {
        if let Ok(object) = ctx.tr_from_tpm_public(TpmHandle::NvIndex(nv_index)) {
            return Ok(NvIndexHandle::from(object));
        }

        debug!(index = ?nv_index, "defining NV counter");
        let attributes = NvIndexAttributesBuilder::new()
            .with_owner_write(true)
            .with_owner_read(true)
            .with_nv_index_type(NvIndexType::Counter)
            .build()?;
        let public = NvPublicBuilder::new()
            .with_nv_index(nv_index)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_data_area_size(NV_COUNTER_SIZE as usize)
            .build()?;

        let handle = ctx.execute_with_nullauth_session(|ctx| {
            ctx.nv_define_space(Provision::Owner, None, public)
        })?;
        ctx.execute_with_nullauth_session(|ctx| ctx.nv_increment(NvAuth::Owner, handle))?;
        Ok(handle)
    }

    fn read_counter(ctx: &mut Context, handle: NvIndexHandle, slot: u8) -> Result<u32, SecureElementError> {
        let data = ctx
            .execute_with_nullauth_session(|ctx| ctx.nv_read(NvAuth::Owner, handle, NV_COUNTER_SIZE, 0))
            .map_err(bus_error)?;

        let bytes: [u8; 8] = data
            .value()
            .try_into()
            .map_err(|_| SecureElementError::Communication("short NV counter read".to_string()))?;
        u32::try_from(u64::from_be_bytes(bytes)).map_err(|_| SecureElementError::CounterExhausted(slot))
    }
}

impl SecureElement for TpmSecureElement {
    fn self_test(&mut self) -> Result<(), SecureElementError> {
        let mut ctx = self.context()?;
        ctx.self_test(false).map_err(|e| {
            error!(error = %e, "TPM self test failed");
            SecureElementError::SelfTest
        })
    }

    fn info(&mut self) -> Result<ElementInfo, SecureElementError> {
        let mut ctx = self.context()?;
        let manufacturer = ctx
            .get_tpm_property(PropertyTag::Manufacturer)
            .map_err(bus_error)?
            .unwrap_or(0);
        let mut serial = Vec::with_capacity(8);
        for tag in [PropertyTag::FirmwareVersion1, PropertyTag::FirmwareVersion2] {
            let value = ctx.get_tpm_property(tag).map_err(bus_error)?.unwrap_or(0);
            serial.extend_from_slice(&value.to_be_bytes());
        }

        let model = String::from_utf8_lossy(&manufacturer.to_be_bytes())
            .trim_end_matches('\0')
            .trim()
            .to_string();
        Ok(ElementInfo {
            serial: hex::encode(serial),
            model: format!("TPM2 {model}"),
        })
    }

    #[instrument(level = "trace", skip(self))]
    fn execute(&mut self, command: &Command) -> Result<Vec<u8>, SecureElementError> {
        if command.opcode != COUNTER_OPCODE {
            return Err(SecureElementError::Unsupported {
                opcode: command.opcode,
                mode: command.mode,
            });
        }
        let slot = command.key_id[0];
        if slot >= COUNTER_SLOTS {
            return Err(SecureElementError::InvalidSlot(slot));
        }

        let mut ctx = self.context()?;
        let nv_index = NvIndexTpmHandle::new(self.nv_base + u32::from(slot)).map_err(bus_error)?;
        let handle = Self::counter_index(&mut ctx, nv_index).map_err(bus_error)?;

        match command.mode {
            MODE_READ => {}
            MODE_INCREMENT => {
                ctx.execute_with_nullauth_session(|ctx| ctx.nv_increment(NvAuth::Owner, handle))
                    .map_err(bus_error)?;
            }
            mode => {
                return Err(SecureElementError::Unsupported {
                    opcode: command.opcode,
                    mode,
                });
            }
        }

        let value = Self::read_counter(&mut ctx, handle, slot)?;
        Ok(value.to_le_bytes().to_vec())
    }
}

impl std::fmt::Debug for TpmSecureElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmSecureElement")
            .field("nv_base", &format_args!("{:#010x}", self.nv_base))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MonotonicCounter;
    use crate::secure_element::SecureElementBus;
    use serial_test::serial;
    use tss_esapi::tcti_ldr::NetworkTPMConfig;

    fn test_tcti() -> TctiNameConf {
        TctiNameConf::from_environment_variable()
            .unwrap_or(TctiNameConf::Swtpm(NetworkTPMConfig::default()))
    }

    #[test]
    fn test_padding() {
        assert_eq!(pkcs7_pad(b"").len(), 16);
        assert_eq!(pkcs7_pad(&[0u8; 16]).len(), 32);
        assert_eq!(pkcs7_pad(b"warden:u2f-token").len(), 32);
        assert_eq!(pkcs7_pad(&[1u8; 5])[15], 11);
    }

    #[test]
    #[serial]
    fn test_tpm_derivation_is_deterministic() {
        let mut engine = TpmKeyEngine::new(test_tcti());
        assert!(engine.is_available());

        let a = engine.derive_key(b"one", &[0u8; 16], 16).unwrap();
        let b = engine.derive_key(b"one", &[0u8; 16], 16).unwrap();
        let c = engine.derive_key(b"two", &[0u8; 16], 16).unwrap();
        let d = engine.derive_key(b"one", &[7u8; 16], 16).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_ne!(*a, *d);

        assert!(matches!(
            engine.derive_key(b"one", &[0u8; 16], 32),
            Err(KeyDerivationError::KeyLength { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_nv_counter_increments() {
        let element = TpmSecureElement::new(test_tcti());
        let counter = MonotonicCounter::new(SecureElementBus::new(element));

        let start = counter.init().unwrap();
        let next = counter.increment().unwrap();
        assert!(next > start);
        assert_eq!(counter.read().unwrap(), next);
    }
}
