//! Host runner for the custody core.
//!
//! Boots a device from a TOML configuration and serves the management
//! console (see [`warden::console`]) on stdin.

use std::error::Error;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{RwLock, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use warden::{
    Console, ConsoleCommand, CredentialSigner, Device, DeviceConfig, Hardware,
    PlaintextKeyMaterial,
};

/// Digest over key, message and counter. Stands in for the protocol
/// layer's signature primitive on hosts.
struct DigestSigner;

impl CredentialSigner for DigestSigner {
    fn sign(
        &self,
        key: &PlaintextKeyMaterial,
        message: &[u8],
        counter: u32,
    ) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        let mut hasher = Sha256::new();
        hasher.update(key.expose());
        hasher.update(message);
        hasher.update(counter.to_be_bytes());
        Ok(hasher.finalize().to_vec())
    }
}

#[cfg(not(feature = "tpm"))]
fn hardware(config: &DeviceConfig) -> Result<Hardware, Box<dyn Error>> {
    Ok(Hardware::emulated(&config.emulator)?)
}

#[cfg(feature = "tpm")]
fn hardware(_config: &DeviceConfig) -> Result<Hardware, Box<dyn Error>> {
    use warden::SecureElementBus;
    use warden::tpm::{TpmKeyEngine, TpmSecureElement, default_tcti_handle};

    let tcti = default_tcti_handle();
    let machine_id = std::fs::read_to_string("/etc/machine-id")?;
    Ok(Hardware {
        bus: SecureElementBus::new(TpmSecureElement::new(tcti.clone())),
        engine: Some(Box::new(TpmKeyEngine::new(tcti))),
        unique_id: hex::decode(machine_id.trim())?,
    })
}

async fn console(console: Console<DigestSigner>, started: oneshot::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let _ = started.send(());
    info!("console started");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "console read failed");
                break;
            }
        };

        match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => {
                if console.execute(command).await.is_break() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "invalid console input"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => DeviceConfig::load(&path)?,
        None => {
            warn!("no configuration file given, using defaults");
            DeviceConfig::default()
        }
    };

    let hardware = hardware(&config)?;
    let device = Arc::new(RwLock::new(Device::boot(config, hardware)?));

    let (started_tx, started_rx) = oneshot::channel();
    let console = tokio::spawn(console(
        Console::new(device.clone(), DigestSigner),
        started_tx,
    ));

    device.read().await.start(Some(started_rx)).await;
    console.await?;

    Ok(())
}
