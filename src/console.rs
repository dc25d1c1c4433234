//! Management console.
//!
//! Line oriented commands against a booted [`Device`]:
//!
//! ```text
//! p          confirm user presence
//! s <hex>    run a token signing request over <hex>
//! c          read the token counter
//! i          initialize credentials not initialized at boot
//! q          quit
//! ```
//!
//! Signing requests hold a shared lock on the device for as long as they
//! wait for presence. Initialization needs it exclusively and is refused,
//! not queued, while a request is in flight.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::custody::{CredentialSigner, SignedAssertion, TokenHooks};
use crate::device::Device;
use crate::error::{ConsoleError, CustodyError, CustodyResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    ConfirmPresence,
    Sign(Vec<u8>),
    Counter,
    Init,
    Quit,
}

impl ConsoleCommand {
    /// Parse one console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let mut words = line.split_whitespace();
        let command = match words.next() {
            Some("p") => Self::ConfirmPresence,
            Some("s") => Self::Sign(hex::decode(words.next().unwrap_or_default())?),
            Some("c") => Self::Counter,
            Some("i") => Self::Init,
            Some("q") => Self::Quit,
            Some(other) => return Err(ConsoleError::UnknownCommand(other.to_string())),
            None => return Ok(None),
        };
        Ok(Some(command))
    }
}

pub struct Console<S> {
    device: Arc<RwLock<Device>>,
    signer: Arc<S>,
}

impl<S> Console<S>
where
    S: CredentialSigner + Send + Sync + 'static,
{
    pub fn new(device: Arc<RwLock<Device>>, signer: S) -> Self {
        Self {
            device,
            signer: Arc::new(signer),
        }
    }

    /// Deliver a presence confirmation. `false` when nothing is waiting or
    /// presence is not managed.
    pub async fn confirm_presence(&self) -> bool {
        let device = self.device.read().await;
        match device.presence_handle() {
            Some(handle) => handle.confirm(),
            None => {
                info!("presence is not managed");
                false
            }
        }
    }

    /// Start a signing request in the background. The outcome is logged
    /// and also returned through the handle.
    pub fn sign(&self, message: Vec<u8>) -> JoinHandle<CustodyResult<SignedAssertion>> {
        let device = self.device.clone();
        let signer = self.signer.clone();

        tokio::spawn(async move {
            let device = device.read_owned().await;
            let token = device.token().ok_or(CustodyError::NotConfigured)?;

            match token.sign(&message, signer.as_ref()).await {
                Ok(assertion) => {
                    info!(
                        counter = assertion.counter,
                        signature = %hex::encode(&assertion.signature),
                        "sign request completed"
                    );
                    Ok(assertion)
                }
                Err(e) => {
                    error!(error = %e, "sign request failed");
                    Err(e)
                }
            }
        })
    }

    pub async fn counter(&self) -> CustodyResult<u32> {
        let device = self.device.read().await;
        device.token().ok_or(CustodyError::NotConfigured)?.read()
    }

    /// Initialize the credentials left uninitialized at boot.
    pub fn init(&self) -> CustodyResult<()> {
        let mut device = self.device.try_write().map_err(|_| CustodyError::Busy)?;
        device.init_credentials();
        Ok(())
    }

    pub async fn execute(&self, command: ConsoleCommand) -> ControlFlow<()> {
        match command {
            ConsoleCommand::ConfirmPresence => {
                if !self.confirm_presence().await {
                    info!("no presence request pending");
                }
            }
            ConsoleCommand::Sign(message) => {
                let _ = self.sign(message);
            }
            ConsoleCommand::Counter => match self.counter().await {
                Ok(counter) => info!(counter, "token counter"),
                Err(e) => error!(error = %e, "counter read failed"),
            },
            ConsoleCommand::Init => match self.init() {
                Ok(()) => info!("credentials initialized"),
                Err(e) => warn!(error = %e, "initialization refused"),
            },
            ConsoleCommand::Quit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}
