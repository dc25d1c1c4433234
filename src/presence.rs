//! Time-bounded user presence confirmation.
//!
//! A managed gate blinks an indicator while it waits for a confirmation
//! delivered through its [`PresenceHandle`]. An unmanaged gate has no
//! confirmation channel and assumes presence.
//!
//! At most one request is outstanding per gate. A second concurrent
//! `confirm` is rejected, never queued.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Default confirmation window.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default indicator toggle period.
pub const DEFAULT_BLINK_INTERVAL: Duration = Duration::from_millis(200);

/// Something that can show the user a request is pending (usually an LED).
pub trait Indicator: Send + Sync + 'static {
    fn set(&self, on: bool);
}

/// Indicator that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn set(&self, on: bool) {
        trace!(on, "presence indicator");
    }
}

/// LED exposed through the Linux LED class (`/sys/class/leds/<name>`).
#[derive(Debug, Clone)]
pub struct SysfsLed {
    brightness: PathBuf,
}

impl SysfsLed {
    pub fn new(name: &str) -> Self {
        Self {
            brightness: PathBuf::from("/sys/class/leds").join(name).join("brightness"),
        }
    }
}

impl Indicator for SysfsLed {
    fn set(&self, on: bool) {
        if let Err(e) = fs::write(&self.brightness, if on { "1" } else { "0" }) {
            debug!(path = ?self.brightness, error = %e, "failed to set LED");
        }
    }
}

type PendingRequest = Arc<Mutex<Option<oneshot::Sender<()>>>>;

/// Delivers confirmations to a managed gate (e.g. from the management
/// console).
#[derive(Clone)]
pub struct PresenceHandle {
    pending: PendingRequest,
}

impl PresenceHandle {
    /// Confirm the outstanding request, if any.
    ///
    /// Returns `false` when nothing is waiting; the confirmation is then
    /// dropped so it cannot satisfy a later request.
    pub fn confirm(&self) -> bool {
        let request = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match request {
            Some(tx) => tx.send(()).is_ok(),
            None => {
                debug!("presence confirmation with no outstanding request");
                false
            }
        }
    }

    /// Whether a request is currently waiting for confirmation.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl fmt::Debug for PresenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceHandle")
            .field("pending", &self.is_pending())
            .finish()
    }
}

enum Mode {
    Unmanaged,
    Managed {
        pending: PendingRequest,
        indicator: Arc<dyn Indicator>,
        blink_interval: Duration,
    },
}

pub struct PresenceGate {
    mode: Mode,
}

impl PresenceGate {
    /// Gate with no confirmation channel: presence is always assumed.
    pub fn unmanaged() -> Self {
        Self {
            mode: Mode::Unmanaged,
        }
    }

    pub fn managed(indicator: Arc<dyn Indicator>, blink_interval: Duration) -> (Self, PresenceHandle) {
        let pending: PendingRequest = Arc::new(Mutex::new(None));
        let handle = PresenceHandle {
            pending: pending.clone(),
        };
        let gate = Self {
            mode: Mode::Managed {
                pending,
                indicator,
                blink_interval,
            },
        };
        (gate, handle)
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.mode, Mode::Managed { .. })
    }

    /// Wait up to `timeout` for the user to confirm presence.
    ///
    /// The indicator task is stopped and the indicator switched off before
    /// this returns, whatever the outcome.
    pub async fn confirm(&self, timeout: Duration) -> bool {
        let Mode::Managed {
            pending,
            indicator,
            blink_interval,
        } = &self.mode
        else {
            return true;
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = pending.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
                warn!("presence request already outstanding, rejecting");
                return false;
            }
            *slot = Some(tx);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let blinker = tokio::spawn(blink(indicator.clone(), *blink_interval, stop_rx));

        info!(
            timeout_secs = timeout.as_secs(),
            "user presence request, confirm within timeout"
        );

        let present = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));

        // withdraw the request if it was not consumed. Our receiver is gone
        // by now, so an open sender belongs to a newer request.
        {
            let mut slot = pending.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|tx| tx.is_closed()) {
                slot.take();
            }
        }

        let _ = stop_tx.send(());
        if let Err(e) = blinker.await {
            warn!(error = %e, "presence indicator task failed");
            indicator.set(false);
        }

        if present {
            info!("user presence confirmed");
        } else {
            info!("user presence request timed out");
        }

        present
    }
}

impl fmt::Debug for PresenceGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceGate")
            .field("managed", &self.is_managed())
            .finish()
    }
}

async fn blink(indicator: Arc<dyn Indicator>, interval: Duration, mut stop: oneshot::Receiver<()>) {
    let mut on = false;

    loop {
        on = !on;
        indicator.set(on);

        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    indicator.set(false);
}
