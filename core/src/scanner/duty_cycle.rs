//! Reference-counted, duty-cycled scanner.
//!
//! One physical scan is shared by any number of subscribers. The first
//! subscriber starts the backend, the last one to leave stops it. While
//! running, the scan alternates between an on-window and an off-window so
//! the radio is never held continuously.

use crate::timer::{TimerFired, TimerKind, Timers};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Receives scan results for as long as it stays subscribed.
pub trait ScanListener: Send + Sync {
    fn on_device(&self, address: &str, rssi: i16, advertisement: &[u8]);
}

/// Platform scan primitive. Results are fed back through
/// [`ScannerHandle::report_device`].
#[cfg_attr(test, mockall::automock)]
pub trait ScanBackend: Send + Sync {
    fn is_available(&self) -> bool;
    fn start(&self) -> Result<(), ScannerError>;
    fn stop(&self);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Scanning unavailable")]
    Unavailable,
    #[error("Scan backend error: {0}")]
    Backend(String),
    #[error("Scanner stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanConfig {
    pub scan_window: Duration,
    pub idle_window: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(30),
            idle_window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScannerState {
    /// Backend stopped, no duty cycle running
    Idle,
    Scanning,
    /// Between two on-windows
    Paused,
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerState::Idle => write!(f, "idle"),
            ScannerState::Scanning => write!(f, "scanning"),
            ScannerState::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScannerStatus {
    pub state: ScannerState,
    pub subscribers: usize,
    /// Number of times the backend was started
    pub scan_starts: u64,
}

enum ScannerCommand {
    Subscribe(Arc<dyn ScanListener>),
    Unsubscribe(usize),
    Device {
        address: String,
        rssi: i16,
        advertisement: Vec<u8>,
    },
    Radio(bool),
    Timer(TimerFired),
    Status {
        reply: oneshot::Sender<ScannerStatus>,
    },
    Shutdown,
}

fn listener_key(listener: &Arc<dyn ScanListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

/// Cloneable handle to the scanner actor.
#[derive(Clone)]
pub struct ScannerHandle {
    tx: mpsc::UnboundedSender<ScannerCommand>,
}

impl ScannerHandle {
    /// Subscribe `listener`. Subscribing the same listener twice is a no-op.
    pub fn start_scan(&self, listener: Arc<dyn ScanListener>) -> Result<(), ScannerError> {
        self.send(ScannerCommand::Subscribe(listener))
    }

    pub fn stop_scan(&self, listener: &Arc<dyn ScanListener>) {
        let _ = self.send(ScannerCommand::Unsubscribe(listener_key(listener)));
    }

    /// Feed one backend scan result to every subscriber.
    pub fn report_device(&self, address: impl Into<String>, rssi: i16, advertisement: Vec<u8>) {
        let _ = self.send(ScannerCommand::Device {
            address: address.into(),
            rssi,
            advertisement,
        });
    }

    pub fn radio_state_changed(&self, enabled: bool) {
        let _ = self.send(ScannerCommand::Radio(enabled));
    }

    pub async fn status(&self) -> Result<ScannerStatus, ScannerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ScannerCommand::Status { reply })?;
        rx.await.map_err(|_| ScannerError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.send(ScannerCommand::Shutdown);
    }

    fn send(&self, command: ScannerCommand) -> Result<(), ScannerError> {
        self.tx.send(command).map_err(|_| ScannerError::Stopped)
    }
}

pub struct DutyCycledScanner {
    backend: Arc<dyn ScanBackend>,
    config: ScanConfig,
    subscribers: HashMap<usize, Arc<dyn ScanListener>>,
    state: ScannerState,
    scan_starts: u64,
    timers: Timers,
}

impl DutyCycledScanner {
    /// Start the scanner actor and return its handle.
    pub fn spawn(backend: Arc<dyn ScanBackend>, config: ScanConfig) -> ScannerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = tx.downgrade();
        let timers = Timers::new(Arc::new(move |fired| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(ScannerCommand::Timer(fired));
            }
        }));

        let scanner = Self {
            backend,
            config,
            subscribers: HashMap::new(),
            state: ScannerState::Idle,
            scan_starts: 0,
            timers,
        };
        tokio::spawn(scanner.run(rx));
        ScannerHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ScannerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                ScannerCommand::Subscribe(listener) => self.subscribe(listener),
                ScannerCommand::Unsubscribe(key) => self.unsubscribe(key),
                ScannerCommand::Device {
                    address,
                    rssi,
                    advertisement,
                } => self.dispatch(&address, rssi, &advertisement),
                ScannerCommand::Radio(enabled) => self.on_radio(enabled),
                ScannerCommand::Timer(fired) => self.on_timer(fired),
                ScannerCommand::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                ScannerCommand::Shutdown => break,
            }
        }
        self.perform_stop(true);
        debug!("scanner: actor exited");
    }

    fn subscribe(&mut self, listener: Arc<dyn ScanListener>) {
        let key = listener_key(&listener);
        if self.subscribers.insert(key, listener).is_some() {
            return;
        }
        debug!("scanner: subscriber added ({} total)", self.subscribers.len());
        if self.subscribers.len() == 1 {
            self.perform_start();
        }
    }

    fn unsubscribe(&mut self, key: usize) {
        if self.subscribers.remove(&key).is_none() {
            return;
        }
        debug!("scanner: subscriber removed ({} left)", self.subscribers.len());
        if self.subscribers.is_empty() {
            self.perform_stop(true);
        }
    }

    fn perform_start(&mut self) {
        if self.state == ScannerState::Scanning {
            return;
        }
        if !self.backend.is_available() {
            warn!("scanner: backend unavailable, staying idle");
            self.timers.cancel_all();
            self.state = ScannerState::Idle;
            return;
        }
        match self.backend.start() {
            Ok(()) => {
                self.state = ScannerState::Scanning;
                self.scan_starts += 1;
                self.timers
                    .arm(TimerKind::ScanWindow, self.config.scan_window);
                info!("scanner: scan window opened");
            }
            Err(e) => {
                warn!("scanner: failed to start: {}", e);
                self.state = ScannerState::Idle;
            }
        }
    }

    /// `full` ends the duty cycle; otherwise the off-window starts.
    fn perform_stop(&mut self, full: bool) {
        if self.state == ScannerState::Scanning {
            self.backend.stop();
        }
        if full {
            self.timers.cancel_all();
            if self.state != ScannerState::Idle {
                info!("scanner: stopped");
            }
            self.state = ScannerState::Idle;
        } else {
            self.state = ScannerState::Paused;
            self.timers
                .arm(TimerKind::IdleWindow, self.config.idle_window);
            debug!("scanner: scan window closed");
        }
    }

    fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            return;
        }
        match fired.kind {
            TimerKind::ScanWindow if self.state == ScannerState::Scanning => {
                self.perform_stop(false);
            }
            TimerKind::IdleWindow if self.state == ScannerState::Paused => {
                if self.subscribers.is_empty() {
                    self.state = ScannerState::Idle;
                } else {
                    self.perform_start();
                }
            }
            _ => {}
        }
    }

    fn on_radio(&mut self, enabled: bool) {
        if enabled {
            if !self.subscribers.is_empty() && self.state == ScannerState::Idle {
                self.perform_start();
            }
        } else {
            self.perform_stop(true);
        }
    }

    fn dispatch(&self, address: &str, rssi: i16, advertisement: &[u8]) {
        for listener in self.subscribers.values() {
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                listener.on_device(address, rssi, advertisement)
            }));
            if delivered.is_err() {
                error!("scanner: listener panicked on {}", address);
            }
        }
    }

    fn status(&self) -> ScannerStatus {
        ScannerStatus {
            state: self.state,
            subscribers: self.subscribers.len(),
            scan_starts: self.scan_starts,
        }
    }
}
