//! Device handle and session actor.
//!
//! Every [`BleDevice`] is backed by one task that owns the connector, the
//! operation queue and the reconnection guardian. Public calls become
//! messages on its channel; host callbacks, timer expiries and assist-scan
//! sightings are posted onto the same channel, so all session state is
//! mutated from a single consumer.

use super::connector::{Connector, ConnectorPorts};
use super::guardian::{GuardianPolicy, GuardianStatus, ReconnectAction, ReconnectionGuardian};
use super::task::{Completion, WriteRequest};
use super::{resolve_target, Access, ConnectionState, SessionEvent};
use crate::config::{DeviceAddress, SessionConfig, DEFAULT_MTU};
use crate::gatt::descriptor::CharacteristicDescriptor;
use crate::gatt::registry::CharacteristicRegistry;
use crate::host::{HostCapability, HostEvent, WriteMode};
use crate::scanner::ScannerHandle;
use crate::timer::{TimerFired, TimerKind, TimerPost, Timers};
use crate::BleError;
use parking_lot::RwLock;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Receives every [`SessionEvent`] of the devices it is registered on.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, address: &DeviceAddress, event: &SessionEvent);
}

impl<F> SessionObserver for F
where
    F: Fn(&DeviceAddress, &SessionEvent) + Send + Sync,
{
    fn on_event(&self, address: &DeviceAddress, event: &SessionEvent) {
        self(address, event)
    }
}

/// Point-in-time view of a session, as reported by [`BleDevice::status`].
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub address: DeviceAddress,
    pub state: ConnectionState,
    pub mtu: u16,
    pub payload_size: usize,
    pub pending_operations: usize,
    /// Name of the operation awaiting a host callback
    pub in_flight: Option<&'static str>,
    pub guard: Option<GuardianStatus>,
    pub characteristics: usize,
    pub last_assist_rssi: Option<i16>,
}

enum SessionMessage {
    Connect,
    Reconnect,
    Disconnect,
    Close {
        reply: oneshot::Sender<()>,
    },
    Read {
        characteristic: Uuid,
        completion: Option<Completion>,
    },
    Write(WriteRequest),
    SetNotification {
        characteristic: Uuid,
        enable: bool,
        indication: bool,
    },
    RequestMtu(u16),
    SetPayloadSize(usize),
    SetGuard(bool),
    Foreground(bool),
    Radio(bool),
    Host(HostEvent),
    Timer(TimerFired),
    AssistSighting {
        rssi: i16,
    },
    MtuSettled(bool),
    Status {
        reply: oneshot::Sender<DeviceStatus>,
    },
}

/// Read-side mirror of actor state, refreshed after every message.
struct SessionSnapshot {
    mtu: u16,
    payload: usize,
    registry: CharacteristicRegistry,
}

type ObserverList = Arc<RwLock<Vec<Arc<dyn SessionObserver>>>>;

/// Handle to one peer's session. Cheap to clone; all clones drive the same
/// actor.
#[derive(Clone)]
pub struct BleDevice {
    address: DeviceAddress,
    tx: mpsc::UnboundedSender<SessionMessage>,
    state: watch::Receiver<ConnectionState>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    observers: ObserverList,
    closed: Arc<AtomicBool>,
}

impl BleDevice {
    /// Start the session actor for `config`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(
        config: SessionConfig,
        host: Arc<dyn HostCapability>,
        scanner: Option<ScannerHandle>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let snapshot = Arc::new(RwLock::new(SessionSnapshot {
            mtu: DEFAULT_MTU,
            payload: (DEFAULT_MTU - 3) as usize,
            registry: CharacteristicRegistry::new(),
        }));
        let observers: ObserverList = Arc::new(RwLock::new(Vec::new()));

        let actor = SessionActor::new(
            config.clone(),
            host,
            scanner,
            Poster(tx.downgrade()),
            state_tx,
            Arc::clone(&snapshot),
            Arc::clone(&observers),
        );
        tokio::spawn(actor.run(rx));
        info!("device {}: session started", config.address);

        Self {
            address: config.address,
            tx,
            state: state_rx,
            snapshot,
            observers,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    pub fn connect(&self) -> Result<(), BleError> {
        self.send(SessionMessage::Connect)
    }

    pub fn disconnect(&self) -> Result<(), BleError> {
        self.send(SessionMessage::Disconnect)
    }

    /// Release the session for good: stop guarding, cancel every
    /// operation, drop the link and end the actor. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reply, done) = oneshot::channel();
        if self.tx.send(SessionMessage::Close { reply }).is_ok() {
            let _ = done.await;
        }
        self.observers.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enable or disable guarded reconnect at runtime.
    pub fn set_guard_enabled(&self, enabled: bool) -> Result<(), BleError> {
        self.send(SessionMessage::SetGuard(enabled))
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub fn read(&self, characteristic: Uuid) -> Result<(), BleError> {
        self.check(&characteristic, Access::Read)?;
        self.send(SessionMessage::Read {
            characteristic,
            completion: None,
        })
    }

    /// Read with a completion; the value itself arrives as
    /// [`SessionEvent::ReadComplete`].
    pub fn read_with(
        &self,
        characteristic: Uuid,
        completion: impl FnOnce(bool) + Send + 'static,
    ) -> Result<(), BleError> {
        self.check(&characteristic, Access::Read)?;
        self.send(SessionMessage::Read {
            characteristic,
            completion: Some(Box::new(completion)),
        })
    }

    /// Write `data`. Payloads longer than the current payload size are sent
    /// as an ordered chunked transfer.
    pub fn write(
        &self,
        characteristic: Uuid,
        data: impl Into<Vec<u8>>,
        mode: Option<WriteMode>,
    ) -> Result<(), BleError> {
        let mut request = WriteRequest::new(characteristic, data);
        request.preference = mode;
        self.write_with(request)
    }

    pub fn write_with(&self, request: WriteRequest) -> Result<(), BleError> {
        self.check(&request.characteristic, Access::Write)?;
        self.send(SessionMessage::Write(request))
    }

    pub fn enable_notification(&self, characteristic: Uuid, enable: bool) -> Result<(), BleError> {
        self.check(&characteristic, Access::Notify)?;
        self.send(SessionMessage::SetNotification {
            characteristic,
            enable,
            indication: false,
        })
    }

    pub fn enable_indication(&self, characteristic: Uuid, enable: bool) -> Result<(), BleError> {
        self.check(&characteristic, Access::Indicate)?;
        self.send(SessionMessage::SetNotification {
            characteristic,
            enable,
            indication: true,
        })
    }

    pub fn request_mtu(&self, mtu: u16) -> Result<(), BleError> {
        self.ensure_open()?;
        let state = self.connection_state();
        if state != ConnectionState::Ready {
            return Err(BleError::NotReady(state));
        }
        self.send(SessionMessage::RequestMtu(mtu))
    }

    /// Set the chunk size used for long writes. Values above `mtu - 3` or
    /// below 20 fall back to `mtu - 3`; the effective size is returned.
    pub fn set_payload_size(&self, requested: usize) -> Result<usize, BleError> {
        self.ensure_open()?;
        let effective = {
            let mut snapshot = self.snapshot.write();
            let max = (snapshot.mtu.saturating_sub(3) as usize).max(20);
            let effective = if requested > max || requested < 20 {
                max
            } else {
                requested
            };
            snapshot.payload = effective;
            effective
        };
        self.send(SessionMessage::SetPayloadSize(requested))?;
        Ok(effective)
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn register_observer(&self, observer: Arc<dyn SessionObserver>) {
        let mut observers = self.observers.write();
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn SessionObserver>) {
        self.observers.write().retain(|o| !Arc::ptr_eq(o, observer));
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Ready
    }

    pub fn current_mtu(&self) -> u16 {
        self.snapshot.read().mtu
    }

    pub fn payload_size(&self) -> usize {
        self.snapshot.read().payload
    }

    pub fn characteristics(&self) -> Vec<CharacteristicDescriptor> {
        self.snapshot.read().registry.all().to_vec()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), BleError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| BleError::Closed)
    }

    pub async fn status(&self) -> Result<DeviceStatus, BleError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionMessage::Status { reply })?;
        rx.await.map_err(|_| BleError::Closed)
    }

    // ------------------------------------------------------------------
    // Manager hooks
    // ------------------------------------------------------------------

    pub(crate) fn set_app_foreground(&self, foreground: bool) {
        let _ = self.send(SessionMessage::Foreground(foreground));
    }

    pub(crate) fn radio_state_changed(&self, enabled: bool) {
        let _ = self.send(SessionMessage::Radio(enabled));
    }

    fn check(&self, characteristic: &Uuid, access: Access) -> Result<(), BleError> {
        self.ensure_open()?;
        let state = self.connection_state();
        let snapshot = self.snapshot.read();
        resolve_target(state, &snapshot.registry, characteristic, access).map(|_| ())
    }

    fn ensure_open(&self) -> Result<(), BleError> {
        if self.is_closed() {
            Err(BleError::Closed)
        } else {
            Ok(())
        }
    }

    fn send(&self, message: SessionMessage) -> Result<(), BleError> {
        self.ensure_open()?;
        self.tx.send(message).map_err(|_| BleError::Closed)
    }
}

/// Posts onto the actor's own channel without keeping it alive.
#[derive(Clone)]
struct Poster(mpsc::WeakUnboundedSender<SessionMessage>);

impl Poster {
    fn post(&self, message: SessionMessage) {
        if let Some(tx) = self.0.upgrade() {
            let _ = tx.send(message);
        }
    }

    fn timers(&self) -> TimerPost {
        let poster = self.clone();
        Arc::new(move |fired| poster.post(SessionMessage::Timer(fired)))
    }
}

struct SessionActor {
    config: SessionConfig,
    connector: Connector,
    guardian: Option<ReconnectionGuardian>,
    poster: Poster,
    state: watch::Sender<ConnectionState>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    observers: ObserverList,
}

impl SessionActor {
    fn new(
        config: SessionConfig,
        host: Arc<dyn HostCapability>,
        scanner: Option<ScannerHandle>,
        poster: Poster,
        state: watch::Sender<ConnectionState>,
        snapshot: Arc<RwLock<SessionSnapshot>>,
        observers: ObserverList,
    ) -> Self {
        let ports = {
            let (host_events, settled, sighting) = (poster.clone(), poster.clone(), poster.clone());
            ConnectorPorts {
                events: Arc::new(move |event| host_events.post(SessionMessage::Host(event))),
                timers: poster.timers(),
                mtu_settled: Arc::new(move |ok| settled.post(SessionMessage::MtuSettled(ok))),
                sighting: Arc::new(move |rssi| {
                    sighting.post(SessionMessage::AssistSighting { rssi })
                }),
                scanner,
            }
        };
        let connector = Connector::new(config.clone(), host, ports);

        let mut actor = Self {
            config,
            connector,
            guardian: None,
            poster,
            state,
            snapshot,
            observers,
        };
        if actor.config.enable_guarded_reconnect {
            actor.set_guard(true);
        }
        actor
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        while let Some(message) = rx.recv().await {
            if let SessionMessage::Close { reply } = message {
                self.shutdown();
                self.flush();
                self.publish();
                let _ = reply.send(());
                break;
            }
            self.handle(message);
            self.flush();
            self.publish();
        }

        if self.connector.state() != ConnectionState::Disconnected {
            self.shutdown();
            self.flush();
            self.publish();
        }
        debug!("device {}: actor exited", self.config.address);
    }

    fn handle(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Connect => self.connector.connect(),
            SessionMessage::Reconnect => {
                if self.is_guarding() {
                    self.connector.connect();
                }
            }
            SessionMessage::Disconnect => self.connector.disconnect(),
            SessionMessage::Close { .. } => {}
            SessionMessage::Read {
                characteristic,
                completion,
            } => self.connector.read(characteristic, completion),
            SessionMessage::Write(request) => self.connector.write(request),
            SessionMessage::SetNotification {
                characteristic,
                enable,
                indication,
            } => self
                .connector
                .set_notification(characteristic, enable, indication, None),
            SessionMessage::RequestMtu(mtu) => self.connector.request_mtu(mtu, None),
            SessionMessage::SetPayloadSize(size) => {
                self.connector.set_payload_size(size);
            }
            SessionMessage::SetGuard(enabled) => self.set_guard(enabled),
            SessionMessage::Foreground(foreground) => self.on_foreground(foreground),
            SessionMessage::Radio(enabled) => {
                self.dispatch(&SessionEvent::RadioAvailabilityChanged(enabled));
                if enabled && self.is_guarding() && !self.is_ready() {
                    self.connector.connect();
                }
            }
            SessionMessage::Host(event) => self.connector.on_host_event(event),
            SessionMessage::Timer(fired) if fired.kind == TimerKind::Reconnect => {
                if let Some(guardian) = self.guardian.as_mut() {
                    guardian.on_timer(fired);
                }
            }
            SessionMessage::Timer(fired) => self.connector.on_timer(fired),
            SessionMessage::AssistSighting { rssi } => self.connector.on_assist_sighting(rssi),
            SessionMessage::MtuSettled(ok) => self.connector.on_mtu_settled(ok),
            SessionMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn set_guard(&mut self, enabled: bool) {
        if enabled {
            let guardian = self.guardian.get_or_insert_with(|| {
                let poster = self.poster.clone();
                let reconnect: ReconnectAction =
                    Arc::new(move || poster.post(SessionMessage::Reconnect));
                ReconnectionGuardian::new(
                    GuardianPolicy::default(),
                    self.config.reconnect_interval(),
                    self.config.max_reconnect_attempts,
                    reconnect,
                    Timers::new(self.poster.timers()),
                )
            });
            guardian.start();
        } else if let Some(guardian) = self.guardian.as_mut() {
            guardian.stop();
        }
    }

    fn on_foreground(&mut self, foreground: bool) {
        let ready = self.is_ready();
        if foreground {
            if let Some(guardian) = self.guardian.as_mut() {
                guardian.resume(ready);
            }
            if self.is_guarding() && !ready {
                self.connector.connect();
            }
        } else if let Some(guardian) = self.guardian.as_mut() {
            guardian.pause();
        }
    }

    fn shutdown(&mut self) {
        if let Some(guardian) = self.guardian.as_mut() {
            guardian.stop();
        }
        self.connector.close();
    }

    /// Deliver everything the connector produced, reacting to lifecycle
    /// events on the way.
    fn flush(&mut self) {
        loop {
            let events = self.connector.take_events();
            if events.is_empty() {
                return;
            }
            for event in events {
                self.dispatch(&event);
                match event {
                    SessionEvent::StateChanged {
                        state: ConnectionState::Ready,
                        ..
                    } => {
                        if let Some(guardian) = self.guardian.as_mut() {
                            guardian.on_connected();
                        }
                        if self.config.enable_auto_notify {
                            self.subscribe_all();
                        }
                    }
                    SessionEvent::Disconnected {
                        reason,
                        status,
                        connect_phase,
                    } => {
                        if let Some(guardian) = self.guardian.as_mut() {
                            guardian.on_disconnected(reason, status, connect_phase);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn subscribe_all(&mut self) {
        let targets: Vec<(Uuid, bool)> = self
            .connector
            .registry()
            .subscribable_all()
            .map(|c| (c.uuid, c.can_indicate))
            .collect();
        for (characteristic, indication) in targets {
            debug!(
                "device {}: auto-subscribing {}",
                self.config.address, characteristic
            );
            self.connector
                .set_notification(characteristic, true, indication, None);
        }
    }

    fn dispatch(&self, event: &SessionEvent) {
        let observers: Vec<Arc<dyn SessionObserver>> = self.observers.read().clone();
        for observer in observers {
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                observer.on_event(&self.config.address, event)
            }));
            if delivered.is_err() {
                error!("device {}: observer panicked", self.config.address);
            }
        }
    }

    fn publish(&self) {
        self.state.send_if_modified(|state| {
            let current = self.connector.state();
            let changed = *state != current;
            *state = current;
            changed
        });

        let mut snapshot = self.snapshot.write();
        snapshot.mtu = self.connector.mtu();
        snapshot.payload = self.connector.payload_size();
        if snapshot.registry != *self.connector.registry() {
            snapshot.registry = self.connector.registry().clone();
        }
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            address: self.config.address.clone(),
            state: self.connector.state(),
            mtu: self.connector.mtu(),
            payload_size: self.connector.payload_size(),
            pending_operations: self.connector.pending_operations(),
            in_flight: self.connector.in_flight(),
            guard: self.guardian.as_ref().map(ReconnectionGuardian::status),
            characteristics: self.connector.registry().len(),
            last_assist_rssi: self.connector.last_assist_rssi(),
        }
    }

    fn is_ready(&self) -> bool {
        self.connector.state() == ConnectionState::Ready
    }

    fn is_guarding(&self) -> bool {
        self.guardian
            .as_ref()
            .is_some_and(ReconnectionGuardian::is_guarding)
    }
}
