//! Connection state machine for one peer.
//!
//! Owns the link handle, the discovered characteristic table and the
//! operation queue. Host callbacks and timer expiries are fed in by the
//! device actor; outward notifications accumulate as [`SessionEvent`]s that
//! the actor drains after every input.

use super::queue::{OperationQueue, Settled};
use super::task::{Completion, OperationTask, TaskKind, WriteRequest};
use super::{resolve_target, Access, ConnectionState, DisconnectReason, SessionEvent};
use crate::config::{ConfigError, SessionConfig, DEFAULT_MTU, MAX_MTU};
use crate::gatt::descriptor::{select_chunked_write_mode, select_write_mode, CharacteristicDescriptor};
use crate::gatt::registry::CharacteristicRegistry;
use crate::host::{
    HostCapability, HostError, HostEvent, HostEventSink, LinkHandle, LinkPriority, GATT_SUCCESS,
};
use crate::scanner::{AssistScanner, ScannerHandle};
use crate::timer::{TimerFired, TimerKind, TimerPost, Timers};
use crate::BleError;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pause between link-up and service discovery.
pub const DISCOVERY_SETTLE: Duration = Duration::from_millis(50);

/// How long a requested disconnect waits for the link-down callback.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// ATT header bytes subtracted from the MTU to get the usable payload.
const ATT_HEADER: u16 = 3;

const MIN_PAYLOAD: usize = (DEFAULT_MTU - ATT_HEADER) as usize;

/// Outbound hooks the connector posts through. Each one lands back on the
/// owning actor's channel.
pub(crate) struct ConnectorPorts {
    pub events: HostEventSink,
    pub timers: TimerPost,
    pub mtu_settled: Arc<dyn Fn(bool) + Send + Sync>,
    pub sighting: Arc<dyn Fn(i16) + Send + Sync>,
    pub scanner: Option<ScannerHandle>,
}

pub(crate) struct Connector {
    config: SessionConfig,
    host: Arc<dyn HostCapability>,
    sink: HostEventSink,
    mtu_settled: Arc<dyn Fn(bool) + Send + Sync>,
    sighting: Arc<dyn Fn(i16) + Send + Sync>,
    scanner: Option<ScannerHandle>,
    state: ConnectionState,
    handle: Option<LinkHandle>,
    mtu: u16,
    payload: usize,
    user_disconnect: bool,
    /// Link-up was seen for the current handle
    linked: bool,
    /// Value of the read currently awaiting its final outcome
    read_value: Option<Vec<u8>>,
    registry: CharacteristicRegistry,
    queue: OperationQueue,
    timers: Timers,
    assist: Option<AssistScanner>,
    last_assist_rssi: Option<i16>,
    events: VecDeque<SessionEvent>,
}

impl Connector {
    pub fn new(config: SessionConfig, host: Arc<dyn HostCapability>, ports: ConnectorPorts) -> Self {
        let queue = OperationQueue::new(
            Arc::clone(&host),
            config.operation_timeout(),
            Timers::new(Arc::clone(&ports.timers)),
        );
        Self {
            config,
            host,
            sink: ports.events,
            mtu_settled: ports.mtu_settled,
            sighting: ports.sighting,
            scanner: ports.scanner,
            state: ConnectionState::Disconnected,
            handle: None,
            mtu: DEFAULT_MTU,
            payload: MIN_PAYLOAD,
            user_disconnect: false,
            linked: false,
            read_value: None,
            registry: CharacteristicRegistry::new(),
            queue,
            timers: Timers::new(ports.timers),
            assist: None,
            last_assist_rssi: None,
            events: VecDeque::new(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            warn!(
                "session {}: connect ignored in state {}",
                self.config.address, self.state
            );
            return;
        }
        if !self.host.is_radio_enabled() {
            warn!("session {}: radio unavailable", self.config.address);
            self.emit(SessionEvent::Error(BleError::CapabilityUnavailable));
            return;
        }

        self.user_disconnect = false;
        if let Some(stale) = self.handle.take() {
            self.host.close(stale);
        }
        self.set_state(ConnectionState::Connecting);
        self.timers
            .arm(TimerKind::ConnectTimeout, self.config.connection_timeout());

        match self.host.connect(&self.config.address, Arc::clone(&self.sink)) {
            Ok(handle) => {
                debug!("session {}: connecting on {}", self.config.address, handle);
                self.handle = Some(handle);
                self.start_assist();
            }
            Err(HostError::RadioUnavailable) => {
                self.timers.cancel(TimerKind::ConnectTimeout);
                self.set_state(ConnectionState::Disconnected);
                self.emit(SessionEvent::Error(BleError::CapabilityUnavailable));
            }
            Err(e) => {
                warn!("session {}: connect failed: {}", self.config.address, e);
                self.timers.cancel(TimerKind::ConnectTimeout);
                self.set_state(ConnectionState::Disconnected);
                self.emit(SessionEvent::Error(BleError::ConnectionFailed(e.to_string())));
                self.emit(SessionEvent::Disconnected {
                    reason: DisconnectReason::ConnectFailed,
                    status: -1,
                    connect_phase: true,
                });
            }
        }
    }

    /// Cancel all operations and ask the link to go down.
    pub fn disconnect(&mut self) {
        self.user_disconnect = true;
        self.timers.cancel(TimerKind::ConnectTimeout);
        self.timers.cancel(TimerKind::DiscoverySettle);
        self.stop_assist();
        self.queue.detach();

        match self.handle {
            Some(handle) if self.state != ConnectionState::Disconnected => {
                self.set_state(ConnectionState::Disconnecting);
                self.host.disconnect(handle);
                self.timers.arm(TimerKind::DisconnectGrace, DISCONNECT_GRACE);
            }
            _ => self.set_state(ConnectionState::Disconnected),
        }
    }

    /// Tear everything down at once. No host callback is awaited.
    pub fn close(&mut self) {
        self.user_disconnect = true;
        let was = self.state;
        self.timers.cancel_all();
        self.stop_assist();
        self.queue.detach();
        if let Some(handle) = self.handle.take() {
            self.host.disconnect(handle);
            self.host.close(handle);
        }
        self.reset_link_params();

        let connect_phase = !self.linked;
        self.linked = false;

        if was != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            self.emit(SessionEvent::Disconnected {
                reason: DisconnectReason::UserRequest,
                status: GATT_SUCCESS,
                connect_phase,
            });
        }
        info!("session {}: closed", self.config.address);
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    pub fn on_host_event(&mut self, event: HostEvent) {
        if self.handle != Some(event.handle()) {
            debug!(
                "session {}: dropping event for stale {}",
                self.config.address,
                event.handle()
            );
            return;
        }

        match event {
            HostEvent::LinkStateChanged {
                connected: true,
                status: GATT_SUCCESS,
                ..
            } => self.on_link_up(),
            HostEvent::LinkStateChanged { status, .. } => self.on_link_down(status),
            HostEvent::ServicesDiscovered {
                status,
                characteristics,
                ..
            } => self.on_services_discovered(status, characteristics),
            HostEvent::MtuChanged { mtu, status, .. } => self.on_mtu_changed(mtu, status),
            HostEvent::CharacteristicChanged {
                characteristic,
                value,
                ..
            } => self.emit(SessionEvent::Notification {
                characteristic,
                value,
            }),
            HostEvent::CharacteristicRead {
                characteristic,
                value,
                status,
                ..
            } => {
                if self.current_targets(characteristic, |kind| matches!(kind, TaskKind::Read { .. })) {
                    self.read_value = (status == GATT_SUCCESS).then_some(value);
                    self.queue.on_completion(status);
                }
            }
            HostEvent::CharacteristicWrite {
                characteristic,
                status,
                ..
            } => {
                let is_write = |kind: &TaskKind| {
                    matches!(kind, TaskKind::Write { .. } | TaskKind::ChunkedWrite { .. })
                };
                if self.current_targets(characteristic, is_write) {
                    self.queue.on_completion(status);
                }
            }
            HostEvent::DescriptorWrite {
                characteristic,
                status,
                ..
            } => self.on_descriptor_write(characteristic, status),
        }
        self.collect_queue_failures();
    }

    pub fn on_timer(&mut self, fired: TimerFired) {
        if fired.kind == TimerKind::OperationTimeout {
            self.queue.on_timer(fired);
            self.collect_queue_failures();
            return;
        }
        if !self.timers.accept(fired) {
            return;
        }

        match fired.kind {
            TimerKind::ConnectTimeout => self.on_connect_timeout(),
            TimerKind::DiscoverySettle => self.start_discovery(),
            TimerKind::DisconnectGrace if self.state == ConnectionState::Disconnecting => {
                debug!(
                    "session {}: no link-down after disconnect, forcing teardown",
                    self.config.address
                );
                self.on_link_down(GATT_SUCCESS);
            }
            TimerKind::AssistTimeout => self.stop_assist(),
            _ => {}
        }
    }

    /// Result of the MTU request issued right after discovery.
    pub fn on_mtu_settled(&mut self, ok: bool) {
        if self.state != ConnectionState::DiscoveringServices {
            return;
        }
        if !ok {
            warn!(
                "session {}: MTU negotiation failed, staying at {}",
                self.config.address, self.mtu
            );
        }
        self.set_state(ConnectionState::Ready);
    }

    pub fn on_assist_sighting(&mut self, rssi: i16) {
        debug!("session {}: assist sighting at {} dBm", self.config.address, rssi);
        self.last_assist_rssi = Some(rssi);
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    pub fn read(&mut self, characteristic: Uuid, completion: Option<Completion>) {
        match resolve_target(self.state, &self.registry, &characteristic, Access::Read) {
            Ok(target) => {
                let task = OperationTask::read(target.service, characteristic)
                    .with_boxed_completion(completion);
                self.queue.enqueue(task);
            }
            Err(e) => self.reject("read", e, completion),
        }
        self.collect_queue_failures();
    }

    pub fn write(&mut self, request: WriteRequest) {
        let WriteRequest {
            characteristic,
            data,
            preference,
            priority,
            completion,
            progress,
        } = request;

        let target = match resolve_target(self.state, &self.registry, &characteristic, Access::Write)
        {
            Ok(target) => target.clone(),
            Err(e) => return self.reject("write", e, completion),
        };

        let payload = self.payload_size();
        let task = if data.len() <= payload {
            select_write_mode(&target, preference)
                .map(|mode| OperationTask::write(target.service, characteristic, data, mode))
        } else {
            select_chunked_write_mode(&target, preference).map(|mode| {
                let mut task = OperationTask::chunked_write(
                    target.service,
                    characteristic,
                    &data,
                    payload,
                    mode,
                );
                task.set_progress(progress);
                task
            })
        };

        match task {
            Some(task) => {
                self.queue
                    .enqueue(task.with_priority(priority).with_boxed_completion(completion));
                self.collect_queue_failures();
            }
            None => self.reject(
                "write",
                BleError::Unsupported {
                    characteristic,
                    operation: "write",
                },
                completion,
            ),
        }
    }

    pub fn set_notification(
        &mut self,
        characteristic: Uuid,
        enable: bool,
        indication: bool,
        completion: Option<Completion>,
    ) {
        let access = if indication {
            Access::Indicate
        } else {
            Access::Notify
        };
        match resolve_target(self.state, &self.registry, &characteristic, access) {
            Ok(target) => {
                let task = OperationTask::enable_notification(
                    target.service,
                    characteristic,
                    enable,
                    indication,
                )
                .with_boxed_completion(completion);
                self.queue.enqueue(task);
            }
            Err(e) => self.reject("notification", e, completion),
        }
        self.collect_queue_failures();
    }

    pub fn request_mtu(&mut self, mtu: u16, completion: Option<Completion>) {
        if self.state != ConnectionState::Ready {
            return self.reject("mtu", BleError::NotReady(self.state), completion);
        }
        if !(DEFAULT_MTU..=MAX_MTU).contains(&mtu) {
            return self.reject(
                "mtu",
                BleError::Configuration(ConfigError::InvalidMtu(mtu)),
                completion,
            );
        }
        self.queue
            .enqueue(OperationTask::request_mtu(mtu).with_boxed_completion(completion));
        self.collect_queue_failures();
    }

    /// Clamp a requested payload size to what the current MTU allows.
    ///
    /// Anything above `mtu - 3` or below the 23-byte MTU floor falls back to
    /// the full `mtu - 3`.
    pub fn set_payload_size(&mut self, requested: usize) -> usize {
        let max = self.max_payload();
        self.payload = if requested > max || requested < MIN_PAYLOAD {
            max
        } else {
            requested
        };
        self.payload
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn payload_size(&self) -> usize {
        self.payload.min(self.max_payload())
    }

    pub fn registry(&self) -> &CharacteristicRegistry {
        &self.registry
    }

    pub fn pending_operations(&self) -> usize {
        self.queue.pending_len()
    }

    pub fn in_flight(&self) -> Option<&'static str> {
        self.queue.current_task().map(OperationTask::name)
    }

    pub fn last_assist_rssi(&self) -> Option<i16> {
        self.last_assist_rssi
    }

    pub fn is_assisting(&self) -> bool {
        self.assist.is_some()
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn on_link_up(&mut self) {
        if self.state != ConnectionState::Connecting {
            debug!(
                "session {}: link-up ignored in state {}",
                self.config.address, self.state
            );
            return;
        }
        self.timers.cancel(TimerKind::ConnectTimeout);
        self.stop_assist();
        self.linked = true;
        self.set_state(ConnectionState::Connected);

        if let Some(handle) = self.handle {
            self.host
                .request_connection_priority(handle, LinkPriority::High);
        }
        self.set_state(ConnectionState::DiscoveringServices);
        self.timers.arm(TimerKind::DiscoverySettle, DISCOVERY_SETTLE);
    }

    fn start_discovery(&mut self) {
        if self.state != ConnectionState::DiscoveringServices {
            return;
        }
        let Some(handle) = self.handle else {
            return;
        };
        debug!("session {}: discovering services", self.config.address);
        if let Err(e) = self.host.discover_services(handle) {
            warn!("session {}: discovery rejected: {}", self.config.address, e);
            self.fail_discovery(-1);
        }
    }

    fn on_services_discovered(&mut self, status: i32, characteristics: Vec<CharacteristicDescriptor>) {
        if self.state != ConnectionState::DiscoveringServices {
            debug!(
                "session {}: discovery result ignored in state {}",
                self.config.address, self.state
            );
            return;
        }
        if status != GATT_SUCCESS {
            self.fail_discovery(status);
            return;
        }
        let Some(handle) = self.handle else {
            return;
        };

        info!(
            "session {}: discovered {} characteristic(s)",
            self.config.address,
            characteristics.len()
        );
        self.registry.replace(characteristics.clone());
        self.queue.attach(handle);
        self.emit(SessionEvent::ServicesDiscovered(characteristics));

        if self.config.auto_negotiate_mtu && self.config.preferred_mtu > DEFAULT_MTU {
            let settled = Arc::clone(&self.mtu_settled);
            self.queue.enqueue(
                OperationTask::request_mtu(self.config.preferred_mtu)
                    .with_completion(move |ok| settled(ok)),
            );
        } else {
            self.set_state(ConnectionState::Ready);
        }
    }

    fn fail_discovery(&mut self, status: i32) {
        error!(
            "session {}: service discovery failed with status {}",
            self.config.address, status
        );
        self.emit(SessionEvent::Error(BleError::DiscoveryFailed(status)));
        if let Some(handle) = self.handle {
            self.set_state(ConnectionState::Disconnecting);
            self.host.disconnect(handle);
            self.timers.arm(TimerKind::DisconnectGrace, DISCONNECT_GRACE);
        }
    }

    fn on_mtu_changed(&mut self, mtu: u16, status: i32) {
        if status == GATT_SUCCESS {
            info!("session {}: MTU now {}", self.config.address, mtu);
            self.mtu = mtu;
            self.payload = self.max_payload();
            self.emit(SessionEvent::MtuChanged(mtu));
        }
        let mtu_in_flight = matches!(
            self.queue.current_task().map(OperationTask::kind),
            Some(TaskKind::RequestMtu { .. })
        );
        if mtu_in_flight {
            self.queue.on_completion(status);
        }
    }

    fn on_descriptor_write(&mut self, characteristic: Uuid, status: i32) {
        let is_subscription = |kind: &TaskKind| matches!(kind, TaskKind::EnableNotification { .. });
        if !self.current_targets(characteristic, is_subscription) {
            debug!(
                "session {}: unsolicited descriptor write on {}",
                self.config.address, characteristic
            );
            return;
        }
        self.queue.on_completion(status);
    }

    fn on_link_down(&mut self, status: i32) {
        // A disconnect requested mid-connect still ends the connect phase.
        let connect_phase = !self.linked;
        self.timers.cancel(TimerKind::ConnectTimeout);
        self.timers.cancel(TimerKind::DiscoverySettle);
        self.timers.cancel(TimerKind::DisconnectGrace);
        self.stop_assist();
        self.release_link();

        let reason = DisconnectReason::classify(self.user_disconnect, connect_phase, status);
        info!(
            "session {}: disconnected ({:?}, status {})",
            self.config.address, reason, status
        );
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::Disconnected {
            reason,
            status,
            connect_phase,
        });
    }

    fn on_connect_timeout(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        warn!(
            "session {}: connect timed out after {:?}",
            self.config.address,
            self.config.connection_timeout()
        );
        if let Some(handle) = self.handle {
            self.host.disconnect(handle);
        }
        self.stop_assist();
        self.release_link();
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::Error(BleError::ConnectionTimeout));
        self.emit(SessionEvent::Disconnected {
            reason: DisconnectReason::Timeout,
            status: -1,
            connect_phase: true,
        });
    }

    fn release_link(&mut self) {
        self.queue.detach();
        self.linked = false;
        self.read_value = None;
        if let Some(handle) = self.handle.take() {
            self.host.close(handle);
        }
        self.reset_link_params();
    }

    fn reset_link_params(&mut self) {
        self.mtu = DEFAULT_MTU;
        self.payload = MIN_PAYLOAD;
    }

    fn start_assist(&mut self) {
        if !self.config.enable_assist_scan || self.assist.is_some() {
            return;
        }
        let Some(scanner) = &self.scanner else {
            return;
        };
        let sighting = Arc::clone(&self.sighting);
        match AssistScanner::start(scanner, self.config.address.clone(), move |rssi| {
            sighting(rssi)
        }) {
            Ok(assist) => {
                self.assist = Some(assist);
                self.timers
                    .arm(TimerKind::AssistTimeout, self.config.connection_timeout());
            }
            Err(e) => warn!("session {}: assist scan unavailable: {}", self.config.address, e),
        }
    }

    fn stop_assist(&mut self) {
        self.timers.cancel(TimerKind::AssistTimeout);
        if let Some(assist) = self.assist.take() {
            assist.stop();
        }
    }

    fn current_targets(&self, characteristic: Uuid, kind: impl Fn(&TaskKind) -> bool) -> bool {
        self.queue.current_task().is_some_and(|task| {
            kind(task.kind()) && task.kind().characteristic() == Some(characteristic)
        })
    }

    fn max_payload(&self) -> usize {
        (self.mtu.saturating_sub(ATT_HEADER) as usize).max(MIN_PAYLOAD)
    }

    fn reject(&mut self, operation: &str, error: BleError, completion: Option<Completion>) {
        warn!(
            "session {}: {} rejected: {}",
            self.config.address, operation, error
        );
        self.emit(SessionEvent::Error(error));
        if let Some(completion) = completion {
            if catch_unwind(AssertUnwindSafe(|| completion(false))).is_err() {
                error!("session {}: completion callback panicked", self.config.address);
            }
        }
    }

    /// Turn final queue outcomes into events. Retried attempts and
    /// intermediate chunks never get here.
    fn collect_queue_failures(&mut self) {
        for outcome in self.queue.take_settled() {
            let event = match outcome {
                Settled::Read {
                    characteristic,
                    success,
                } => SessionEvent::ReadComplete {
                    characteristic,
                    value: if success { self.read_value.take() } else { None },
                    success,
                },
                Settled::Write {
                    characteristic,
                    success,
                } => SessionEvent::WriteComplete {
                    characteristic,
                    success,
                },
                Settled::Subscription {
                    characteristic,
                    enabled,
                    success,
                } => SessionEvent::NotificationEnabled {
                    characteristic,
                    enabled,
                    success,
                },
            };
            self.emit(event);
        }
        self.read_value = None;
        for failure in self.queue.take_failures() {
            self.emit(SessionEvent::Error(failure));
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(
            "session {}: {} -> {}",
            self.config.address, self.state, state
        );
        self.state = state;
        let peer = (state != ConnectionState::Disconnected).then(|| self.config.address.clone());
        self.emit(SessionEvent::StateChanged { state, peer });
    }

    fn emit(&mut self, event: SessionEvent) {
        self.events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::descriptor::{properties, uuid_from_u16};
    use crate::host::{MockHostCapability, WriteMode};
    use crate::timer::TimerFired;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const HANDLE: LinkHandle = LinkHandle::new(1);

    fn battery() -> CharacteristicDescriptor {
        CharacteristicDescriptor::from_properties(
            uuid_from_u16(0x180f),
            uuid_from_u16(0x2a19),
            properties::READ | properties::NOTIFY,
        )
    }

    fn command() -> CharacteristicDescriptor {
        CharacteristicDescriptor::from_properties(
            uuid_from_u16(0xfda0),
            uuid_from_u16(0xfda2),
            properties::WRITE | properties::WRITE_NO_RESPONSE,
        )
    }

    struct Harness {
        connector: Connector,
        timers: mpsc::UnboundedReceiver<TimerFired>,
        settled: Arc<Mutex<Vec<bool>>>,
    }

    impl Harness {
        async fn next_timer(&mut self) -> TimerFired {
            self.timers.recv().await.expect("timer")
        }

        /// Drive expiries until `kind` fires, feeding each to the connector.
        async fn fire(&mut self, kind: TimerKind) {
            loop {
                let fired = self.next_timer().await;
                let matched = fired.kind == kind;
                self.connector.on_timer(fired);
                if matched {
                    return;
                }
            }
        }

        fn states(&mut self) -> Vec<ConnectionState> {
            self.connector
                .take_events()
                .into_iter()
                .filter_map(|e| match e {
                    SessionEvent::StateChanged { state, .. } => Some(state),
                    _ => None,
                })
                .collect()
        }
    }

    fn permissive_host() -> MockHostCapability {
        let mut host = MockHostCapability::new();
        host.expect_is_radio_enabled().return_const(true);
        host.expect_connect().returning(|_, _| Ok(HANDLE));
        host.expect_disconnect().return_const(());
        host.expect_close().return_const(());
        host.expect_request_connection_priority().return_const(());
        host.expect_discover_services().returning(|_| Ok(()));
        host.expect_read_characteristic().returning(|_, _, _| Ok(()));
        host.expect_write_characteristic()
            .returning(|_, _, _, _, _| Ok(()));
        host.expect_set_notification()
            .returning(|_, _, _, _, _| Ok(()));
        host.expect_request_mtu().returning(|_, _| Ok(()));
        host
    }

    fn harness(host: MockHostCapability, auto_mtu: bool) -> Harness {
        let config = SessionConfig::builder("AA:BB:CC:DD:EE:01")
            .auto_negotiate_mtu(auto_mtu)
            .assist_scan(false)
            .build()
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let settled = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&settled);
        let ports = ConnectorPorts {
            events: Arc::new(|_| {}),
            timers: Arc::new(move |fired| {
                let _ = tx.send(fired);
            }),
            mtu_settled: Arc::new(move |ok| s.lock().unwrap().push(ok)),
            sighting: Arc::new(|_| {}),
            scanner: None,
        };
        Harness {
            connector: Connector::new(config, Arc::new(host), ports),
            timers: rx,
            settled,
        }
    }

    async fn ready(h: &mut Harness) {
        h.connector.connect();
        h.connector.on_host_event(HostEvent::LinkStateChanged {
            handle: HANDLE,
            status: GATT_SUCCESS,
            connected: true,
        });
        h.fire(TimerKind::DiscoverySettle).await;
        h.connector.on_host_event(HostEvent::ServicesDiscovered {
            handle: HANDLE,
            status: GATT_SUCCESS,
            characteristics: vec![battery(), command()],
        });
        assert_eq!(h.connector.state(), ConnectionState::Ready);
        h.connector.take_events();
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_reaches_ready() {
        let mut h = harness(permissive_host(), false);
        h.connector.connect();
        h.connector.on_host_event(HostEvent::LinkStateChanged {
            handle: HANDLE,
            status: GATT_SUCCESS,
            connected: true,
        });
        h.fire(TimerKind::DiscoverySettle).await;
        h.connector.on_host_event(HostEvent::ServicesDiscovered {
            handle: HANDLE,
            status: GATT_SUCCESS,
            characteristics: vec![battery()],
        });

        assert_eq!(
            h.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::DiscoveringServices,
                ConnectionState::Ready,
            ]
        );
        assert_eq!(h.connector.registry().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_outside_disconnected_is_noop() {
        let mut host = MockHostCapability::new();
        host.expect_is_radio_enabled().return_const(true);
        host.expect_connect().times(1).returning(|_, _| Ok(HANDLE));
        let mut h = harness(host, false);

        h.connector.connect();
        h.connector.connect();
        assert_eq!(h.states(), vec![ConnectionState::Connecting]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_off_reports_capability_error() {
        let mut host = MockHostCapability::new();
        host.expect_is_radio_enabled().return_const(false);
        host.expect_connect().times(0);
        let mut h = harness(host, false);

        h.connector.connect();
        assert_eq!(
            h.connector.take_events(),
            vec![SessionEvent::Error(BleError::CapabilityUnavailable)]
        );
        assert_eq!(h.connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_negotiation_gates_ready() {
        let mut h = harness(permissive_host(), true);
        h.connector.connect();
        h.connector.on_host_event(HostEvent::LinkStateChanged {
            handle: HANDLE,
            status: GATT_SUCCESS,
            connected: true,
        });
        h.fire(TimerKind::DiscoverySettle).await;
        h.connector.on_host_event(HostEvent::ServicesDiscovered {
            handle: HANDLE,
            status: GATT_SUCCESS,
            characteristics: vec![command()],
        });
        assert_eq!(h.connector.state(), ConnectionState::DiscoveringServices);
        assert_eq!(h.connector.in_flight(), Some("RequestMtu"));

        h.connector.on_host_event(HostEvent::MtuChanged {
            handle: HANDLE,
            mtu: 247,
            status: GATT_SUCCESS,
        });
        assert_eq!(*h.settled.lock().unwrap(), vec![true]);
        h.connector.on_mtu_settled(true);

        assert_eq!(h.connector.state(), ConnectionState::Ready);
        assert_eq!(h.connector.mtu(), 247);
        assert_eq!(h.connector.payload_size(), 244);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_synthesizes_disconnect() {
        let mut h = harness(permissive_host(), false);
        h.connector.connect();
        h.connector.take_events();
        h.fire(TimerKind::ConnectTimeout).await;

        assert_eq!(
            h.connector.take_events(),
            vec![
                SessionEvent::StateChanged {
                    state: ConnectionState::Disconnected,
                    peer: None
                },
                SessionEvent::Error(BleError::ConnectionTimeout),
                SessionEvent::Disconnected {
                    reason: DisconnectReason::Timeout,
                    status: -1,
                    connect_phase: true
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_classification() {
        let mut h = harness(permissive_host(), false);
        h.connector.connect();
        h.connector.on_host_event(HostEvent::LinkStateChanged {
            handle: HANDLE,
            status: 133,
            connected: false,
        });
        let events = h.connector.take_events();
        assert_eq!(
            events.last(),
            Some(&SessionEvent::Disconnected {
                reason: DisconnectReason::ConnectFailed,
                status: 133,
                connect_phase: true
            })
        );

        ready(&mut h).await;
        h.connector.on_host_event(HostEvent::LinkStateChanged {
            handle: HANDLE,
            status: 8,
            connected: false,
        });
        assert_eq!(
            h.connector.take_events().last(),
            Some(&SessionEvent::Disconnected {
                reason: DisconnectReason::LinkError,
                status: 8,
                connect_phase: false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_rejected_until_ready() {
        let mut h = harness(permissive_host(), false);
        let outcome = Arc::new(Mutex::new(None));
        let o = Arc::clone(&outcome);
        h.connector.read(
            battery().uuid,
            Some(Box::new(move |ok| *o.lock().unwrap() = Some(ok))),
        );
        assert_eq!(*outcome.lock().unwrap(), Some(false));
        assert_eq!(
            h.connector.take_events(),
            vec![SessionEvent::Error(BleError::NotReady(
                ConnectionState::Disconnected
            ))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_completes_through_queue() {
        let mut h = harness(permissive_host(), false);
        ready(&mut h).await;
        let outcome = Arc::new(Mutex::new(None));
        let o = Arc::clone(&outcome);
        h.connector.read(
            battery().uuid,
            Some(Box::new(move |ok| *o.lock().unwrap() = Some(ok))),
        );
        assert_eq!(h.connector.in_flight(), Some("Read"));

        h.connector.on_host_event(HostEvent::CharacteristicRead {
            handle: HANDLE,
            characteristic: battery().uuid,
            value: vec![91],
            status: GATT_SUCCESS,
        });
        assert_eq!(*outcome.lock().unwrap(), Some(true));
        assert_eq!(
            h.connector.take_events(),
            vec![SessionEvent::ReadComplete {
                characteristic: battery().uuid,
                value: Some(vec![91]),
                success: true
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_read_reports_only_final_outcome() {
        let mut h = harness(permissive_host(), false);
        ready(&mut h).await;
        h.connector.read(battery().uuid, None);

        for _ in 0..2 {
            h.connector.on_host_event(HostEvent::CharacteristicRead {
                handle: HANDLE,
                characteristic: battery().uuid,
                value: vec![],
                status: 133,
            });
            assert!(h.connector.take_events().is_empty());
        }
        h.connector.on_host_event(HostEvent::CharacteristicRead {
            handle: HANDLE,
            characteristic: battery().uuid,
            value: vec![64],
            status: GATT_SUCCESS,
        });
        assert_eq!(
            h.connector.take_events(),
            vec![SessionEvent::ReadComplete {
                characteristic: battery().uuid,
                value: Some(vec![64]),
                success: true
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_read_reports_failure_once() {
        let mut h = harness(permissive_host(), false);
        ready(&mut h).await;
        h.connector.read(battery().uuid, None);

        let mut events = Vec::new();
        for _ in 0..4 {
            h.connector.on_host_event(HostEvent::CharacteristicRead {
                handle: HANDLE,
                characteristic: battery().uuid,
                value: vec![],
                status: 133,
            });
            events.extend(h.connector.take_events());
        }
        assert_eq!(
            events,
            vec![
                SessionEvent::ReadComplete {
                    characteristic: battery().uuid,
                    value: None,
                    success: false
                },
                SessionEvent::Error(BleError::OperationFailed(133)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_read_result_is_ignored() {
        let mut h = harness(permissive_host(), false);
        ready(&mut h).await;
        h.connector.on_host_event(HostEvent::CharacteristicRead {
            handle: HANDLE,
            characteristic: battery().uuid,
            value: vec![1],
            status: GATT_SUCCESS,
        });
        assert!(h.connector.take_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_write_is_chunked_with_response() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let mut host = MockHostCapability::new();
        host.expect_is_radio_enabled().return_const(true);
        host.expect_connect().returning(|_, _| Ok(HANDLE));
        host.expect_request_connection_priority().return_const(());
        host.expect_discover_services().returning(|_| Ok(()));
        let w = Arc::clone(&writes);
        host.expect_write_characteristic()
            .returning(move |_, _, _, data, mode| {
                w.lock().unwrap().push((data.len(), mode));
                Ok(())
            });
        let mut h = harness(host, false);
        ready(&mut h).await;

        h.connector
            .write(WriteRequest::new(command().uuid, vec![0u8; 50]));
        for _ in 0..3 {
            h.connector.on_host_event(HostEvent::CharacteristicWrite {
                handle: HANDLE,
                characteristic: command().uuid,
                status: GATT_SUCCESS,
            });
        }
        assert_eq!(
            *writes.lock().unwrap(),
            vec![
                (20, WriteMode::WithResponse),
                (20, WriteMode::WithResponse),
                (10, WriteMode::WithResponse)
            ]
        );
        assert_eq!(
            h.connector.take_events(),
            vec![SessionEvent::WriteComplete {
                characteristic: command().uuid,
                success: true
            }]
        );

        h.connector.write(WriteRequest::new(command().uuid, vec![1u8; 4]));
        assert_eq!(
            writes.lock().unwrap().last(),
            Some(&(4, WriteMode::WithoutResponse))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_size_clamping() {
        let mut h = harness(permissive_host(), false);
        assert_eq!(h.connector.set_payload_size(100), 20);
        assert_eq!(h.connector.set_payload_size(5), 20);

        ready(&mut h).await;
        h.connector.on_host_event(HostEvent::MtuChanged {
            handle: HANDLE,
            mtu: 185,
            status: GATT_SUCCESS,
        });
        assert_eq!(h.connector.payload_size(), 182);
        assert_eq!(h.connector.set_payload_size(100), 100);
        assert_eq!(h.connector.set_payload_size(500), 182);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_queue_and_waits_for_link_down() {
        let mut h = harness(permissive_host(), false);
        ready(&mut h).await;
        let outcome = Arc::new(Mutex::new(None));
        let o = Arc::clone(&outcome);
        h.connector.read(
            battery().uuid,
            Some(Box::new(move |ok| *o.lock().unwrap() = Some(ok))),
        );

        h.connector.disconnect();
        assert_eq!(*outcome.lock().unwrap(), Some(false));
        assert_eq!(h.connector.state(), ConnectionState::Disconnecting);

        h.connector.on_host_event(HostEvent::LinkStateChanged {
            handle: HANDLE,
            status: GATT_SUCCESS,
            connected: false,
        });
        assert_eq!(h.connector.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.connector.take_events().last(),
            Some(&SessionEvent::Disconnected {
                reason: DisconnectReason::UserRequest,
                status: GATT_SUCCESS,
                connect_phase: false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connecting_stays_in_connect_phase() {
        let mut h = harness(permissive_host(), false);
        h.connector.connect();
        h.connector.disconnect();
        assert_eq!(h.connector.state(), ConnectionState::Disconnecting);

        h.connector.on_host_event(HostEvent::LinkStateChanged {
            handle: HANDLE,
            status: GATT_SUCCESS,
            connected: false,
        });
        assert_eq!(
            h.connector.take_events().last(),
            Some(&SessionEvent::Disconnected {
                reason: DisconnectReason::UserRequest,
                status: GATT_SUCCESS,
                connect_phase: true
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_teardown_while_connecting_stays_in_connect_phase() {
        let mut h = harness(permissive_host(), false);
        h.connector.connect();
        h.connector.disconnect();
        h.fire(TimerKind::DisconnectGrace).await;
        assert_eq!(
            h.connector.take_events().last(),
            Some(&SessionEvent::Disconnected {
                reason: DisconnectReason::UserRequest,
                status: GATT_SUCCESS,
                connect_phase: true
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_grace_forces_teardown() {
        let mut h = harness(permissive_host(), false);
        ready(&mut h).await;
        h.connector.disconnect();
        h.fire(TimerKind::DisconnectGrace).await;
        assert_eq!(h.connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_tears_link_down() {
        let mut h = harness(permissive_host(), false);
        h.connector.connect();
        h.connector.on_host_event(HostEvent::LinkStateChanged {
            handle: HANDLE,
            status: GATT_SUCCESS,
            connected: true,
        });
        h.fire(TimerKind::DiscoverySettle).await;
        h.connector.take_events();
        h.connector.on_host_event(HostEvent::ServicesDiscovered {
            handle: HANDLE,
            status: 129,
            characteristics: vec![],
        });

        let events = h.connector.take_events();
        assert!(events.contains(&SessionEvent::Error(BleError::DiscoveryFailed(129))));
        assert_eq!(h.connector.state(), ConnectionState::Disconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_for_stale_handle_are_dropped() {
        let mut h = harness(permissive_host(), false);
        ready(&mut h).await;
        h.connector.on_host_event(HostEvent::CharacteristicChanged {
            handle: LinkHandle::new(99),
            characteristic: battery().uuid,
            value: vec![1],
        });
        assert!(h.connector.take_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_user_disconnect() {
        let mut h = harness(permissive_host(), false);
        ready(&mut h).await;
        h.connector.close();
        assert_eq!(h.connector.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.connector.take_events().last(),
            Some(&SessionEvent::Disconnected {
                reason: DisconnectReason::UserRequest,
                status: GATT_SUCCESS,
                connect_phase: false
            })
        );

        h.connector.close();
        assert!(h.connector.take_events().is_empty());
    }
}
