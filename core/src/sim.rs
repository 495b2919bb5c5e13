// In-process radio simulation
//
// A scriptable `HostCapability` and `ScanBackend` that answer requests
// without hardware. Used by the integration tests and by the CLI's
// `simulate` command.

use crate::config::DeviceAddress;
use crate::gatt::descriptor::{properties, uuid_from_u16, CharacteristicDescriptor};
use crate::gatt::registry::{
    BATTERY_LEVEL, FIRMWARE_REVISION, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE,
    MANUFACTURER_NAME, MODEL_NUMBER,
};
use crate::host::{
    HostCapability, HostError, HostEvent, HostEventSink, LinkHandle, LinkPriority, WriteMode,
    GATT_SUCCESS,
};
use crate::scanner::{ScanBackend, ScannerError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

// ============================================================================
// CALL LOG
// ============================================================================

/// One request as seen by the simulated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Connect(DeviceAddress),
    Disconnect(LinkHandle),
    Close(LinkHandle),
    ConnectionPriority(LinkPriority),
    DiscoverServices,
    Read(Uuid),
    Write {
        characteristic: Uuid,
        data: Vec<u8>,
        mode: WriteMode,
    },
    SetNotification {
        characteristic: Uuid,
        enable: bool,
        indication: bool,
    },
    RequestMtu(u16),
}

// ============================================================================
// SIMULATED HOST
// ============================================================================

struct SimState {
    radio: bool,
    characteristics: Vec<CharacteristicDescriptor>,
    max_mtu: u16,
    next_handle: u64,
    link: Option<(LinkHandle, HostEventSink)>,
    connect_count: usize,
    /// `None` leaves connect attempts hanging
    connect_status: Option<i32>,
    discovery_status: i32,
    respond: bool,
    fail_next: usize,
    fail_status: i32,
    missing: HashSet<Uuid>,
    values: HashMap<Uuid, Vec<u8>>,
    calls: Vec<SimCall>,
}

/// Scriptable peripheral behind a [`HostCapability`].
///
/// By default every request is answered at once with success: connect brings
/// the link up, discovery returns the configured table, MTU requests are
/// granted up to `max_mtu`, reads return the stored value.
pub struct SimulatedHost {
    state: Mutex<SimState>,
}

impl SimulatedHost {
    pub fn new(characteristics: Vec<CharacteristicDescriptor>) -> Self {
        Self {
            state: Mutex::new(SimState {
                radio: true,
                characteristics,
                max_mtu: crate::config::MAX_MTU,
                next_handle: 1,
                link: None,
                connect_count: 0,
                connect_status: Some(GATT_SUCCESS),
                discovery_status: GATT_SUCCESS,
                respond: true,
                fail_next: 0,
                fail_status: 133,
                missing: HashSet::new(),
                values: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// A heart-rate strap with battery and device-information characteristics.
    pub fn heart_rate_sensor() -> Self {
        let device_info = uuid_from_u16(0x180a);
        let battery_service = uuid_from_u16(0x180f);
        let host = Self::new(vec![
            CharacteristicDescriptor::from_properties(
                HEART_RATE_SERVICE,
                HEART_RATE_MEASUREMENT,
                properties::NOTIFY,
            ),
            CharacteristicDescriptor::from_properties(
                battery_service,
                BATTERY_LEVEL,
                properties::READ | properties::NOTIFY,
            ),
            CharacteristicDescriptor::from_properties(
                device_info,
                MANUFACTURER_NAME,
                properties::READ,
            ),
            CharacteristicDescriptor::from_properties(device_info, MODEL_NUMBER, properties::READ),
            CharacteristicDescriptor::from_properties(
                device_info,
                FIRMWARE_REVISION,
                properties::READ,
            ),
        ]);
        host.set_value(BATTERY_LEVEL, vec![87]);
        host.set_value(MANUFACTURER_NAME, b"blelink".to_vec());
        host.set_value(MODEL_NUMBER, b"HRM-1".to_vec());
        host.set_value(FIRMWARE_REVISION, b"1.4.2".to_vec());
        host
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    pub fn set_radio_enabled(&self, enabled: bool) {
        self.state.lock().radio = enabled;
    }

    pub fn set_max_mtu(&self, mtu: u16) {
        self.state.lock().max_mtu = mtu;
    }

    /// Status reported for subsequent connects; `None` never answers.
    pub fn set_connect_status(&self, status: Option<i32>) {
        self.state.lock().connect_status = status;
    }

    pub fn set_discovery_status(&self, status: i32) {
        self.state.lock().discovery_status = status;
    }

    /// When off, operations are accepted but never completed.
    pub fn set_respond(&self, respond: bool) {
        self.state.lock().respond = respond;
    }

    /// Complete the next `count` operations with `status`.
    pub fn fail_next(&self, count: usize, status: i32) {
        let mut state = self.state.lock();
        state.fail_next = count;
        state.fail_status = status;
    }

    /// Reject requests for `characteristic` as unknown.
    pub fn set_missing(&self, characteristic: Uuid) {
        self.state.lock().missing.insert(characteristic);
    }

    pub fn set_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.state.lock().values.insert(characteristic, value);
    }

    /// Push a notification on the current link.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        self.emit_on_link(|handle| HostEvent::CharacteristicChanged {
            handle,
            characteristic,
            value,
        })
    }

    /// Drop the current link as if the peer went away.
    pub fn drop_link(&self, status: i32) -> bool {
        self.emit_on_link(|handle| HostEvent::LinkStateChanged {
            handle,
            status,
            connected: false,
        })
    }

    /// Deliver an arbitrary event through the current link's sink.
    pub fn emit(&self, event: HostEvent) -> bool {
        let sink = self.state.lock().link.as_ref().map(|(_, sink)| sink.clone());
        match sink {
            Some(sink) => {
                sink(event);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    pub fn current_handle(&self) -> Option<LinkHandle> {
        self.state.lock().link.as_ref().map(|(handle, _)| *handle)
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    /// Every payload written, in order, with its write mode.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>, WriteMode)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SimCall::Write {
                    characteristic,
                    data,
                    mode,
                } => Some((*characteristic, data.clone(), *mode)),
                _ => None,
            })
            .collect()
    }

    pub fn count_calls(&self, matches: impl Fn(&SimCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| matches(c)).count()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn emit_on_link(&self, event: impl FnOnce(LinkHandle) -> HostEvent) -> bool {
        let link = self
            .state
            .lock()
            .link
            .as_ref()
            .map(|(handle, sink)| (*handle, sink.clone()));
        match link {
            Some((handle, sink)) => {
                sink(event(handle));
                true
            }
            None => false,
        }
    }

    /// Record `call`, validate the link and pick the completion status.
    /// `Ok(None)` means the request is accepted but will never complete.
    fn accept(
        &self,
        handle: LinkHandle,
        call: SimCall,
        target: Option<Uuid>,
    ) -> Result<Option<(HostEventSink, i32)>, HostError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        let sink = match &state.link {
            Some((current, sink)) if *current == handle => sink.clone(),
            _ => return Err(HostError::InvalidHandle(handle)),
        };
        if let Some(uuid) = target.filter(|uuid| state.missing.contains(uuid)) {
            return Err(HostError::NotFound(uuid));
        }
        if !state.respond {
            return Ok(None);
        }
        let status = if state.fail_next > 0 {
            state.fail_next -= 1;
            state.fail_status
        } else {
            GATT_SUCCESS
        };
        Ok(Some((sink, status)))
    }
}

impl HostCapability for SimulatedHost {
    fn is_radio_enabled(&self) -> bool {
        self.state.lock().radio
    }

    fn connect(
        &self,
        address: &DeviceAddress,
        events: HostEventSink,
    ) -> Result<LinkHandle, HostError> {
        let (handle, status) = {
            let mut state = self.state.lock();
            state.calls.push(SimCall::Connect(address.clone()));
            if !state.radio {
                return Err(HostError::RadioUnavailable);
            }
            let handle = LinkHandle::new(state.next_handle);
            state.next_handle += 1;
            state.connect_count += 1;
            state.link = Some((handle, events.clone()));
            (handle, state.connect_status)
        };

        if let Some(status) = status {
            events(HostEvent::LinkStateChanged {
                handle,
                status,
                connected: status == GATT_SUCCESS,
            });
        }
        Ok(handle)
    }

    fn disconnect(&self, handle: LinkHandle) {
        let sink = {
            let mut state = self.state.lock();
            state.calls.push(SimCall::Disconnect(handle));
            match &state.link {
                Some((current, sink)) if *current == handle && state.respond => Some(sink.clone()),
                _ => None,
            }
        };
        if let Some(sink) = sink {
            sink(HostEvent::LinkStateChanged {
                handle,
                status: GATT_SUCCESS,
                connected: false,
            });
        }
    }

    fn close(&self, handle: LinkHandle) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::Close(handle));
        if state.link.as_ref().is_some_and(|(current, _)| *current == handle) {
            state.link = None;
        }
    }

    fn request_connection_priority(&self, _handle: LinkHandle, priority: LinkPriority) {
        self.state
            .lock()
            .calls
            .push(SimCall::ConnectionPriority(priority));
    }

    fn discover_services(&self, handle: LinkHandle) -> Result<(), HostError> {
        let Some((sink, _)) = self.accept(handle, SimCall::DiscoverServices, None)? else {
            return Ok(());
        };
        let (status, characteristics) = {
            let state = self.state.lock();
            (state.discovery_status, state.characteristics.clone())
        };
        sink(HostEvent::ServicesDiscovered {
            handle,
            status,
            characteristics,
        });
        Ok(())
    }

    fn read_characteristic(
        &self,
        handle: LinkHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), HostError> {
        let Some((sink, status)) =
            self.accept(handle, SimCall::Read(characteristic), Some(characteristic))?
        else {
            return Ok(());
        };
        let value = self
            .state
            .lock()
            .values
            .get(&characteristic)
            .cloned()
            .unwrap_or_default();
        sink(HostEvent::CharacteristicRead {
            handle,
            characteristic,
            value,
            status,
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        handle: LinkHandle,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), HostError> {
        let call = SimCall::Write {
            characteristic,
            data: data.to_vec(),
            mode,
        };
        let Some((sink, status)) = self.accept(handle, call, Some(characteristic))? else {
            return Ok(());
        };
        if status == GATT_SUCCESS {
            self.state.lock().values.insert(characteristic, data.to_vec());
        }
        sink(HostEvent::CharacteristicWrite {
            handle,
            characteristic,
            status,
        });
        Ok(())
    }

    fn set_notification(
        &self,
        handle: LinkHandle,
        _service: Uuid,
        characteristic: Uuid,
        enable: bool,
        indication: bool,
    ) -> Result<(), HostError> {
        let call = SimCall::SetNotification {
            characteristic,
            enable,
            indication,
        };
        let Some((sink, status)) = self.accept(handle, call, Some(characteristic))? else {
            return Ok(());
        };
        sink(HostEvent::DescriptorWrite {
            handle,
            characteristic,
            status,
        });
        Ok(())
    }

    fn request_mtu(&self, handle: LinkHandle, mtu: u16) -> Result<(), HostError> {
        let Some((sink, status)) = self.accept(handle, SimCall::RequestMtu(mtu), None)? else {
            return Ok(());
        };
        let granted = mtu.min(self.state.lock().max_mtu);
        sink(HostEvent::MtuChanged {
            handle,
            mtu: granted,
            status,
        });
        Ok(())
    }
}

// ============================================================================
// SIMULATED SCAN BACKEND
// ============================================================================

/// Counts start/stop requests; availability can be toggled.
#[derive(Default)]
pub struct SimulatedScanBackend {
    unavailable: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl SimulatedScanBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ScanBackend for SimulatedScanBackend {
    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<(), ScannerError> {
        if !self.is_available() {
            return Err(ScannerError::Unavailable);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn capture() -> (HostEventSink, Arc<Mutex<Vec<HostEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: HostEventSink = Arc::new(move |event| sink_events.lock().push(event));
        (sink, events)
    }

    fn address() -> DeviceAddress {
        DeviceAddress::parse("AA:BB:CC:DD:EE:FF").unwrap()
    }

    #[test]
    fn test_connect_answers_link_up() {
        let host = SimulatedHost::heart_rate_sensor();
        let (sink, events) = capture();
        let handle = host.connect(&address(), sink).unwrap();

        assert_eq!(
            events.lock().as_slice(),
            &[HostEvent::LinkStateChanged {
                handle,
                status: GATT_SUCCESS,
                connected: true
            }]
        );
        assert_eq!(host.connect_count(), 1);
        assert_eq!(host.current_handle(), Some(handle));
    }

    #[test]
    fn test_radio_off_rejects_connect() {
        let host = SimulatedHost::new(vec![]);
        host.set_radio_enabled(false);
        let (sink, _) = capture();
        assert_eq!(
            host.connect(&address(), sink),
            Err(HostError::RadioUnavailable)
        );
    }

    #[test]
    fn test_scripted_failures_and_missing() {
        let host = SimulatedHost::heart_rate_sensor();
        let (sink, events) = capture();
        let handle = host.connect(&address(), sink).unwrap();
        events.lock().clear();

        host.fail_next(1, 8);
        host.read_characteristic(handle, Uuid::nil(), BATTERY_LEVEL)
            .unwrap();
        host.read_characteristic(handle, Uuid::nil(), BATTERY_LEVEL)
            .unwrap();
        let statuses: Vec<i32> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HostEvent::CharacteristicRead { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![8, GATT_SUCCESS]);

        host.set_missing(MODEL_NUMBER);
        assert_eq!(
            host.read_characteristic(handle, Uuid::nil(), MODEL_NUMBER),
            Err(HostError::NotFound(MODEL_NUMBER))
        );
    }

    #[test]
    fn test_closed_link_rejects_requests() {
        let host = SimulatedHost::new(vec![]);
        let (sink, _) = capture();
        let handle = host.connect(&address(), sink).unwrap();
        host.close(handle);
        assert_eq!(
            host.request_mtu(handle, 247),
            Err(HostError::InvalidHandle(handle))
        );
        assert!(!host.drop_link(0));
    }

    #[test]
    fn test_mtu_capped_by_peer() {
        let host = SimulatedHost::new(vec![]);
        host.set_max_mtu(185);
        let (sink, events) = capture();
        let handle = host.connect(&address(), sink).unwrap();
        host.request_mtu(handle, 517).unwrap();
        assert!(events.lock().contains(&HostEvent::MtuChanged {
            handle,
            mtu: 185,
            status: GATT_SUCCESS
        }));
    }

    #[test]
    fn test_scan_backend_counters() {
        let backend = SimulatedScanBackend::new();
        backend.start().unwrap();
        backend.stop();
        backend.set_available(false);
        assert_eq!(backend.start(), Err(ScannerError::Unavailable));
        assert_eq!((backend.starts(), backend.stops()), (1, 1));
    }
}
