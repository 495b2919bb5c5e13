// System Bluetooth adapter backend
//
// Implements the core's host capability and scan backend on top of
// btleplug. Requests are spawned onto the runtime and answered through the
// link's event sink; adapter events feed link-loss reports and scan results.

use anyhow::{Context, Result};
use blelink_core::config::DEFAULT_MTU;
use blelink_core::gatt::descriptor::BASE_UUID;
use blelink_core::{
    CharacteristicDescriptor, DeviceAddress, HostCapability, HostError, HostEvent, HostEventSink,
    LinkHandle, LinkPriority, ScanBackend, ScannerError, ScannerHandle, WriteMode, GATT_SUCCESS,
};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Generic failure status reported for btleplug errors.
const GATT_ERROR: i32 = 0x85;
/// Status reported when the adapter announces an unrequested disconnect.
const LINK_LOST: i32 = 0x08;
const REQUEST_NOT_SUPPORTED: i32 = 0x06;

// ============================================================================
// STACK
// ============================================================================

/// The first system adapter, wrapped as host capability plus scan backend.
pub struct BtleStack {
    _manager: Manager,
    pub host: Arc<BtleHost>,
    pub scan: Arc<BtleScanBackend>,
}

impl BtleStack {
    pub async fn open() -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to open the Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .next()
            .context("No Bluetooth adapter found")?;
        match adapter.adapter_info().await {
            Ok(info) => info!("btle: using adapter {}", info),
            Err(e) => debug!("btle: adapter info unavailable: {}", e),
        }

        let runtime = Handle::current();
        let links: LinkTable = Arc::new(Mutex::new(HashMap::new()));
        let host = Arc::new(BtleHost {
            runtime: runtime.clone(),
            adapter: adapter.clone(),
            links: Arc::clone(&links),
            next_handle: AtomicU64::new(1),
        });
        let scan = Arc::new(BtleScanBackend {
            runtime,
            adapter: adapter.clone(),
            scanning: AtomicBool::new(false),
            scanner: Mutex::new(None),
        });

        let events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        tokio::spawn(pump_adapter_events(events, adapter, links, Arc::clone(&scan)));

        Ok(Self {
            _manager: manager,
            host,
            scan,
        })
    }
}

async fn pump_adapter_events(
    mut events: BoxStream<'static, CentralEvent>,
    adapter: Adapter,
    links: LinkTable,
    scan: Arc<BtleScanBackend>,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                scan.on_seen(&adapter, &id).await;
            }
            CentralEvent::DeviceDisconnected(id) => report_link_loss(&links, &id),
            _ => {}
        }
    }
    debug!("btle: adapter event stream ended");
}

fn report_link_loss(links: &LinkTable, id: &PeripheralId) {
    let lost: Vec<(LinkHandle, HostEventSink)> = links
        .lock()
        .iter()
        .filter(|(_, link)| !link.disconnecting)
        .filter(|(_, link)| link.peripheral.as_ref().is_some_and(|p| p.id() == *id))
        .map(|(handle, link)| (*handle, link.sink.clone()))
        .collect();
    for (handle, sink) in lost {
        info!("btle: link {} lost", handle);
        sink(HostEvent::LinkStateChanged {
            handle,
            status: LINK_LOST,
            connected: false,
        });
    }
}

// ============================================================================
// HOST CAPABILITY
// ============================================================================

struct Link {
    sink: HostEventSink,
    /// Set once the connect request succeeded
    peripheral: Option<Peripheral>,
    characteristics: Vec<Characteristic>,
    disconnecting: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    /// Keep a handle to `task`, dropping those that already ran to completion.
    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }
}

type LinkTable = Arc<Mutex<HashMap<LinkHandle, Link>>>;

pub struct BtleHost {
    runtime: Handle,
    adapter: Adapter,
    links: LinkTable,
    next_handle: AtomicU64,
}

impl BtleHost {
    fn connected(&self, handle: LinkHandle) -> Result<(Peripheral, HostEventSink), HostError> {
        let links = self.links.lock();
        let link = links.get(&handle).ok_or(HostError::InvalidHandle(handle))?;
        let peripheral = link
            .peripheral
            .clone()
            .ok_or(HostError::InvalidHandle(handle))?;
        Ok((peripheral, link.sink.clone()))
    }

    fn characteristic(
        &self,
        handle: LinkHandle,
        service: Uuid,
        uuid: Uuid,
    ) -> Result<(Peripheral, Characteristic, HostEventSink), HostError> {
        let links = self.links.lock();
        let link = links.get(&handle).ok_or(HostError::InvalidHandle(handle))?;
        let peripheral = link
            .peripheral
            .clone()
            .ok_or(HostError::InvalidHandle(handle))?;
        let characteristic = link
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .cloned()
            .ok_or(HostError::NotFound(uuid))?;
        Ok((peripheral, characteristic, link.sink.clone()))
    }

    fn track(&self, handle: LinkHandle, task: JoinHandle<()>) {
        match self.links.lock().get_mut(&handle) {
            Some(link) => link.track(task),
            None => task.abort(),
        }
    }
}

async fn find_peripheral(adapter: &Adapter, address: &DeviceAddress) -> Result<Peripheral> {
    let peripherals = adapter
        .peripherals()
        .await
        .context("Failed to list peripherals")?;
    for peripheral in peripherals {
        if address.matches(&peripheral.address().to_string()) {
            return Ok(peripheral);
        }
    }
    anyhow::bail!("{} has not been seen by a scan", address)
}

async fn pump_notifications(handle: LinkHandle, peripheral: Peripheral, sink: HostEventSink) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("btle: no notification stream for {}: {}", handle, e);
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        sink(HostEvent::CharacteristicChanged {
            handle,
            characteristic: notification.uuid,
            value: notification.value,
        });
    }
}

fn describe(characteristic: &Characteristic) -> CharacteristicDescriptor {
    CharacteristicDescriptor::from_properties(
        characteristic.service_uuid,
        characteristic.uuid,
        characteristic.properties.bits(),
    )
}

impl HostCapability for BtleHost {
    /// btleplug exposes no power state here; a powered-off adapter surfaces
    /// as failed requests instead.
    fn is_radio_enabled(&self) -> bool {
        true
    }

    fn connect(
        &self,
        address: &DeviceAddress,
        events: HostEventSink,
    ) -> Result<LinkHandle, HostError> {
        let handle = LinkHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.links.lock().insert(
            handle,
            Link {
                sink: events.clone(),
                peripheral: None,
                characteristics: Vec::new(),
                disconnecting: false,
                tasks: Vec::new(),
            },
        );

        let adapter = self.adapter.clone();
        let links = Arc::clone(&self.links);
        let target = address.clone();
        let task = self.runtime.spawn(async move {
            let opened = match find_peripheral(&adapter, &target).await {
                Ok(peripheral) => match peripheral.connect().await {
                    Ok(()) => Ok(peripheral),
                    Err(e) => Err(anyhow::Error::new(e).context("Connect request failed")),
                },
                Err(e) => Err(e),
            };
            let peripheral = match opened {
                Ok(peripheral) => peripheral,
                Err(e) => {
                    warn!("btle: connect to {} failed: {:#}", target, e);
                    events(HostEvent::LinkStateChanged {
                        handle,
                        status: GATT_ERROR,
                        connected: false,
                    });
                    return;
                }
            };

            let pump = tokio::spawn(pump_notifications(
                handle,
                peripheral.clone(),
                events.clone(),
            ));
            let attached = match links.lock().get_mut(&handle) {
                Some(link) => {
                    link.peripheral = Some(peripheral.clone());
                    link.tasks.push(pump);
                    true
                }
                None => {
                    pump.abort();
                    false
                }
            };
            if attached {
                events(HostEvent::LinkStateChanged {
                    handle,
                    status: GATT_SUCCESS,
                    connected: true,
                });
            } else if let Err(e) = peripheral.disconnect().await {
                debug!("btle: disconnect of abandoned link failed: {}", e);
            }
        });
        self.track(handle, task);
        Ok(handle)
    }

    fn disconnect(&self, handle: LinkHandle) {
        let (peripheral, sink) = {
            let mut links = self.links.lock();
            let Some(link) = links.get_mut(&handle) else {
                return;
            };
            link.disconnecting = true;
            (link.peripheral.clone(), link.sink.clone())
        };
        let task = self.runtime.spawn(async move {
            if let Some(peripheral) = peripheral {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("btle: disconnect of {} failed: {}", handle, e);
                }
            }
            sink(HostEvent::LinkStateChanged {
                handle,
                status: GATT_SUCCESS,
                connected: false,
            });
        });
        self.track(handle, task);
    }

    fn close(&self, handle: LinkHandle) {
        let Some(link) = self.links.lock().remove(&handle) else {
            return;
        };
        for task in &link.tasks {
            task.abort();
        }
        if let Some(peripheral) = link.peripheral {
            self.runtime.spawn(async move {
                if peripheral.is_connected().await.unwrap_or(false) {
                    let _ = peripheral.disconnect().await;
                }
            });
        }
        debug!("btle: closed {}", handle);
    }

    fn request_connection_priority(&self, handle: LinkHandle, priority: LinkPriority) {
        debug!("btle: {} asked for {:?} priority, left to the OS", handle, priority);
    }

    fn discover_services(&self, handle: LinkHandle) -> Result<(), HostError> {
        let (peripheral, sink) = self.connected(handle)?;
        let links = Arc::clone(&self.links);
        let task = self.runtime.spawn(async move {
            let (status, found) = match peripheral.discover_services().await {
                Ok(()) => (
                    GATT_SUCCESS,
                    peripheral.characteristics().into_iter().collect::<Vec<_>>(),
                ),
                Err(e) => {
                    warn!("btle: discovery on {} failed: {}", handle, e);
                    (GATT_ERROR, Vec::new())
                }
            };
            let characteristics = found.iter().map(describe).collect();
            if let Some(link) = links.lock().get_mut(&handle) {
                link.characteristics = found;
            }
            sink(HostEvent::ServicesDiscovered {
                handle,
                status,
                characteristics,
            });
        });
        self.track(handle, task);
        Ok(())
    }

    fn read_characteristic(
        &self,
        handle: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), HostError> {
        let (peripheral, target, sink) = self.characteristic(handle, service, characteristic)?;
        let task = self.runtime.spawn(async move {
            let (value, status) = match peripheral.read(&target).await {
                Ok(value) => (value, GATT_SUCCESS),
                Err(e) => {
                    warn!("btle: read of {} failed: {}", characteristic, e);
                    (Vec::new(), GATT_ERROR)
                }
            };
            sink(HostEvent::CharacteristicRead {
                handle,
                characteristic,
                value,
                status,
            });
        });
        self.track(handle, task);
        Ok(())
    }

    fn write_characteristic(
        &self,
        handle: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), HostError> {
        let (peripheral, target, sink) = self.characteristic(handle, service, characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        let data = data.to_vec();
        let task = self.runtime.spawn(async move {
            let status = match peripheral.write(&target, &data, write_type).await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    warn!("btle: write to {} failed: {}", characteristic, e);
                    GATT_ERROR
                }
            };
            sink(HostEvent::CharacteristicWrite {
                handle,
                characteristic,
                status,
            });
        });
        self.track(handle, task);
        Ok(())
    }

    fn set_notification(
        &self,
        handle: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
        indication: bool,
    ) -> Result<(), HostError> {
        let (peripheral, target, sink) = self.characteristic(handle, service, characteristic)?;
        // btleplug picks notify or indicate from the characteristic's properties.
        debug!(
            "btle: {} {} on {}",
            if enable { "subscribing" } else { "unsubscribing" },
            if indication { "indications" } else { "notifications" },
            characteristic
        );
        let task = self.runtime.spawn(async move {
            let result = if enable {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            let status = match result {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    warn!("btle: subscription change on {} failed: {}", characteristic, e);
                    GATT_ERROR
                }
            };
            sink(HostEvent::DescriptorWrite {
                handle,
                characteristic,
                status,
            });
        });
        self.track(handle, task);
        Ok(())
    }

    /// The desktop stacks negotiate the MTU on their own and do not expose
    /// the exchange.
    fn request_mtu(&self, handle: LinkHandle, mtu: u16) -> Result<(), HostError> {
        let (_, sink) = self.connected(handle)?;
        debug!("btle: MTU {} requested on {}, not supported", mtu, handle);
        sink(HostEvent::MtuChanged {
            handle,
            mtu: DEFAULT_MTU,
            status: REQUEST_NOT_SUPPORTED,
        });
        Ok(())
    }
}

// ============================================================================
// SCAN BACKEND
// ============================================================================

pub struct BtleScanBackend {
    runtime: Handle,
    adapter: Adapter,
    scanning: AtomicBool,
    scanner: Mutex<Option<ScannerHandle>>,
}

impl BtleScanBackend {
    /// Route scan results to `scanner`.
    pub fn attach(&self, scanner: ScannerHandle) {
        *self.scanner.lock() = Some(scanner);
    }

    async fn on_seen(&self, adapter: &Adapter, id: &PeripheralId) {
        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        let Some(scanner) = self.scanner.lock().clone() else {
            return;
        };
        let Ok(peripheral) = adapter.peripheral(id).await else {
            return;
        };
        let Ok(Some(properties)) = peripheral.properties().await else {
            return;
        };
        let Some(rssi) = properties.rssi else {
            return;
        };
        scanner.report_device(
            properties.address.to_string(),
            rssi,
            advertisement_from(&properties),
        );
    }
}

impl ScanBackend for BtleScanBackend {
    fn is_available(&self) -> bool {
        true
    }

    fn start(&self) -> Result<(), ScannerError> {
        self.scanning.store(true, Ordering::SeqCst);
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                warn!("btle: scan start failed: {}", e);
            }
        });
        Ok(())
    }

    fn stop(&self) {
        self.scanning.store(false, Ordering::SeqCst);
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("btle: scan stop failed: {}", e);
            }
        });
    }
}

// ============================================================================
// ADVERTISEMENT RE-ENCODING
// ============================================================================

/// Rebuilds raw advertising-data records from the fields btleplug has
/// already parsed, so every backend feeds the same parser.
#[derive(Default)]
pub struct AdvertisementWriter {
    bytes: Vec<u8>,
}

impl AdvertisementWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, ad_type: u8, payload: &[u8]) {
        let payload = &payload[..payload.len().min(254)];
        self.bytes.push(payload.len() as u8 + 1);
        self.bytes.push(ad_type);
        self.bytes.extend_from_slice(payload);
    }

    pub fn name(&mut self, name: &str) -> &mut Self {
        self.record(0x09, name.as_bytes());
        self
    }

    pub fn tx_power(&mut self, dbm: i16) -> &mut Self {
        let level = dbm.clamp(i8::MIN as i16, i8::MAX as i16) as i8;
        self.record(0x0a, &level.to_le_bytes());
        self
    }

    pub fn services(&mut self, services: &[Uuid]) -> &mut Self {
        let (short, long): (Vec<&Uuid>, Vec<&Uuid>) =
            services.iter().partition(|uuid| short_form(uuid).is_some());
        if !short.is_empty() {
            let payload: Vec<u8> = short
                .iter()
                .filter_map(|uuid| short_form(uuid))
                .flat_map(u16::to_le_bytes)
                .collect();
            self.record(0x03, &payload);
        }
        if !long.is_empty() {
            let payload: Vec<u8> = long
                .iter()
                .flat_map(|uuid| uuid.as_u128().to_le_bytes())
                .collect();
            self.record(0x07, &payload);
        }
        self
    }

    pub fn manufacturer(&mut self, company: u16, data: &[u8]) -> &mut Self {
        let mut payload = company.to_le_bytes().to_vec();
        payload.extend_from_slice(data);
        self.record(0xff, &payload);
        self
    }

    pub fn service_data(&mut self, service: &Uuid, data: &[u8]) -> &mut Self {
        match short_form(service) {
            Some(short) => {
                let mut payload = short.to_le_bytes().to_vec();
                payload.extend_from_slice(data);
                self.record(0x16, &payload);
            }
            None => {
                let mut payload = service.as_u128().to_le_bytes().to_vec();
                payload.extend_from_slice(data);
                self.record(0x21, &payload);
            }
        }
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

/// 16-bit alias of a UUID built on the Bluetooth base UUID.
fn short_form(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let alias = value >> 96;
    let base = value & !(0xffff_ffff_u128 << 96);
    (base == BASE_UUID && alias <= u16::MAX as u128).then_some(alias as u16)
}

fn advertisement_from(properties: &PeripheralProperties) -> Vec<u8> {
    let mut writer = AdvertisementWriter::new();
    if let Some(name) = &properties.local_name {
        writer.name(name);
    }
    if let Some(dbm) = properties.tx_power_level {
        writer.tx_power(dbm);
    }
    writer.services(&properties.services);

    let mut companies: Vec<_> = properties.manufacturer_data.iter().collect();
    companies.sort_by_key(|(company, _)| **company);
    for (company, data) in companies {
        writer.manufacturer(*company, data);
    }
    let mut services: Vec<_> = properties.service_data.iter().collect();
    services.sort_by_key(|(service, _)| **service);
    for (service, data) in services {
        writer.service_data(service, data);
    }
    writer.finish()
}
