//! Device registry.
//!
//! One [`BleManager`] owns the shared scanner and every live [`BleDevice`],
//! keyed by address. App-lifecycle and radio-state changes are fanned out to
//! all of them from here.

use crate::config::{DeviceAddress, SessionConfig};
use crate::host::HostCapability;
use crate::scanner::{DutyCycledScanner, ScanBackend, ScanConfig, ScannerHandle};
use crate::session::device::BleDevice;
use crate::BleError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct BleManager {
    host: Arc<dyn HostCapability>,
    scanner: ScannerHandle,
    devices: RwLock<HashMap<DeviceAddress, BleDevice>>,
    foreground: AtomicBool,
    radio_enabled: AtomicBool,
}

impl BleManager {
    /// Create the manager and start its scanner. Must be called inside a
    /// tokio runtime.
    pub fn new(
        host: Arc<dyn HostCapability>,
        scan_backend: Arc<dyn ScanBackend>,
        scan_config: ScanConfig,
    ) -> Self {
        let radio_enabled = host.is_radio_enabled();
        Self {
            host,
            scanner: DutyCycledScanner::spawn(scan_backend, scan_config),
            devices: RwLock::new(HashMap::new()),
            foreground: AtomicBool::new(true),
            radio_enabled: AtomicBool::new(radio_enabled),
        }
    }

    pub fn scanner(&self) -> &ScannerHandle {
        &self.scanner
    }

    /// Return the device for `config.address`, creating its session on
    /// first use. An existing device keeps its original configuration.
    pub fn get_or_create_device(&self, config: SessionConfig) -> Result<BleDevice, BleError> {
        config.validate()?;
        let mut devices = self.devices.write();
        if let Some(device) = devices.get(&config.address) {
            return Ok(device.clone());
        }

        let address = config.address.clone();
        let device = BleDevice::spawn(config, Arc::clone(&self.host), Some(self.scanner.clone()));
        if !self.is_app_foreground() {
            device.set_app_foreground(false);
        }
        devices.insert(address.clone(), device.clone());
        info!("manager: registered {} ({} device(s))", address, devices.len());
        Ok(device)
    }

    /// Look up a device by address, in either case.
    pub fn device(&self, address: &str) -> Option<BleDevice> {
        let address = DeviceAddress::parse(address).ok()?;
        self.devices.read().get(&address).cloned()
    }

    /// Close and forget one device.
    pub async fn remove_device(&self, address: &str) -> bool {
        let Ok(address) = DeviceAddress::parse(address) else {
            return false;
        };
        let removed = self.devices.write().remove(&address);
        match removed {
            Some(device) => {
                device.close().await;
                info!("manager: removed {}", address);
                true
            }
            None => false,
        }
    }

    pub async fn remove_all_devices(&self) {
        let removed: Vec<BleDevice> = self.devices.write().drain().map(|(_, d)| d).collect();
        for device in &removed {
            device.close().await;
        }
        if !removed.is_empty() {
            info!("manager: removed {} device(s)", removed.len());
        }
    }

    pub fn devices(&self) -> Vec<BleDevice> {
        self.devices.read().values().cloned().collect()
    }

    /// Devices whose session is `Ready`.
    pub fn connected_devices(&self) -> Vec<BleDevice> {
        self.devices
            .read()
            .values()
            .filter(|d| d.is_connected())
            .cloned()
            .collect()
    }

    pub fn set_app_foreground(&self, foreground: bool) {
        if self.foreground.swap(foreground, Ordering::SeqCst) == foreground {
            return;
        }
        info!(
            "manager: app moved to {}",
            if foreground { "foreground" } else { "background" }
        );
        for device in self.devices.read().values() {
            device.set_app_foreground(foreground);
        }
    }

    pub fn is_app_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    pub fn set_radio_enabled(&self, enabled: bool) {
        if self.radio_enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        info!("manager: radio {}", if enabled { "on" } else { "off" });
        self.scanner.radio_state_changed(enabled);
        for device in self.devices.read().values() {
            device.radio_state_changed(enabled);
        }
    }

    pub fn is_radio_enabled(&self) -> bool {
        self.radio_enabled.load(Ordering::SeqCst)
    }
}

impl Drop for BleManager {
    fn drop(&mut self) {
        self.scanner.shutdown();
    }
}
