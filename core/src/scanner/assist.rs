//! Targeted scan subscription that runs while a session is connecting.
//!
//! Some stacks connect faster when the peer has been seen recently, so a
//! connecting session subscribes to the shared scanner and reports sightings
//! of its own address. The subscription ends on drop.

use super::duty_cycle::{ScanListener, ScannerError, ScannerHandle};
use crate::config::DeviceAddress;
use std::sync::Arc;
use tracing::debug;

struct TargetFilter<F> {
    target: DeviceAddress,
    on_sighting: F,
}

impl<F> ScanListener for TargetFilter<F>
where
    F: Fn(i16) + Send + Sync,
{
    fn on_device(&self, address: &str, rssi: i16, _advertisement: &[u8]) {
        if self.target.matches(address) {
            (self.on_sighting)(rssi);
        }
    }
}

pub struct AssistScanner {
    scanner: ScannerHandle,
    listener: Arc<dyn ScanListener>,
    target: DeviceAddress,
}

impl AssistScanner {
    pub fn start(
        scanner: &ScannerHandle,
        target: DeviceAddress,
        on_sighting: impl Fn(i16) + Send + Sync + 'static,
    ) -> Result<Self, ScannerError> {
        let listener: Arc<dyn ScanListener> = Arc::new(TargetFilter {
            target: target.clone(),
            on_sighting,
        });
        scanner.start_scan(Arc::clone(&listener))?;
        debug!("assist: scanning for {}", target);
        Ok(Self {
            scanner: scanner.clone(),
            listener,
            target,
        })
    }

    pub fn target(&self) -> &DeviceAddress {
        &self.target
    }

    pub fn stop(self) {}
}

impl Drop for AssistScanner {
    fn drop(&mut self) {
        debug!("assist: stopped for {}", self.target);
        self.scanner.stop_scan(&self.listener);
    }
}
