//! Shared scanning: one duty-cycled backend scan, many subscribers.
pub mod assist;
pub mod duty_cycle;

pub use assist::AssistScanner;
pub use duty_cycle::{
    DutyCycledScanner, ScanBackend, ScanConfig, ScanListener, ScannerError, ScannerHandle,
    ScannerState, ScannerStatus,
};
