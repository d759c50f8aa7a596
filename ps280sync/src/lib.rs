//! # ps280sync
//!
//! A library for talking to PS-280 climate sensors over their USB serial
//! console, and for keeping their configuration in sync with a desired
//! state.
//!
//! This crate provides:
//!
//! - Device discovery over a VID/PID allow-list plus a chip-identification
//!   probe
//! - A resilient serial transport with liveness checks and reconnection
//! - Token-delimited command exchanges with VT100 noise removal
//! - Settings snapshots, parameter metadata and type-aware value rendering
//! - A synchronization engine producing per-parameter outcomes
//! - Firmware erase/flash through an external flashing tool
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for settings and reports
//!
//! ## Example
//!
//! ```rust,no_run
//! use ps280sync::{DesiredConfiguration, DesiredValue, ParameterPolicy, Ps280};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let mut sensor = Ps280::native(Default::default());
//!
//!         let mut desired = DesiredConfiguration::default();
//!         desired.insert("CORE", "MSI", DesiredValue::Integer(300));
//!
//!         let policy = ParameterPolicy::new().with_superuser(["CORE.SERIAL"]);
//!         let report = sensor.apply(&desired, &policy)?;
//!         for entry in &report.entries {
//!             println!("{}: {}", entry.key, entry.outcome);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod controls;
pub mod device;
pub mod error;
pub mod firmware;
pub mod port;
pub mod protocol;
pub mod retry;
pub mod sensor;
pub mod settings;
pub mod sync;
pub mod tool;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Retry loops and
/// the synchronization engine consult it between steps.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    #[cfg(test)]
    if TEST_INTERRUPTED.with(std::cell::Cell::get) {
        return true;
    }

    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Per-thread so that parallel tests cannot observe each other's requests.
#[cfg(test)]
thread_local! {
    static TEST_INTERRUPTED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    TEST_INTERRUPTED.with(|flag| flag.set(value));
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use {
    device::list_candidate_ports,
    port::{NativePort, NativePortEnumerator},
    transport::NativeBackend,
};
pub use {
    controls::{MqttSettings, Switch, WarningThreshold},
    device::{CandidatePort, DeviceKind, UsbId, default_allow_list},
    error::{Error, Result},
    firmware::{
        Esptool, FirmwareImageSet, FirmwareLifecycle, FirmwareState, FlashTool,
        list_firmware_versions,
    },
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{CommandExchange, ProtocolTiming, Reply, clean_line, send_command},
    retry::RetryPolicy,
    sensor::{ConfigurableDevice, Ps280},
    settings::{
        CapturedParameter, DesiredConfiguration, DesiredValue, ParameterInfo, ParameterKey,
        SettingsSnapshot, ValueKind,
    },
    sync::{
        FailReason, KeyOutcome, Outcome, ParameterPolicy, PlannedAction, PlannedChange,
        SkipReason, SyncReport, plan,
    },
    tool::{FlashToolConfig, ToolLine, ToolStream},
    transport::{Connection, SerialBackend, Transport, TransportConfig},
};
