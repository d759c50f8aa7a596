//! Error types for ps280sync.

use std::io;
use thiserror::Error;

/// Result type for ps280sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ps280sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations, subprocess pipes).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No candidate port passed the chip-identification probe.
    #[error("PS-280 not found after {attempts} discovery rounds")]
    DeviceNotFound {
        /// Number of discovery rounds performed.
        attempts: usize,
    },

    /// The serial port could not be claimed or stopped answering.
    #[error("Connection error on {port}: {reason}")]
    Connection {
        /// Port name/path.
        port: String,
        /// What went wrong.
        reason: String,
    },

    /// An exchange never produced a usable reply.
    #[error("No answer to '{command}' after {attempts} attempts")]
    ProtocolTimeout {
        /// The command that was sent.
        command: String,
        /// Number of attempts made.
        attempts: usize,
    },

    /// The device rejected a write with its error token.
    #[error("Device rejected {group}.{parameter} = '{value}': illegal value")]
    IllegalValue {
        /// Parameter group.
        group: String,
        /// Parameter name.
        parameter: String,
        /// Rejected value.
        value: String,
    },

    /// The parameter does not exist in the snapshot.
    #[error("Unknown parameter {group}.{parameter}")]
    UnknownParameter {
        /// Parameter group.
        group: String,
        /// Parameter name.
        parameter: String,
    },

    /// A `GROUP.PARAMETER` key could not be parsed.
    #[error("Invalid parameter key '{0}' (expected GROUP.PARAMETER)")]
    InvalidKey(String),

    /// The external flashing tool failed.
    #[error("Flash tool '{operation}' failed with {}", exit_description(.code))]
    FlashTool {
        /// The tool operation (e.g. `erase_flash`).
        operation: String,
        /// Process exit code, `None` if terminated by a signal.
        code: Option<i32>,
    },

    /// A firmware artifact is missing from a version directory.
    #[error("Missing firmware image: {0}")]
    MissingImage(String),

    /// A firmware lifecycle step was requested from the wrong state.
    #[error("Invalid firmware state: {0}")]
    InvalidState(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding application requested cancellation.
    #[error("Operation interrupted")]
    Interrupted,
}

#[allow(clippy::ref_option)]
fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
