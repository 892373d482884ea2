//! Device-driver seam
//!
//! The native SDK (handle management, register access, byte-stream reads)
//! is an external collaborator. This module pins down the five operations
//! the pipeline consumes as a trait, so acquisition code can run against
//! real hardware, an emulator or a test double without caring which.

use thiserror::Error;

use crate::common::RawData;

/// Forward-slashed command and parameter paths understood by the driver
pub mod paths {
    pub const CMD_ARM_ACQUISITION: &str = "/cmd/ArmAcquisition";
    pub const CMD_DISARM_ACQUISITION: &str = "/cmd/DisarmAcquisition";
    pub const CMD_RESET: &str = "/cmd/Reset";
    pub const CMD_SW_START_ACQUISITION: &str = "/cmd/SwStartAcquisition";
    pub const CMD_SW_STOP_ACQUISITION: &str = "/cmd/SwStopAcquisition";
    pub const CMD_SEND_SW_TRIGGER: &str = "/cmd/SendSwTrigger";

    pub const PAR_RECORD_LENGTH: &str = "/par/reclen";
    pub const PAR_MAX_RAW_DATA_SIZE: &str = "/par/MaxRawDataSize";
    pub const PAR_ADC_SAMPLE_RATE: &str = "/par/ADC_SamplRate";
    pub const PAR_START_MODE: &str = "/par/startmode";
}

/// Driver-side failure
#[derive(Error, Debug)]
pub enum DriverError {
    /// Command rejected by the device
    #[error("command failed: {path}: {reason}")]
    Command { path: String, reason: String },

    /// Parameter read/write rejected by the device
    #[error("parameter access failed: {path}: {reason}")]
    Parameter { path: String, reason: String },

    /// Device connection lost or never established
    #[error("device not reachable: {0}")]
    NotReachable(String),

    /// Device tree was not valid JSON
    #[error("device tree error: {0}")]
    DeviceTree(#[from] serde_json::Error),
}

impl DriverError {
    pub fn command(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn parameter(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parameter {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// An open connection to one digitizer.
///
/// Implementations own the handle lifecycle; dropping the value closes the
/// device. `read_data` follows the driver convention of returning
/// `Ok(None)` on timeout so that polling loops can distinguish "no data
/// yet" from real failures.
pub trait DeviceHandle: Send {
    /// Issue a control command (`/cmd/...` path)
    fn send_command(&self, path: &str) -> Result<(), DriverError>;

    /// Read a parameter value as a string
    fn get_parameter(&self, path: &str) -> Result<String, DriverError>;

    /// Write a parameter value
    fn set_parameter(&self, path: &str, value: &str) -> Result<(), DriverError>;

    /// Fetch the device-tree JSON describing the parameter schema
    fn device_tree(&self) -> Result<serde_json::Value, DriverError>;

    /// Check whether data is available within `timeout_ms`
    fn has_data(&self, timeout_ms: i32) -> Result<bool, DriverError>;

    /// Read one raw buffer of at most `max_size` bytes.
    /// `Ok(None)` means the timeout elapsed without data.
    fn read_data(&self, timeout_ms: i32, max_size: usize) -> Result<Option<RawData>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::command(paths::CMD_RESET, "device busy");
        assert!(err.to_string().contains("/cmd/Reset"));
        assert!(err.to_string().contains("device busy"));

        let err = DriverError::parameter(paths::PAR_RECORD_LENGTH, "out of range");
        assert!(err.to_string().contains("/par/reclen"));
    }

    #[test]
    fn test_paths_are_forward_slashed() {
        for path in [
            paths::CMD_ARM_ACQUISITION,
            paths::CMD_DISARM_ACQUISITION,
            paths::CMD_RESET,
            paths::CMD_SW_START_ACQUISITION,
            paths::CMD_SW_STOP_ACQUISITION,
            paths::CMD_SEND_SW_TRIGGER,
            paths::PAR_RECORD_LENGTH,
            paths::PAR_MAX_RAW_DATA_SIZE,
            paths::PAR_ADC_SAMPLE_RATE,
            paths::PAR_START_MODE,
        ] {
            assert!(path.starts_with('/'));
        }
    }
}
