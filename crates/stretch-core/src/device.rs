use std::fmt;
use thiserror::Error;

/// A device on the serial chain and one of its axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AxisAddress {
    pub device: u8,
    pub axis: u8,
}

impl AxisAddress {
    pub const fn new(device: u8, axis: u8) -> Self {
        Self { device, axis }
    }
}

impl fmt::Display for AxisAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.axis)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("failed to open port {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("device {target} rejected `{command}`: {reason}")]
    Rejected {
        target: AxisAddress,
        command: String,
        reason: String,
    },
    #[error("no reply to `{command}` within {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("malformed reply: {0}")]
    Malformed(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("connection is closed")]
    Closed,
}

/// An open connection to a chain of motion controllers.
///
/// Lengths are millimetres and speeds mm/s. Motion commands return once the
/// device has accepted them, not when motion is complete.
pub trait Connection: Send + Sync {
    /// Addresses of every device that answered discovery.
    fn detect_devices(&self) -> Result<Vec<u8>, DeviceError>;
    fn set_max_speed(&self, target: AxisAddress, mm_per_s: f64) -> Result<(), DeviceError>;
    fn home(&self, target: AxisAddress) -> Result<(), DeviceError>;
    /// Halts the axis without waiting for it to settle.
    fn stop(&self, target: AxisAddress) -> Result<(), DeviceError>;
    fn move_absolute(&self, target: AxisAddress, mm: f64) -> Result<(), DeviceError>;
    fn move_relative(&self, target: AxisAddress, mm: f64) -> Result<(), DeviceError>;
    fn position(&self, target: AxisAddress) -> Result<f64, DeviceError>;
    fn is_busy(&self, target: AxisAddress) -> Result<bool, DeviceError>;
    fn close(&self) -> Result<(), DeviceError>;
}

/// Opens connections by platform port name (`COM7`, `/dev/ttyUSB0`, ...).
pub trait Transport: Send + Sync {
    fn open(&self, port: &str) -> Result<Box<dyn Connection>, DeviceError>;
}
