use crate::device::DeviceError;
use crate::protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StretchError {
    #[error("motor must be connected first")]
    NotConnected,
    #[error("already connected to {port}")]
    AlreadyConnected { port: String },
    #[error("no motion device found on {port}: {reason}")]
    DeviceDiscovery { port: String, reason: String },
    #[error("invalid protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("device command failed: {0}")]
    DeviceCommand(#[from] DeviceError),
    #[error("a protocol run is already in progress")]
    RunInProgress,
    #[error("failed to start run worker: {0}")]
    WorkerSpawn(String),
    #[error("run worker panicked")]
    WorkerPanicked,
}
