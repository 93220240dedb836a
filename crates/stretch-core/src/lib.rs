pub mod actuator;
pub mod device;
pub mod error;
pub mod link;
pub mod protocol;
pub mod rig;
pub mod session;
#[cfg(feature = "simulation")]
pub mod sim;
pub mod status;
pub mod tags;

pub use actuator::{ActuatorConfig, CyclicActuator, ExecutionStats, RunOutcome};
pub use device::{AxisAddress, Connection, DeviceError, Transport};
pub use error::StretchError;
pub use link::{DeviceLink, DEFAULT_SPEED_MM_S};
pub use protocol::{MotionPlan, Protocol, ProtocolError, Unvalidated, Validated};
pub use rig::Rig;
pub use session::{Session, SessionSnapshot};
#[cfg(feature = "simulation")]
pub use sim::{SimCommand, SimConfig, SimulatedBench, SimulatedStage};
pub use status::{RunState, RunStatus, RunTicket, StatusBoard};
