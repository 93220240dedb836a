pub mod ascii;
pub mod metrics;
pub mod serial;

pub use ascii::{AsciiError, Command, Message, Reply, Units};
pub use metrics::{init_metrics, publish_status, serve_metrics};
pub use serial::{AsciiConnection, SerialConfig, SerialTransport};
