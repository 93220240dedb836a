use crate::actuator::ActuatorConfig;
use crate::device::Transport;
use crate::session::{Session, SessionSnapshot};
use log::warn;
use std::sync::Arc;

/// A bench of independently driven motors, one session each.
pub struct Rig {
    transport: Arc<dyn Transport>,
    actuator_config: ActuatorConfig,
    sessions: Vec<Arc<Session>>,
}

impl Rig {
    pub fn new(transport: Arc<dyn Transport>, actuator_config: ActuatorConfig) -> Self {
        Self {
            transport,
            actuator_config,
            sessions: Vec::new(),
        }
    }

    /// Adds a new, unconnected motor named `Motor N`.
    pub fn add_motor(&mut self) -> Arc<Session> {
        let name = format!("Motor {}", self.sessions.len() + 1);
        let session = Arc::new(Session::new(
            name,
            Arc::clone(&self.transport),
            self.actuator_config.clone(),
        ));
        self.sessions.push(Arc::clone(&session));
        session
    }

    pub fn sessions(&self) -> &[Arc<Session>] {
        &self.sessions
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|s| s.snapshot()).collect()
    }

    pub fn any_running(&self) -> bool {
        self.sessions.iter().any(|s| s.is_running())
    }

    /// Stops every motor that is connected.
    pub fn stop_all(&self) {
        for session in self.sessions.iter().filter(|s| s.connected()) {
            if let Err(e) = session.stop() {
                warn!("{}: stop failed: {}", session.name(), e);
            }
        }
    }
}
