use crate::actuator::{ActuatorConfig, CyclicActuator, ExecutionStats, RunOutcome};
use crate::device::Transport;
use crate::error::StretchError;
use crate::link::DeviceLink;
use crate::protocol::{Protocol, Unvalidated};
use crate::status::{RunStatus, StatusBoard};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

type RunResult = Result<RunOutcome, StretchError>;

/// What a poller sees of a session without touching the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub name: String,
    pub port: Option<String>,
    pub connected: bool,
    #[serde(flatten)]
    pub status: RunStatus,
}

/// Clears the active flag when the worker exits, panics included.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything belonging to one physical motor: its link, its status board,
/// its protocol, and at most one background run.
pub struct Session {
    name: String,
    link: Arc<DeviceLink>,
    board: Arc<StatusBoard>,
    protocol: Mutex<Protocol<Unvalidated>>,
    actuator_config: ActuatorConfig,
    active: Arc<AtomicBool>,
    cancel: Mutex<Arc<AtomicBool>>,
    worker: Mutex<Option<JoinHandle<RunResult>>>,
    stats: Arc<Mutex<ExecutionStats>>,
}

impl Session {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, actuator_config: ActuatorConfig) -> Self {
        Self {
            name: name.into(),
            link: Arc::new(DeviceLink::new(transport)),
            board: Arc::new(StatusBoard::new()),
            protocol: Mutex::new(Protocol::default()),
            actuator_config,
            active: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
            worker: Mutex::new(None),
            stats: Arc::new(Mutex::new(ExecutionStats::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connect(&self, port: &str) -> Result<(), StretchError> {
        self.link.connect(port)
    }

    /// Stops and reaps any active run before releasing the link.
    pub fn disconnect(&self) -> Result<(), StretchError> {
        if self.is_running() {
            let _ = self.stop();
            if let Some(result) = self.wait() {
                log_result(&self.name, &result);
            }
        }
        self.board.reset();
        self.link.disconnect()
    }

    pub fn home(&self) -> Result<(), StretchError> {
        self.link.home()
    }

    pub fn move_absolute(&self, length_mm: f64, speed_mm_s: f64) -> Result<(), StretchError> {
        self.ensure_idle()?;
        self.link.move_absolute(length_mm, speed_mm_s)
    }

    pub fn move_relative(&self, length_mm: f64, speed_mm_s: f64) -> Result<(), StretchError> {
        self.ensure_idle()?;
        self.link.move_relative(length_mm, speed_mm_s)
    }

    fn ensure_idle(&self) -> Result<(), StretchError> {
        if self.is_running() {
            Err(StretchError::RunInProgress)
        } else {
            Ok(())
        }
    }

    pub fn protocol(&self) -> Protocol<Unvalidated> {
        *lock(&self.protocol)
    }

    pub fn set_protocol(&self, protocol: Protocol<Unvalidated>) {
        *lock(&self.protocol) = protocol;
    }

    /// Starts `protocol` on a background worker and returns immediately.
    ///
    /// Validation and the connection check happen here, so a bad request
    /// fails before any thread is spawned or any status is touched.
    pub fn run_protocol(&self, protocol: Protocol<Unvalidated>) -> Result<(), StretchError> {
        self.set_protocol(protocol);
        let validated = protocol.validate()?;
        if !self.link.connected() {
            return Err(StretchError::NotConnected);
        }
        // `stop` raises whichever token sits in this slot, so the new run's
        // token goes in before the slot is released.
        let mut cancel_slot = lock(&self.cancel);
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StretchError::RunInProgress);
        }
        let cancel = Arc::new(AtomicBool::new(false));
        *cancel_slot = Arc::clone(&cancel);
        drop(cancel_slot);

        // The previous worker has cleared its active flag, so joining it
        // here waits at most for thread teardown.
        let previous = lock(&self.worker).take();
        if let Some(handle) = previous {
            log_result(&self.name, &self.join(handle));
        }

        let guard = ActiveGuard(Arc::clone(&self.active));
        let link = Arc::clone(&self.link);
        let board = Arc::clone(&self.board);
        let stats = Arc::clone(&self.stats);
        let config = self.actuator_config.clone();
        let spawned = thread::Builder::new()
            .name(format!("stretch-run-{}", self.name))
            .spawn(move || {
                let _guard = guard;
                let mut actuator = CyclicActuator::new(config);
                let result = actuator.run(&validated, &link, &board, &cancel);
                lock(&stats).absorb(actuator.stats());
                result
            });

        match spawned {
            Ok(handle) => {
                *lock(&self.worker) = Some(handle);
                info!(
                    "{}: started {} cycles (L0 {} mm, strain {} %, rate {} %/s)",
                    self.name,
                    validated.cycles(),
                    validated.l0_mm(),
                    validated.strain_pct(),
                    validated.strain_rate_pct_s()
                );
                Ok(())
            }
            // The guard was moved into the closure and dropped with it,
            // which already cleared the active flag.
            Err(e) => Err(StretchError::WorkerSpawn(e.to_string())),
        }
    }

    /// Halts the stage and returns the status to idle.
    ///
    /// The software side always takes effect; the hardware halt is best
    /// effort and its error, if any, is returned after the reset.
    pub fn stop(&self) -> Result<(), StretchError> {
        lock(&self.cancel).store(true, Ordering::Release);
        self.board.reset();
        let result = self.link.stop();
        if let Err(e) = &result {
            warn!("{}: hardware stop failed: {}", self.name, e);
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Blocks until the current run finishes and returns its result, or
    /// `None` if no run was started since the last collection.
    pub fn wait(&self) -> Option<RunResult> {
        let handle = lock(&self.worker).take()?;
        Some(self.join(handle))
    }

    /// Collects the result of a run that has already finished, without
    /// blocking.
    pub fn take_finished(&self) -> Option<RunResult> {
        let mut worker = lock(&self.worker);
        if !worker.as_ref().is_some_and(|h| h.is_finished()) {
            return None;
        }
        let handle = worker.take()?;
        drop(worker);
        Some(self.join(handle))
    }

    fn join(&self, handle: JoinHandle<RunResult>) -> RunResult {
        handle.join().unwrap_or_else(|_| {
            error!("{}: run worker panicked", self.name);
            self.board.reset();
            Err(StretchError::WorkerPanicked)
        })
    }

    pub fn status(&self) -> RunStatus {
        self.board.snapshot()
    }

    pub fn connected(&self) -> bool {
        self.link.connected()
    }

    pub fn port(&self) -> Option<String> {
        self.link.port()
    }

    pub fn is_busy(&self) -> Result<bool, StretchError> {
        self.link.is_busy()
    }

    pub fn position(&self) -> Result<f64, StretchError> {
        self.link.position()
    }

    pub fn stats(&self) -> ExecutionStats {
        lock(&self.stats).clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            name: self.name.clone(),
            port: self.port(),
            connected: self.connected(),
            status: self.status(),
        }
    }
}

fn log_result(name: &str, result: &RunResult) {
    match result {
        Ok(outcome) => info!("{}: run ended: {:?}", name, outcome),
        Err(e) => warn!("{}: run failed: {}", name, e),
    }
}
