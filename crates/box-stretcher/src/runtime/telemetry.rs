use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use stretch_core::{Rig, RunOutcome, Session, StretchError};
use stretch_io::metrics::{
    init_metrics, publish_status, serve_metrics, MOVES_ISSUED, PORTS_CONNECTED, RUNS_COMPLETED,
    RUNS_FAILED, RUNS_STARTED, RUNS_STOPPED,
};
use tracing::{info, trace};

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Metrics label for a session: its port once bound, else its name.
pub fn label(session: &Session) -> String {
    session.port().unwrap_or_else(|| session.name().to_string())
}

pub fn record_run_started(session: &Session) {
    RUNS_STARTED.with_label_values(&[&label(session)]).inc();
}

pub fn record_run_finished(session: &Session, result: &Result<RunOutcome, StretchError>) {
    let label = label(session);
    let counter = match result {
        Ok(RunOutcome::Completed { .. }) => &RUNS_COMPLETED,
        Ok(RunOutcome::Stopped { .. }) => &RUNS_STOPPED,
        Err(_) => &RUNS_FAILED,
    };
    counter.with_label_values(&[&label]).inc();
    MOVES_ISSUED
        .with_label_values(&[&label])
        .inc_by(session.stats().moves_issued);
}

/// Mirrors every session into the gauges until `stop` is raised.
///
/// Position is only read from the device while metrics are served, since it
/// costs a round trip on the serial line.
pub fn start_metrics_updater(rig: Arc<Rig>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let mut connected = 0;
            for session in rig.sessions() {
                let is_connected = session.connected();
                let position = if is_connected {
                    session.position().ok()
                } else {
                    None
                };
                if is_connected {
                    connected += 1;
                }
                publish_status(&label(session), is_connected, &session.status(), position);
            }
            PORTS_CONNECTED.set(connected);
            trace!(connected, "metrics updated");

            thread::sleep(Duration::from_millis(200));
        }
    })
}
