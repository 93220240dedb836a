use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use serde::Serialize;
use serde_json::{json, Value};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stretch_core::{
    ActuatorConfig, Protocol, Rig, RunOutcome, Session, SessionSnapshot, SimConfig,
    SimulatedBench, StretchError, Transport,
};
use stretch_io::{SerialConfig, SerialTransport};
use thiserror::Error;
use tracing::{error, info, warn};

/// Upper bound on waiting for a home or jog to settle before a run.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Why a session did not get as far as its run.
#[derive(Debug, Error)]
enum PrepareError {
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Stretch(#[from] StretchError),
}

#[derive(Serialize)]
struct StatusLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    snapshot: &'a SessionSnapshot,
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("box-stretcher: {e}\nTry --help for usage.");
            return ExitCode::from(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    run(config)
}

pub fn run(config: RuntimeConfig) -> ExitCode {
    let _log_guard = match init_tracing(config.json_logs, config.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("box-stretcher: cannot open log file: {e}");
            return ExitCode::from(2);
        }
    };

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let transport = match build_transport(&config) {
        Ok(transport) => transport,
        Err(e) => {
            error!(error = %e, "Failed to start serial transport");
            return ExitCode::FAILURE;
        }
    };
    let actuator_config = ActuatorConfig {
        wait_for_idle: config.wait_for_idle,
        ..ActuatorConfig::default()
    };

    let mut rig = Rig::new(transport, actuator_config);
    for _ in &config.ports {
        rig.add_motor();
    }
    let rig = Arc::new(rig);

    let stop = Arc::new(AtomicBool::new(false));
    let _metrics_updater = config
        .metrics_addr
        .as_ref()
        .map(|_| telemetry::start_metrics_updater(Arc::clone(&rig), Arc::clone(&stop)));
    let interrupted = Arc::new(AtomicBool::new(false));
    install_ctrl_c(Arc::clone(&rig), Arc::clone(&interrupted));

    info!(
        ports = ?config.ports,
        simulated = config.simulate,
        run = config.run_protocol,
        "box-stretcher starting"
    );

    let mut failed = false;
    let mut running: Vec<(Arc<Session>, String)> = Vec::new();
    for (session, port) in rig.sessions().iter().zip(&config.ports) {
        match prepare(session, port, &config, &interrupted) {
            Ok(true) => running.push((Arc::clone(session), port.clone())),
            Ok(false) => emit(&idle_summary(session, port)),
            Err(PrepareError::Interrupted) => {
                warn!(motor = session.name(), port = %port, "interrupted before the run");
                emit(&interrupted_summary(session, port));
            }
            Err(PrepareError::Stretch(e)) => {
                error!(motor = session.name(), port = %port, error = %e, "session failed");
                emit(&failure_summary(session, port, &e));
                failed = true;
            }
        }
    }

    watch(&running, config.poll_interval);
    for (session, port) in &running {
        let Some(result) = session.wait() else {
            continue;
        };
        telemetry::record_run_finished(session, &result);
        if result.is_err() {
            failed = true;
        }
        emit(&run_summary(session, port, result));
    }

    for session in rig.sessions().iter().filter(|s| s.connected()) {
        if let Err(e) = session.disconnect() {
            warn!(motor = session.name(), error = %e, "disconnect failed");
        }
    }
    stop.store(true, Ordering::Relaxed);
    info!("box-stretcher finished");

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn build_transport(config: &RuntimeConfig) -> std::io::Result<Arc<dyn Transport>> {
    if config.simulate {
        info!("Using simulated stages");
        return Ok(Arc::new(SimulatedBench::new(SimConfig {
            move_time: config.sim_move_time,
            ..SimConfig::default()
        })));
    }
    let serial = SerialTransport::new(SerialConfig {
        baud_rate: config.baud_rate,
        microstep_mm: config.microstep_mm,
        reply_timeout: config.reply_timeout,
        ..SerialConfig::default()
    })?;
    Ok(Arc::new(serial))
}

/// Stops every motor on each Ctrl-C and raises `interrupted` so no further
/// action starts. The listener thread is detached.
fn install_ctrl_c(rig: Arc<Rig>, interrupted: Arc<AtomicBool>) {
    let spawned = thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "Ctrl-C handler unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    interrupted.store(true, Ordering::Release);
                    warn!("Interrupted, stopping all motors");
                    rig.stop_all();
                }
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Ctrl-C handler unavailable");
    }
}

fn check_interrupted(interrupted: &AtomicBool) -> Result<(), PrepareError> {
    if interrupted.load(Ordering::Acquire) {
        Err(PrepareError::Interrupted)
    } else {
        Ok(())
    }
}

/// Connects and performs the one-shot actions, giving up before each step
/// once Ctrl-C was seen. Returns true if a protocol run was started.
fn prepare(
    session: &Session,
    port: &str,
    config: &RuntimeConfig,
    interrupted: &AtomicBool,
) -> Result<bool, PrepareError> {
    check_interrupted(interrupted)?;
    session.connect(port)?;

    if config.home {
        check_interrupted(interrupted)?;
        session.home()?;
        settle(session, config, interrupted)?;
    }
    if let Some(mm) = config.move_to_mm {
        check_interrupted(interrupted)?;
        session.move_absolute(mm, config.speed_mm_s)?;
        settle(session, config, interrupted)?;
    }
    if let Some(mm) = config.move_by_mm {
        check_interrupted(interrupted)?;
        session.move_relative(mm, config.speed_mm_s)?;
        settle(session, config, interrupted)?;
    }

    if !config.run_protocol {
        return Ok(false);
    }
    let protocol = Protocol::from_fields(
        &config.l0_mm,
        &config.strain_pct,
        &config.strain_rate_pct_s,
        &config.cycles,
    )
    .map_err(StretchError::from)?;
    check_interrupted(interrupted)?;
    session.run_protocol(protocol)?;
    telemetry::record_run_started(session);

    // A signal landing while the run started may have found nothing to stop.
    if interrupted.load(Ordering::Acquire) {
        let _ = session.stop();
    }
    Ok(true)
}

/// Waits for the stage to go idle, so a following command does not replace
/// one still in motion.
fn settle(
    session: &Session,
    config: &RuntimeConfig,
    interrupted: &AtomicBool,
) -> Result<(), PrepareError> {
    if !config.wait_for_idle {
        return Ok(());
    }
    let started = Instant::now();
    while session.is_busy()? {
        check_interrupted(interrupted)?;
        if started.elapsed() > SETTLE_TIMEOUT {
            warn!(motor = session.name(), "stage still busy, continuing");
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

/// Prints a status line per running session until every run has ended.
fn watch(running: &[(Arc<Session>, String)], poll_interval: Duration) {
    while running.iter().any(|(s, _)| s.is_running()) {
        for (session, _) in running.iter().filter(|(s, _)| s.is_running()) {
            let snapshot = session.snapshot();
            emit(&StatusLine {
                kind: "status",
                snapshot: &snapshot,
            });
        }
        thread::sleep(poll_interval);
    }
}

fn emit<T: Serialize>(record: &T) {
    match serde_json::to_string(record) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "unserializable record"),
    }
}

fn summary(session: &Session, port: &str) -> Value {
    json!({
        "type": "summary",
        "motor": session.name(),
        "port": port,
    })
}

fn idle_summary(session: &Session, port: &str) -> Value {
    let mut value = summary(session, port);
    value["outcome"] = json!("idle");
    if let Ok(mm) = session.position() {
        value["position_mm"] = json!(mm);
    }
    value
}

fn interrupted_summary(session: &Session, port: &str) -> Value {
    let mut value = idle_summary(session, port);
    value["outcome"] = json!("interrupted");
    value
}

fn failure_summary(session: &Session, port: &str, e: &StretchError) -> Value {
    let mut value = summary(session, port);
    value["outcome"] = json!("failed");
    value["error"] = json!(e.to_string());
    value
}

fn run_summary(session: &Session, port: &str, result: Result<RunOutcome, StretchError>) -> Value {
    let mut value = match result {
        Ok(outcome) => {
            let mut value = summary(session, port);
            if let (Some(fields), Ok(Value::Object(outcome))) =
                (value.as_object_mut(), serde_json::to_value(outcome))
            {
                fields.extend(outcome);
            }
            value
        }
        Err(e) => failure_summary(session, port, &e),
    };
    value["moves_issued"] = json!(session.stats().moves_issued);
    value
}
