//! Prometheus metrics for box stretcher sessions.
//!
//! Per-port gauges mirror each session's run status; counters accumulate
//! over the life of the process.

use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use stretch_core::{tags, RunState, RunStatus};
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn port_gauge(tag: tags::Tag) -> GaugeVec {
    let gauge = GaugeVec::new(Opts::new(tag.metric, tag.help), &["port"]).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
}

fn port_counter(name: &str, help: &str) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), &["port"]).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

// ============================================================================
// Run Status
// ============================================================================

pub static RUN_STATE: LazyLock<GaugeVec> = LazyLock::new(|| port_gauge(tags::RUN_STATE));

pub static CYCLES_COMPLETED: LazyLock<GaugeVec> =
    LazyLock::new(|| port_gauge(tags::CYCLES_COMPLETED));

pub static CYCLES_TOTAL: LazyLock<GaugeVec> = LazyLock::new(|| port_gauge(tags::CYCLES_TOTAL));

pub static SECONDS_REMAINING: LazyLock<GaugeVec> =
    LazyLock::new(|| port_gauge(tags::SECONDS_REMAINING));

pub static POSITION_MM: LazyLock<GaugeVec> = LazyLock::new(|| port_gauge(tags::POSITION_MM));

pub static CONNECTED: LazyLock<GaugeVec> = LazyLock::new(|| port_gauge(tags::CONNECTED));

/// Ports currently holding a device link
pub static PORTS_CONNECTED: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "boxstretch_ports_connected",
        "Number of ports with an open device link",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Execution Counters
// ============================================================================

pub static MOVES_ISSUED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    port_counter(
        "boxstretch_moves_issued_total",
        "Motion commands issued by protocol runs",
    )
});

pub static RUNS_STARTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    port_counter(
        "boxstretch_runs_started_total",
        "Protocol runs accepted for execution",
    )
});

pub static RUNS_COMPLETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    port_counter(
        "boxstretch_runs_completed_total",
        "Protocol runs that finished every cycle",
    )
});

pub static RUNS_STOPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    port_counter(
        "boxstretch_runs_stopped_total",
        "Protocol runs ended early by a stop request",
    )
});

pub static RUNS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    port_counter(
        "boxstretch_runs_failed_total",
        "Protocol runs aborted by a device error",
    )
});

/// Mirrors one session's status into the per-port gauges.
pub fn publish_status(port: &str, connected: bool, status: &RunStatus, position_mm: Option<f64>) {
    let state = match status.state {
        RunState::Idle => 0.0,
        RunState::Running => 1.0,
    };
    RUN_STATE.with_label_values(&[port]).set(state);
    CYCLES_COMPLETED
        .with_label_values(&[port])
        .set(status.cycles_completed as f64);
    CYCLES_TOTAL
        .with_label_values(&[port])
        .set(status.cycles_total as f64);
    SECONDS_REMAINING
        .with_label_values(&[port])
        .set(status.estimated_seconds_remaining);
    CONNECTED
        .with_label_values(&[port])
        .set(if connected { 1.0 } else { 0.0 });
    if let Some(mm) = position_mm {
        POSITION_MM.with_label_values(&[port]).set(mm);
    }
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => match encode() {
                    Ok(buffer) => Response::from_data(buffer).with_header(
                        tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        )
                        .unwrap(),
                    ),
                    Err(e) => {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        Response::from_string("Internal Server Error").with_status_code(500)
                    }
                },
                "/health" => Response::from_string("OK"),
                "/ready" => {
                    if PORTS_CONNECTED.get() > 0 {
                        Response::from_string("Ready")
                    } else {
                        Response::from_string("Not Ready").with_status_code(503)
                    }
                }
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

/// Text exposition of everything in [`REGISTRY`].
pub fn encode() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    LazyLock::force(&RUN_STATE);
    LazyLock::force(&CYCLES_COMPLETED);
    LazyLock::force(&CYCLES_TOTAL);
    LazyLock::force(&SECONDS_REMAINING);
    LazyLock::force(&POSITION_MM);
    LazyLock::force(&CONNECTED);
    LazyLock::force(&PORTS_CONNECTED);
    LazyLock::force(&MOVES_ISSUED);
    LazyLock::force(&RUNS_STARTED);
    LazyLock::force(&RUNS_COMPLETED);
    LazyLock::force(&RUNS_STOPPED);
    LazyLock::force(&RUNS_FAILED);
}
