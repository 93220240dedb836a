use std::path::PathBuf;
use std::time::Duration;
use stretch_core::protocol::{
    DEFAULT_CYCLES, DEFAULT_L0_MM, DEFAULT_STRAIN_PCT, DEFAULT_STRAIN_RATE_PCT_S,
};
use stretch_core::DEFAULT_SPEED_MM_S;
use stretch_io::ascii::DEFAULT_MICROSTEP_MM;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{0} needs a value")]
    MissingValue(String),
    #[error("invalid value {value:?} for {flag}")]
    InvalidValue { flag: String, value: String },
    #[error("unknown option {0}")]
    UnknownFlag(String),
    #[error("at least one --port is required")]
    NoPorts,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub ports: Vec<String>,
    pub simulate: bool,
    pub sim_move_time: Duration,
    pub home: bool,
    pub move_to_mm: Option<f64>,
    pub move_by_mm: Option<f64>,
    pub speed_mm_s: f64,
    pub run_protocol: bool,
    /// Protocol fields stay as typed; they are parsed when a run starts.
    pub l0_mm: String,
    pub strain_pct: String,
    pub strain_rate_pct_s: String,
    pub cycles: String,
    pub poll_interval: Duration,
    pub wait_for_idle: bool,
    pub baud_rate: u32,
    pub microstep_mm: f64,
    pub reply_timeout: Duration,
    pub json_logs: bool,
    pub log_file: Option<PathBuf>,
    pub metrics_addr: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            ports: Vec::new(),
            simulate: false,
            sim_move_time: Duration::ZERO,
            home: false,
            move_to_mm: None,
            move_by_mm: None,
            speed_mm_s: DEFAULT_SPEED_MM_S,
            run_protocol: false,
            l0_mm: DEFAULT_L0_MM.to_string(),
            strain_pct: DEFAULT_STRAIN_PCT.to_string(),
            strain_rate_pct_s: DEFAULT_STRAIN_RATE_PCT_S.to_string(),
            cycles: DEFAULT_CYCLES.to_string(),
            poll_interval: Duration::from_millis(250),
            wait_for_idle: true,
            baud_rate: 115_200,
            microstep_mm: DEFAULT_MICROSTEP_MM,
            reply_timeout: Duration::from_millis(1000),
            json_logs: false,
            log_file: None,
            metrics_addr: None,
        }
    }
}

fn value<'a>(args: &'a [String], i: usize) -> Result<&'a str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue(args[i].clone()))
}

fn number<T: std::str::FromStr>(args: &[String], i: usize) -> Result<T, ConfigError> {
    let raw = value(args, i)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag: args[i].clone(),
        value: raw.to_string(),
    })
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--port" => {
                    cfg.ports.push(value(args, i)?.to_string());
                    i += 1;
                }
                "--sim" => {
                    cfg.simulate = true;
                }
                "--sim-move-ms" => {
                    cfg.sim_move_time = Duration::from_millis(number(args, i)?);
                    i += 1;
                }
                "--home" => {
                    cfg.home = true;
                }
                "--move-to" => {
                    cfg.move_to_mm = Some(number(args, i)?);
                    i += 1;
                }
                "--move-by" => {
                    cfg.move_by_mm = Some(number(args, i)?);
                    i += 1;
                }
                "--speed" => {
                    cfg.speed_mm_s = number(args, i)?;
                    i += 1;
                }
                "--run" => {
                    cfg.run_protocol = true;
                }
                "--l0" => {
                    cfg.l0_mm = value(args, i)?.to_string();
                    i += 1;
                }
                "--strain" => {
                    cfg.strain_pct = value(args, i)?.to_string();
                    i += 1;
                }
                "--strain-rate" => {
                    cfg.strain_rate_pct_s = value(args, i)?.to_string();
                    i += 1;
                }
                "--cycles" => {
                    cfg.cycles = value(args, i)?.to_string();
                    i += 1;
                }
                "--poll-ms" => {
                    cfg.poll_interval = Duration::from_millis(number(args, i)?);
                    i += 1;
                }
                "--no-wait-idle" => {
                    cfg.wait_for_idle = false;
                }
                "--baud" => {
                    cfg.baud_rate = number(args, i)?;
                    i += 1;
                }
                "--microstep-um" => {
                    let um: f64 = number(args, i)?;
                    cfg.microstep_mm = um / 1000.0;
                    i += 1;
                }
                "--reply-timeout-ms" => {
                    cfg.reply_timeout = Duration::from_millis(number(args, i)?);
                    i += 1;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-file" => {
                    cfg.log_file = Some(PathBuf::from(value(args, i)?));
                    i += 1;
                }
                "--metrics-addr" => {
                    cfg.metrics_addr = Some(value(args, i)?.to_string());
                    i += 1;
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    return Ok(cfg);
                }
                other => return Err(ConfigError::UnknownFlag(other.to_string())),
            }
            i += 1;
        }

        if cfg.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        Ok(cfg)
    }

    pub fn print_help() {
        println!(
            r#"box-stretcher - Cyclic tension/compression runs on linear stages

USAGE:
    box-stretcher --port <NAME> [--port <NAME> ...] [OPTIONS]

Each --port gets its own motor session ("Motor 1", "Motor 2", ...). Actions
run in order: connect, home, move, then the cyclic protocol.

OPTIONS:
    --port <NAME>            Serial port of a stage (repeatable), e.g. COM7 or /dev/ttyUSB0
    --sim                    Use simulated stages instead of serial ports
    --sim-move-ms <MS>       Simulated time per move [default: 0]
    --home                   Home the stage after connecting
    --move-to <MM>           Absolute move after connecting
    --move-by <MM>           Relative move after connecting
    --speed <MM/S>           Speed for --move-to/--move-by [default: 10]
    --run                    Run the cyclic protocol
    --l0 <MM>                Initial sample length [default: 28.5]
    --strain <PCT>           Strain amplitude in percent [default: 18]
    --strain-rate <PCT/S>    Strain rate in percent per second [default: 5]
    --cycles <N>             Number of cycles [default: 1000]
    --poll-ms <MS>           Status line interval while running [default: 250]
    --no-wait-idle           Issue moves back to back without waiting for idle
    --baud <RATE>            Serial baud rate [default: 115200]
    --microstep-um <UM>      Stage microstep size in micrometres [default: 0.047625]
    --reply-timeout-ms <MS>  Per-command reply timeout [default: 1000]
    --json-logs              Output logs in JSON format
    --log-file <PATH>        Also append JSON logs to a file
    --metrics-addr <ADDR>    Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    -h, --help               Print this help message

OUTPUT:
    Status and summary records go to stdout as JSON lines; logs go to stderr.
    The exit status is non-zero if any session failed.
    Ctrl-C stops every motor; actions not yet started are skipped and
    reported with outcome "interrupted".

ENVIRONMENT VARIABLES:
    RUST_LOG                 Set log filter (e.g., RUST_LOG=debug,stretch_io=trace)

EXAMPLES:
    # Home, then run the default protocol on one stage
    box-stretcher --port COM7 --home --run

    # Two simulated stages, short run
    box-stretcher --sim --port A --port B --run --cycles 5
"#
        );
    }
}
