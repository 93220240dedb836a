use crate::device::{AxisAddress, Connection, DeviceError, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Every command the simulated stage has received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCommand {
    Open(String),
    Discover,
    SetMaxSpeed(f64),
    Home,
    Stop,
    MoveAbsolute(f64),
    MoveRelative(f64),
    Close,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Devices answering discovery; zero simulates an empty chain.
    pub device_count: u8,
    pub home_position_mm: f64,
    /// Travel limits; targets outside are rejected like a real controller.
    pub limits_mm: Option<(f64, f64)>,
    /// How long each command takes to be accepted.
    pub accept_latency: Duration,
    /// How long the axis reports busy after accepting a move.
    pub move_time: Duration,
    /// Reject the Nth move command (1-based) with a device fault.
    pub fail_on_move: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            home_position_mm: 0.0,
            limits_mm: None,
            accept_latency: Duration::ZERO,
            move_time: Duration::ZERO,
            fail_on_move: None,
        }
    }
}

#[derive(Debug)]
struct Motion {
    from_mm: f64,
    started: Instant,
}

#[derive(Debug)]
struct StageState {
    open: bool,
    position_mm: f64,
    max_speed_mm_s: f64,
    motion: Option<Motion>,
    moves_seen: usize,
    journal: Vec<SimCommand>,
}

impl StageState {
    /// Where the carriage is right now, settling any finished motion.
    fn settle(&mut self, move_time: Duration) -> f64 {
        if let Some(motion) = &self.motion {
            let elapsed = motion.started.elapsed();
            if elapsed >= move_time {
                self.motion = None;
            } else {
                let frac = elapsed.as_secs_f64() / move_time.as_secs_f64();
                return motion.from_mm + (self.position_mm - motion.from_mm) * frac;
            }
        }
        self.position_mm
    }
}

/// In-process stand-in for a motion controller on a serial port.
///
/// Clones share state, so a test can keep one handle to inspect the journal
/// while a `DeviceLink` owns another as its transport.
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    config: Arc<SimConfig>,
    state: Arc<Mutex<StageState>>,
}

impl SimulatedStage {
    pub fn new(config: SimConfig) -> Self {
        let state = StageState {
            open: false,
            position_mm: config.home_position_mm,
            max_speed_mm_s: 0.0,
            motion: None,
            moves_seen: 0,
            journal: Vec::new(),
        };
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn journal(&self) -> Vec<SimCommand> {
        self.lock().journal.clone()
    }

    /// Targets of every absolute move, in issue order.
    pub fn absolute_moves(&self) -> Vec<f64> {
        self.lock()
            .journal
            .iter()
            .filter_map(|c| match c {
                SimCommand::MoveAbsolute(mm) => Some(*mm),
                _ => None,
            })
            .collect()
    }

    pub fn max_speed(&self) -> f64 {
        self.lock().max_speed_mm_s
    }

    /// Physically relocates the carriage, e.g. a hand-turned lead screw.
    pub fn place_at(&self, mm: f64) {
        let mut state = self.lock();
        state.position_mm = mm;
        state.motion = None;
    }

    fn record(&self, command: SimCommand) -> Result<MutexGuard<'_, StageState>, DeviceError> {
        if !self.config.accept_latency.is_zero() {
            thread::sleep(self.config.accept_latency);
        }
        let mut state = self.lock();
        state.journal.push(command);
        if !state.open {
            return Err(DeviceError::Closed);
        }
        Ok(state)
    }

    fn start_move(&self, target: AxisAddress, command: SimCommand, to_mm: f64) -> Result<(), DeviceError> {
        let move_time = self.config.move_time;
        let mut state = self.record(command.clone())?;
        state.moves_seen += 1;

        if self.config.fail_on_move == Some(state.moves_seen) {
            return Err(DeviceError::Rejected {
                target,
                command: format!("{:?}", command),
                reason: "simulated driver fault".to_string(),
            });
        }
        if let Some((lo, hi)) = self.config.limits_mm {
            if to_mm < lo || to_mm > hi {
                return Err(DeviceError::Rejected {
                    target,
                    command: format!("{:?}", command),
                    reason: format!("target {to_mm} mm outside {lo}..{hi} mm"),
                });
            }
        }

        let from_mm = state.settle(move_time);
        state.position_mm = to_mm;
        state.motion = (!move_time.is_zero()).then(|| Motion {
            from_mm,
            started: Instant::now(),
        });
        Ok(())
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl Transport for SimulatedStage {
    fn open(&self, port: &str) -> Result<Box<dyn Connection>, DeviceError> {
        if port.trim().is_empty() {
            return Err(DeviceError::Open {
                port: port.to_string(),
                reason: "empty port name".to_string(),
            });
        }
        let mut state = self.lock();
        state.journal.push(SimCommand::Open(port.to_string()));
        state.open = true;
        drop(state);
        Ok(Box::new(self.clone()))
    }
}

impl Connection for SimulatedStage {
    fn detect_devices(&self) -> Result<Vec<u8>, DeviceError> {
        let _state = self.record(SimCommand::Discover)?;
        Ok((1..=self.config.device_count).collect())
    }

    fn set_max_speed(&self, _target: AxisAddress, mm_per_s: f64) -> Result<(), DeviceError> {
        let mut state = self.record(SimCommand::SetMaxSpeed(mm_per_s))?;
        state.max_speed_mm_s = mm_per_s;
        Ok(())
    }

    fn home(&self, target: AxisAddress) -> Result<(), DeviceError> {
        let home = self.config.home_position_mm;
        let move_time = self.config.move_time;
        let mut state = self.record(SimCommand::Home)?;
        let from_mm = state.settle(move_time);
        state.position_mm = home;
        state.motion = (!move_time.is_zero()).then(|| Motion {
            from_mm,
            started: Instant::now(),
        });
        log::trace!("sim {} homing from {} mm", target, from_mm);
        Ok(())
    }

    fn stop(&self, _target: AxisAddress) -> Result<(), DeviceError> {
        let move_time = self.config.move_time;
        let mut state = self.record(SimCommand::Stop)?;
        let here = state.settle(move_time);
        state.position_mm = here;
        state.motion = None;
        Ok(())
    }

    fn move_absolute(&self, target: AxisAddress, mm: f64) -> Result<(), DeviceError> {
        self.start_move(target, SimCommand::MoveAbsolute(mm), mm)
    }

    fn move_relative(&self, target: AxisAddress, mm: f64) -> Result<(), DeviceError> {
        let to_mm = {
            let mut state = self.lock();
            state.settle(self.config.move_time) + mm
        };
        self.start_move(target, SimCommand::MoveRelative(mm), to_mm)
    }

    fn position(&self, _target: AxisAddress) -> Result<f64, DeviceError> {
        let mut state = self.lock();
        if !state.open {
            return Err(DeviceError::Closed);
        }
        Ok(state.settle(self.config.move_time))
    }

    fn is_busy(&self, _target: AxisAddress) -> Result<bool, DeviceError> {
        let mut state = self.lock();
        if !state.open {
            return Err(DeviceError::Closed);
        }
        state.settle(self.config.move_time);
        Ok(state.motion.is_some())
    }

    fn close(&self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.journal.push(SimCommand::Close);
        state.open = false;
        state.motion = None;
        Ok(())
    }
}

/// Hands out one independent simulated stage per port name.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBench {
    config: SimConfig,
    stages: Arc<Mutex<HashMap<String, SimulatedStage>>>,
}

impl SimulatedBench {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            stages: Arc::default(),
        }
    }

    /// The stage behind `port`, once something has opened it.
    pub fn stage(&self, port: &str) -> Option<SimulatedStage> {
        self.stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port)
            .cloned()
    }
}

impl Transport for SimulatedBench {
    fn open(&self, port: &str) -> Result<Box<dyn Connection>, DeviceError> {
        let stage = self
            .stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(port.to_string())
            .or_insert_with(|| SimulatedStage::new(self.config.clone()))
            .clone();
        stage.open(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AXIS: AxisAddress = AxisAddress::new(1, 1);

    #[test]
    fn reports_busy_for_move_time() {
        let stage = SimulatedStage::new(SimConfig {
            move_time: Duration::from_millis(50),
            ..SimConfig::default()
        });
        let conn = stage.open("MOCK1").unwrap();
        conn.move_absolute(AXIS, 10.0).unwrap();
        assert!(conn.is_busy(AXIS).unwrap());
        let mid = conn.position(AXIS).unwrap();
        assert!((0.0..=10.0).contains(&mid));

        thread::sleep(Duration::from_millis(80));
        assert!(!conn.is_busy(AXIS).unwrap());
        assert_eq!(conn.position(AXIS).unwrap(), 10.0);
    }

    #[test]
    fn discovery_is_journaled_and_needs_an_open_port() {
        let stage = SimulatedStage::new(SimConfig {
            device_count: 3,
            ..SimConfig::default()
        });
        let conn = stage.open("MOCK1").unwrap();
        assert_eq!(conn.detect_devices().unwrap(), vec![1, 2, 3]);
        assert_eq!(stage.journal().last(), Some(&SimCommand::Discover));

        conn.close().unwrap();
        assert_eq!(conn.detect_devices(), Err(DeviceError::Closed));
    }

    #[test]
    fn stop_freezes_carriage_mid_move() {
        let stage = SimulatedStage::new(SimConfig {
            move_time: Duration::from_secs(10),
            ..SimConfig::default()
        });
        let conn = stage.open("MOCK1").unwrap();
        conn.move_absolute(AXIS, 10.0).unwrap();
        conn.stop(AXIS).unwrap();

        assert!(!conn.is_busy(AXIS).unwrap());
        assert!(conn.position(AXIS).unwrap() < 10.0);
    }

    #[test]
    fn rejects_targets_outside_limits() {
        let stage = SimulatedStage::new(SimConfig {
            limits_mm: Some((0.0, 50.0)),
            ..SimConfig::default()
        });
        let conn = stage.open("MOCK1").unwrap();
        assert!(matches!(
            conn.move_absolute(AXIS, -1.0),
            Err(DeviceError::Rejected { .. })
        ));
        conn.move_absolute(AXIS, 49.0).unwrap();
    }

    #[test]
    fn injected_fault_hits_the_nth_move() {
        let stage = SimulatedStage::new(SimConfig {
            fail_on_move: Some(2),
            ..SimConfig::default()
        });
        let conn = stage.open("MOCK1").unwrap();
        conn.move_absolute(AXIS, 1.0).unwrap();
        assert!(conn.move_relative(AXIS, 1.0).is_err());
        conn.move_absolute(AXIS, 3.0).unwrap();
    }

    #[test]
    fn bench_keeps_ports_apart() {
        let bench = SimulatedBench::default();
        let a = bench.open("MOCK1").unwrap();
        let b = bench.open("MOCK2").unwrap();
        a.move_absolute(AXIS, 12.0).unwrap();

        assert_eq!(b.position(AXIS).unwrap(), 0.0);
        assert_eq!(bench.stage("MOCK1").unwrap().absolute_moves(), vec![12.0]);
        assert!(bench.stage("MOCK2").unwrap().absolute_moves().is_empty());
        assert!(bench.stage("MOCK3").is_none());
    }

    #[test]
    fn closed_connection_refuses_commands() {
        let stage = SimulatedStage::default();
        let conn = stage.open("MOCK1").unwrap();
        conn.close().unwrap();
        assert_eq!(conn.home(AXIS), Err(DeviceError::Closed));
        assert_eq!(conn.position(AXIS), Err(DeviceError::Closed));
    }
}
