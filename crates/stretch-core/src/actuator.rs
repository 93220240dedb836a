use crate::error::StretchError;
use crate::link::DeviceLink;
use crate::protocol::{MotionPlan, Protocol, Validated};
use crate::status::{RunTicket, StatusBoard};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ActuatorConfig {
    /// Poll `is_busy` after every accepted move and only issue the next one
    /// once the axis is idle. Controllers that replace an in-flight move
    /// instead of queueing it need this to complete each traversal.
    pub wait_for_idle: bool,
    pub idle_poll: Duration,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            wait_for_idle: true,
            idle_poll: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { cycles: u32 },
    Stopped { cycles_completed: u32 },
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub moves_issued: u64,
    pub runs_completed: u64,
    pub runs_stopped: u64,
    pub runs_failed: u64,
}

impl ExecutionStats {
    pub fn absorb(&mut self, other: &ExecutionStats) {
        self.moves_issued += other.moves_issued;
        self.runs_completed += other.runs_completed;
        self.runs_stopped += other.runs_stopped;
        self.runs_failed += other.runs_failed;
    }
}

/// Drives the stage back and forth between two endpoints for a protocol's
/// cycle count.
///
/// The endpoints are the carriage position at run start and that position
/// minus the protocol's travel distance. L0 sizes the travel but is never
/// used as an absolute target.
pub struct CyclicActuator {
    config: ActuatorConfig,
    stats: ExecutionStats,
}

impl CyclicActuator {
    pub fn new(config: ActuatorConfig) -> Self {
        Self {
            config,
            stats: ExecutionStats::default(),
        }
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Executes `protocol` on `link`, publishing progress to `board`.
    ///
    /// Blocks until the run completes, fails, or `stop` is raised. `stop` is
    /// checked between moves, never during one. A stopped run that issued
    /// moves halts the stage once more before returning. The board is back
    /// at idle when this returns, whichever way the run ended.
    pub fn run(
        &mut self,
        protocol: &Protocol<Validated>,
        link: &DeviceLink,
        board: &StatusBoard,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, StretchError> {
        if !link.connected() {
            return Err(StretchError::NotConnected);
        }

        let plan = protocol.motion_plan();
        if plan.cycles == 0 {
            info!("protocol has zero cycles, nothing to do");
            self.stats.runs_completed += 1;
            return Ok(RunOutcome::Completed { cycles: 0 });
        }

        let result = self.drive(&plan, link, board, stop);
        match &result {
            Ok(RunOutcome::Completed { cycles }) => {
                self.stats.runs_completed += 1;
                info!("run complete after {} cycles", cycles);
            }
            Ok(RunOutcome::Stopped { cycles_completed }) => {
                self.stats.runs_stopped += 1;
                info!("run stopped after {} cycles", cycles_completed);
            }
            Err(e) => {
                self.stats.runs_failed += 1;
                warn!("run aborted: {}", e);
            }
        }
        result
    }

    fn drive(
        &mut self,
        plan: &MotionPlan,
        link: &DeviceLink,
        board: &StatusBoard,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, StretchError> {
        link.set_max_speed(plan.speed_mm_s)?;
        let starting_mm = link.position()?;
        let final_mm = starting_mm - plan.travel_mm;

        info!(
            "cycling {} times between {:.3} and {:.3} mm at {:.3} mm/s",
            plan.cycles, starting_mm, final_mm, plan.speed_mm_s
        );

        let Some(ticket) = board.begin(plan.cycles, plan.seconds_remaining(0), stop) else {
            return Ok(RunOutcome::Stopped {
                cycles_completed: 0,
            });
        };
        let issued_before = self.stats.moves_issued;
        let result = self.oscillate(plan, starting_mm, final_mm, link, board, ticket, stop);
        if matches!(result, Ok(RunOutcome::Stopped { .. }))
            && self.stats.moves_issued > issued_before
        {
            // The last move may have reached the stage after the stop did.
            if let Err(e) = link.stop() {
                warn!("halt after stopped run failed: {}", e);
            }
        }
        board.finish(ticket);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn oscillate(
        &mut self,
        plan: &MotionPlan,
        starting_mm: f64,
        final_mm: f64,
        link: &DeviceLink,
        board: &StatusBoard,
        ticket: RunTicket,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, StretchError> {
        for completed in 0..plan.cycles {
            for target_mm in [final_mm, starting_mm] {
                if halted(stop, board, ticket) {
                    return Ok(RunOutcome::Stopped {
                        cycles_completed: completed,
                    });
                }
                link.move_absolute_at_current_speed(target_mm)?;
                self.stats.moves_issued += 1;

                if self.config.wait_for_idle && !self.wait_idle(link, board, ticket, stop)? {
                    return Ok(RunOutcome::Stopped {
                        cycles_completed: completed,
                    });
                }
            }

            let done = completed + 1;
            board.publish_progress(ticket, done, plan.seconds_remaining(done));
            debug!("cycle {}/{} done", done, plan.cycles);
        }

        Ok(RunOutcome::Completed {
            cycles: plan.cycles,
        })
    }

    /// Returns false if a stop arrived while waiting.
    fn wait_idle(
        &self,
        link: &DeviceLink,
        board: &StatusBoard,
        ticket: RunTicket,
        stop: &AtomicBool,
    ) -> Result<bool, StretchError> {
        loop {
            if halted(stop, board, ticket) {
                return Ok(false);
            }
            if !link.is_busy()? {
                return Ok(true);
            }
            thread::sleep(self.config.idle_poll);
        }
    }
}

fn halted(stop: &AtomicBool, board: &StatusBoard, ticket: RunTicket) -> bool {
    stop.load(Ordering::Acquire) || !board.is_current(ticket)
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::sim::{SimCommand, SimConfig, SimulatedStage};
    use crate::status::{RunState, RunStatus};
    use std::sync::Arc;
    use std::time::Instant;

    const TRAVEL: f64 = 5.13;

    fn connected(config: SimConfig) -> (Arc<DeviceLink>, SimulatedStage) {
        let stage = SimulatedStage::new(config);
        let link = Arc::new(DeviceLink::new(Arc::new(stage.clone())));
        link.connect("MOCK1").unwrap();
        (link, stage)
    }

    fn protocol(cycles: u32) -> Protocol<Validated> {
        Protocol::new(28.5, 18.0, 5.0, cycles).validate().unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    /// True when the stage was told to stop after its last move.
    fn halted_after_last_move(journal: &[SimCommand]) -> bool {
        let last_move = journal
            .iter()
            .rposition(|c| matches!(c, SimCommand::MoveAbsolute(_)));
        let last_stop = journal.iter().rposition(|c| *c == SimCommand::Stop);
        match (last_move, last_stop) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(m), Some(s)) => s > m,
        }
    }

    #[test]
    fn three_cycles_issue_six_alternating_moves() {
        let (link, stage) = connected(SimConfig::default());
        link.home().unwrap();
        let board = StatusBoard::new();
        let stop = AtomicBool::new(false);
        let mut actuator = CyclicActuator::new(ActuatorConfig::default());

        let outcome = actuator.run(&protocol(3), &link, &board, &stop).unwrap();

        assert_eq!(outcome, RunOutcome::Completed { cycles: 3 });
        let moves = stage.absolute_moves();
        assert_eq!(moves.len(), 6);
        for (i, target) in moves.iter().enumerate() {
            let expected = if i % 2 == 0 { -TRAVEL } else { 0.0 };
            assert!(close(*target, expected), "move {} went to {}", i, target);
        }
        assert!(close(stage.max_speed(), 1.425));
        assert_eq!(board.snapshot(), RunStatus::default());
        assert_eq!(actuator.stats().moves_issued, 6);
        assert_eq!(actuator.stats().runs_completed, 1);
    }

    #[test]
    fn oscillates_about_position_at_run_start_not_l0() {
        let (link, stage) = connected(SimConfig::default());
        stage.place_at(40.0);
        let board = StatusBoard::new();
        let mut actuator = CyclicActuator::new(ActuatorConfig::default());

        actuator
            .run(&protocol(1), &link, &board, &AtomicBool::new(false))
            .unwrap();

        let moves = stage.absolute_moves();
        assert!(close(moves[0], 40.0 - TRAVEL));
        assert!(close(moves[1], 40.0));
    }

    #[test]
    fn zero_cycles_issue_no_moves() {
        let (link, stage) = connected(SimConfig::default());
        let before = stage.journal().len();
        let board = StatusBoard::new();
        let mut actuator = CyclicActuator::new(ActuatorConfig::default());

        let outcome = actuator
            .run(&protocol(0), &link, &board, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { cycles: 0 });
        assert_eq!(stage.journal().len(), before);
        assert_eq!(board.snapshot().state, RunState::Idle);
    }

    #[test]
    fn disconnected_run_leaves_status_alone() {
        let stage = SimulatedStage::default();
        let link = DeviceLink::new(Arc::new(stage.clone()));
        let board = StatusBoard::new();
        let mut actuator = CyclicActuator::new(ActuatorConfig::default());

        let err = actuator
            .run(&protocol(3), &link, &board, &AtomicBool::new(false))
            .unwrap_err();

        assert_eq!(err, StretchError::NotConnected);
        assert_eq!(board.snapshot(), RunStatus::default());
        assert!(stage.journal().is_empty());
    }

    #[test]
    fn device_fault_aborts_and_resets_status() {
        let (link, stage) = connected(SimConfig {
            fail_on_move: Some(3),
            ..SimConfig::default()
        });
        let board = StatusBoard::new();
        let mut actuator = CyclicActuator::new(ActuatorConfig::default());

        let err = actuator
            .run(&protocol(10), &link, &board, &AtomicBool::new(false))
            .unwrap_err();

        assert!(matches!(err, StretchError::DeviceCommand(_)));
        assert_eq!(stage.absolute_moves().len(), 3);
        assert_eq!(board.snapshot(), RunStatus::default());
        assert_eq!(actuator.stats().runs_failed, 1);
        assert_eq!(actuator.stats().moves_issued, 2);
    }

    #[test]
    fn stop_flag_ends_run_between_moves() {
        let (link, stage) = connected(SimConfig {
            accept_latency: Duration::from_millis(2),
            ..SimConfig::default()
        });
        let board = Arc::new(StatusBoard::new());
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let (link, board, stop) = (Arc::clone(&link), Arc::clone(&board), Arc::clone(&stop));
            thread::spawn(move || {
                let mut actuator = CyclicActuator::new(ActuatorConfig::default());
                actuator.run(&protocol(10_000), &link, &board, &stop)
            })
        };

        let started = Instant::now();
        while !board.snapshot().is_running() && started.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);

        let outcome = worker.join().unwrap().unwrap();
        let RunOutcome::Stopped { cycles_completed } = outcome else {
            panic!("expected a stopped run, got {:?}", outcome);
        };
        assert!(cycles_completed < 10_000);
        assert_eq!(board.snapshot().state, RunState::Idle);
        assert!(stage.absolute_moves().len() < 20_000);
        assert!(halted_after_last_move(&stage.journal()));
    }

    #[test]
    fn board_reset_alone_ends_the_run() {
        let (link, stage) = connected(SimConfig {
            accept_latency: Duration::from_millis(2),
            ..SimConfig::default()
        });
        let board = Arc::new(StatusBoard::new());

        let worker = {
            let (link, board) = (Arc::clone(&link), Arc::clone(&board));
            thread::spawn(move || {
                let mut actuator = CyclicActuator::new(ActuatorConfig::default());
                actuator.run(&protocol(10_000), &link, &board, &AtomicBool::new(false))
            })
        };

        let started = Instant::now();
        while !board.snapshot().is_running() && started.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        board.reset();

        let outcome = worker.join().unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Stopped { .. }));
        assert!(!board.snapshot().is_running());
        assert!(halted_after_last_move(&stage.journal()));
    }

    #[test]
    fn move_racing_a_hardware_stop_is_halted_again() {
        let (link, stage) = connected(SimConfig {
            move_time: Duration::from_millis(50),
            ..SimConfig::default()
        });
        let board = StatusBoard::new();
        let stop = AtomicBool::new(false);
        let mut actuator = CyclicActuator::new(ActuatorConfig {
            wait_for_idle: true,
            idle_poll: Duration::from_millis(1),
        });

        // The hardware stop idles the stage, the worker issues its next move,
        // and only then does the stop flag go up.
        thread::scope(|scope| {
            scope.spawn(|| {
                while stage.absolute_moves().is_empty() {
                    thread::sleep(Duration::from_millis(1));
                }
                link.stop().unwrap();
                while stage.absolute_moves().len() < 2 {
                    thread::sleep(Duration::from_millis(1));
                }
                stop.store(true, Ordering::Release);
            });
            let outcome = actuator.run(&protocol(100), &link, &board, &stop).unwrap();
            assert!(matches!(outcome, RunOutcome::Stopped { .. }));
        });

        let journal = stage.journal();
        assert!(halted_after_last_move(&journal));
        assert_eq!(journal.last(), Some(&SimCommand::Stop));
        assert!(!link.is_busy().unwrap());
    }

    #[test]
    fn completed_run_sends_no_stop() {
        let (link, stage) = connected(SimConfig::default());
        let mut actuator = CyclicActuator::new(ActuatorConfig::default());
        actuator
            .run(&protocol(2), &link, &StatusBoard::new(), &AtomicBool::new(false))
            .unwrap();
        assert!(!stage.journal().contains(&SimCommand::Stop));
    }

    #[test]
    fn waits_for_idle_between_moves() {
        let (link, stage) = connected(SimConfig {
            move_time: Duration::from_millis(15),
            ..SimConfig::default()
        });
        let board = StatusBoard::new();
        let mut actuator = CyclicActuator::new(ActuatorConfig {
            wait_for_idle: true,
            idle_poll: Duration::from_millis(2),
        });

        let started = Instant::now();
        actuator
            .run(&protocol(2), &link, &board, &AtomicBool::new(false))
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(stage.absolute_moves().len(), 4);
        assert!(close(link.position().unwrap(), 0.0));
    }
}
