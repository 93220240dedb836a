use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
}

/// Point-in-time view of a session's run, as read by pollers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RunStatus {
    pub state: RunState,
    pub cycles_completed: u32,
    pub cycles_total: u32,
    pub estimated_seconds_remaining: f64,
}

impl RunStatus {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}

/// Proof that the holder started the run currently on the board.
///
/// Any reset bumps the board epoch, after which writes carrying an older
/// ticket are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTicket {
    epoch: u64,
}

#[derive(Debug, Default)]
struct Board {
    status: RunStatus,
    epoch: u64,
}

/// Shared run status, written by the run worker and read by everyone else.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<Board>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Board> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> RunStatus {
        self.lock().status
    }

    /// Marks a new run as started with zero cycles completed, unless `stop`
    /// is already raised. The check happens under the board lock so a stop
    /// that resets the board can never be followed by a stale start.
    pub fn begin(&self, cycles_total: u32, seconds_remaining: f64, stop: &AtomicBool) -> Option<RunTicket> {
        let mut board = self.lock();
        if stop.load(Ordering::Acquire) {
            return None;
        }
        board.epoch = board.epoch.wrapping_add(1);
        board.status = RunStatus {
            state: RunState::Running,
            cycles_completed: 0,
            cycles_total,
            estimated_seconds_remaining: seconds_remaining,
        };
        Some(RunTicket { epoch: board.epoch })
    }

    /// Publishes progress for `ticket`'s run. Returns false if the run has
    /// been superseded by a reset, in which case nothing is written.
    pub fn publish_progress(
        &self,
        ticket: RunTicket,
        cycles_completed: u32,
        seconds_remaining: f64,
    ) -> bool {
        let mut board = self.lock();
        if board.epoch != ticket.epoch {
            return false;
        }
        board.status.cycles_completed = cycles_completed;
        board.status.estimated_seconds_remaining = seconds_remaining;
        true
    }

    pub fn is_current(&self, ticket: RunTicket) -> bool {
        self.lock().epoch == ticket.epoch
    }

    /// Ends `ticket`'s run. A no-op if someone already reset the board.
    pub fn finish(&self, ticket: RunTicket) {
        let mut board = self.lock();
        if board.epoch == ticket.epoch {
            board.epoch = board.epoch.wrapping_add(1);
            board.status.reset();
        }
    }

    /// Returns the board to idle and invalidates any outstanding ticket.
    pub fn reset(&self) {
        let mut board = self.lock();
        board.epoch = board.epoch.wrapping_add(1);
        board.status.reset();
    }
}
