//! Liveness monitor: per-run inactivity state machine.
//!
//! Tracks when the last byte arrived from a running check. The timeout is a
//! per-silence interval, not a wall-clock budget: every non-empty read
//! resets it, so a check that keeps printing never times out.
//!
//! ## State machine
//!
//! ```text
//! RUNNING          → bytes arrive              → OUTPUT_RECEIVED
//! OUTPUT_RECEIVED  → bytes arrive              → OUTPUT_RECEIVED (clock reset)
//! RUNNING / OUTPUT → silence ≥ threshold       → TIMED_OUT  (terminal)
//! RUNNING / OUTPUT → process exits             → EXITED     (terminal)
//! ```
//!
//! The monitor is clock-agnostic: callers pass `Instant`s in, which keeps
//! the timing rules testable without sleeping.

use std::time::{Duration, Instant};

/// Monitor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Started, no output seen yet.
    Running,
    /// At least one chunk received; silence clock last reset at `at`.
    OutputReceived { at: Instant },
    /// No output for the full threshold. The child must be killed.
    TimedOut { silent_for: Duration },
    /// The process exited before the threshold.
    Exited,
}

impl MonitorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MonitorState::TimedOut { .. } | MonitorState::Exited)
    }
}

/// Inactivity tracker for one check run.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    threshold: Duration,
    state: MonitorState,
    last_activity: Instant,
    bytes_seen: usize,
}

impl LivenessMonitor {
    pub fn new(threshold: Duration, started_at: Instant) -> Self {
        Self {
            threshold,
            state: MonitorState::Running,
            last_activity: started_at,
            bytes_seen: 0,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn bytes_seen(&self) -> usize {
        self.bytes_seen
    }

    /// Record a read of `len` bytes at `now`. Empty reads do not reset the clock.
    pub fn on_output(&mut self, len: usize, now: Instant) {
        if len == 0 || self.state.is_terminal() {
            return;
        }
        self.bytes_seen += len;
        self.last_activity = now;
        self.state = MonitorState::OutputReceived { at: now };
    }

    /// Record that the check process has exited.
    pub fn on_exit(&mut self) {
        if !self.state.is_terminal() {
            self.state = MonitorState::Exited;
        }
    }

    /// Evaluate the silence clock at `now`, transitioning to `TimedOut` when
    /// the threshold has been reached.
    pub fn tick(&mut self, now: Instant) -> MonitorState {
        if self.state.is_terminal() {
            return self.state;
        }
        let silent_for = now.saturating_duration_since(self.last_activity);
        if silent_for >= self.threshold {
            self.state = MonitorState::TimedOut { silent_for };
        }
        self.state
    }

    /// Time left before the silence threshold is reached.
    ///
    /// Used as the bound for a timed wait on the output channel.
    pub fn remaining(&self, now: Instant) -> Duration {
        let silent_for = now.saturating_duration_since(self.last_activity);
        self.threshold.saturating_sub(silent_for)
    }
}
