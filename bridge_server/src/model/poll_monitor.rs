//! Stall detection for sessions running inside the strategy tester.
//!
//! The tester advances a session only while the session polls for commands, so a tester session
//! that goes quiet usually means the run was stopped from the terminal. Each watched session has a
//! stall deadline:
//!
//! - the first engine event arms the session without a deadline;
//! - every poll of an armed session pushes its deadline to `now + timeout`;
//! - once the deadline passes, [`PollMonitor::expired`] reports a [`Stall`] and disarms the
//!   session, so a stall is reported once and a later event arms it again.
//!
//! A session that emitted an event but never polled has nothing to stall on and is not reported.
//! The monitor is not synchronized; the server keeps it behind a `Mutex`.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use mtbridge_common::SessionHandle;

/// A tester session whose deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall {
    /// Stalled session.
    pub handle: SessionHandle,
    /// Time since its last poll.
    pub silent_for: Duration,
}

#[derive(Default)]
struct Watch {
    last_poll: Option<Instant>,
}

/// Stall deadlines of armed tester sessions.
pub struct PollMonitor {
    armed: HashMap<SessionHandle, Watch>,
    timeout: Duration,
}

impl PollMonitor {
    /// Monitor that allows `timeout` between two polls of an armed session.
    pub fn new(timeout: Duration) -> Self {
        Self {
            armed: HashMap::new(),
            timeout,
        }
    }

    /// Arms `handle` after an event. An armed session keeps its deadline.
    pub fn arm(&mut self, handle: SessionHandle) {
        self.armed.entry(handle).or_default();
    }

    /// Records a poll; restarts the deadline of an armed session and ignores the others.
    pub fn update_poll(&mut self, handle: SessionHandle, now: Instant) {
        if let Some(watch) = self.armed.get_mut(&handle) {
            watch.last_poll = Some(now);
        }
    }

    /// Disarms `handle`.
    pub fn forget(&mut self, handle: SessionHandle) {
        self.armed.remove(&handle);
    }

    /// Armed sessions whose deadline passed at `now`, disarmed on the way out.
    pub fn expired(&mut self, now: Instant) -> Vec<Stall> {
        let stalls: Vec<Stall> = self
            .armed
            .iter()
            .filter_map(|(&handle, watch)| {
                let silent_for = now.saturating_duration_since(watch.last_poll?);
                (silent_for > self.timeout).then_some(Stall { handle, silent_for })
            })
            .collect();
        for stall in &stalls {
            self.armed.remove(&stall.handle);
        }
        stalls
    }

    /// Earliest pending deadline, if any session is counting down.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed
            .values()
            .filter_map(|watch| watch.last_poll)
            .min()
            .map(|last| last + self.timeout)
    }

    /// Whether `handle` is armed.
    pub fn is_armed(&self, handle: SessionHandle) -> bool {
        self.armed.contains_key(&handle)
    }
}
