//! One observed transaction, from the coordinator's `init` onwards

use super::registry::ParticipantRegistry;
use crate::deadline::DeadlineTracker;

use chrono::{DateTime, Utc};

#[derive(Debug)]
pub struct TransactionSession {
    /// Emitter time of the `init` that opened the session
    pub started_at: DateTime<Utc>,
    pub global_deadline: DeadlineTracker,
    pub participants: ParticipantRegistry,
}

impl TransactionSession {
    /// Open a session with its global deadline already running
    pub fn start(started_at: DateTime<Utc>, timeout: u64, step: u64) -> Self {
        let mut global_deadline = DeadlineTracker::new(timeout, step);
        global_deadline.start();
        Self {
            started_at,
            global_deadline,
            participants: ParticipantRegistry::new(),
        }
    }

    /// Restart the global deadline with a new timeout
    pub fn rearm(&mut self, timeout: u64) {
        self.global_deadline.set_max(timeout);
        self.global_deadline.reset(0);
        self.global_deadline.start();
    }

    pub fn tick(&mut self) {
        self.global_deadline.tick();
        for participant in self.participants.iter_mut() {
            participant.tick();
        }
    }
}
