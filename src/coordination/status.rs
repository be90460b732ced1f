//! Status values and liveness indicators of the coordinator and participants

use crate::events::OutcomeKind;

use serde::Serialize;

/// Global transaction status as seen on the coordinator's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorStatus {
    #[default]
    Default,
    InProgress,
    ReadyCommit,
    Fail,
    Commit,
    Rollback,
    Finish,
}

/// A participant's status from its own channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnStatus {
    #[default]
    Default,
    Init,
    WaitPing,
    Ping,
    ReadyCommit,
    Fail,
    Commit,
    Done,
    Finish,
    Rollback,
}

impl OwnStatus {
    /// Still in the ping/work phase, before any vote or outcome
    pub fn is_pre_vote(&self) -> bool {
        matches!(
            self,
            OwnStatus::Default | OwnStatus::Init | OwnStatus::WaitPing | OwnStatus::Ping
        )
    }
}

impl From<OutcomeKind> for OwnStatus {
    fn from(outcome: OutcomeKind) -> Self {
        match outcome {
            OutcomeKind::ReadyCommit => OwnStatus::ReadyCommit,
            OutcomeKind::Fail => OwnStatus::Fail,
            OutcomeKind::Commit => OwnStatus::Commit,
            OutcomeKind::Done => OwnStatus::Done,
            OutcomeKind::Finish => OwnStatus::Finish,
            OutcomeKind::Rollback => OwnStatus::Rollback,
        }
    }
}

/// A participant's status as relayed through the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayedStatus {
    #[default]
    Default,
    ReadyCommit,
    Fail,
    Commit,
    Done,
    Rollback,
}

impl From<OutcomeKind> for RelayedStatus {
    fn from(outcome: OutcomeKind) -> Self {
        match outcome {
            OutcomeKind::ReadyCommit => RelayedStatus::ReadyCommit,
            OutcomeKind::Fail => RelayedStatus::Fail,
            OutcomeKind::Commit => RelayedStatus::Commit,
            OutcomeKind::Done => RelayedStatus::Done,
            OutcomeKind::Rollback => RelayedStatus::Rollback,
            // Never relayed by the coordinator
            OutcomeKind::Finish => RelayedStatus::Default,
        }
    }
}

/// Liveness indicators, independent of status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    Heartbeat,
    Activity,
    Alert,
}

/// Pulse counters of one view's indicators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Indicators {
    pub heartbeat: u64,
    pub activity: u64,
    pub alert: u64,
}

impl Indicators {
    pub fn pulse(&mut self, indicator: Indicator) {
        match indicator {
            Indicator::Heartbeat => self.heartbeat += 1,
            Indicator::Activity => self.activity += 1,
            Indicator::Alert => self.alert += 1,
        }
    }
}
