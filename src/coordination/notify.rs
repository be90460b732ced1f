//! State-change notifications for presentation layers

use super::status::{CoordinatorStatus, Indicator, OwnStatus, RelayedStatus};
use crate::channel::ConnectivityState;
use crate::deadline::DeadlineTracker;
use crate::events::ParticipantId;

use serde::Serialize;
use tokio::sync::broadcast;

/// Which status view a change belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "view", content = "id", rename_all = "snake_case")]
pub enum Entity {
    Coordinator,
    /// Participant as seen on its own channel
    Participant(ParticipantId),
    /// Participant as relayed through the coordinator
    Relayed(ParticipantId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    Global,
    Ping,
    Work,
    Relayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerChange {
    Started,
    Stopped,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateChange {
    CoordinatorStatus {
        status: CoordinatorStatus,
    },
    ParticipantRegistered {
        id: ParticipantId,
        name: String,
        endpoint: Option<String>,
    },
    OwnStatus {
        id: ParticipantId,
        status: OwnStatus,
    },
    RelayedStatus {
        id: ParticipantId,
        status: RelayedStatus,
    },
    Pulse {
        entity: Entity,
        indicator: Indicator,
    },
    Connectivity {
        channel: String,
        state: ConnectivityState,
    },
    Tracker {
        entity: Entity,
        tracker: TrackerKind,
        change: TrackerChange,
        value: u64,
        max: u64,
    },
}

/// Broadcast publisher; publishing without subscribers is fine
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<StateChange>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }

    pub fn emit(&self, change: StateChange) {
        if self.tx.send(change).is_err() {
            // No subscribers, that's okay
        }
    }

    pub(crate) fn tracker(
        &self,
        entity: Entity,
        tracker: TrackerKind,
        change: TrackerChange,
        state: &DeadlineTracker,
    ) {
        self.emit(StateChange::Tracker {
            entity,
            tracker,
            change,
            value: state.value(),
            max: state.max(),
        });
    }
}
