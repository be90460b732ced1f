//! Dual-view participant state machine
//!
//! Each participant is observed twice: first-hand on its own channel and
//! second-hand through the coordinator's relayed `*_child` events. The two
//! views never write to each other.

use super::notify::{Entity, Notifier, StateChange, TrackerChange, TrackerKind};
use super::status::{Indicator, Indicators, OwnStatus, RelayedStatus};
use crate::channel::{ChannelId, ConnectivityState};
use crate::deadline::{DeadlineTracker, TrackerSnapshot};
use crate::events::{
    ActionSpec, EventEnvelope, OutcomeKind, ParticipantEvent, ParticipantId, ParticipantInit,
};

use serde::Serialize;
use tracing::{debug, info, warn};

/// First-hand view fed by the participant's own channel
#[derive(Debug)]
struct OwnView {
    status: OwnStatus,
    /// Created by the participant's own `init`
    ping: Option<DeadlineTracker>,
    work: Option<DeadlineTracker>,
    indicators: Indicators,
    connectivity: ConnectivityState,
}

/// Second-hand view fed by the coordinator
#[derive(Debug)]
struct RelayedView {
    status: RelayedStatus,
    deadline: DeadlineTracker,
    indicators: Indicators,
}

#[derive(Debug)]
pub struct ParticipantStateMachine {
    id: ParticipantId,
    name: String,
    service_url: String,
    /// Own event endpoint, absent when it could not be derived
    endpoint: Option<String>,
    step: u64,
    own: OwnView,
    relayed: RelayedView,
    notifier: Notifier,
}

impl ParticipantStateMachine {
    /// Register from a coordinator action; the relayed deadline starts right away
    pub fn new(
        action: &ActionSpec,
        name: impl Into<String>,
        endpoint: Option<String>,
        step: u64,
        notifier: Notifier,
    ) -> Self {
        let mut participant = Self {
            id: action.id.clone(),
            name: name.into(),
            service_url: action.service.url.clone(),
            endpoint,
            step,
            own: OwnView {
                status: OwnStatus::Default,
                ping: None,
                work: None,
                indicators: Indicators::default(),
                connectivity: ConnectivityState::Disconnected,
            },
            relayed: RelayedView {
                status: RelayedStatus::Default,
                deadline: DeadlineTracker::new(action.service.timeout, step),
                indicators: Indicators::default(),
            },
            notifier,
        };

        participant.relayed.deadline.start();
        participant.notifier.tracker(
            Entity::Relayed(participant.id.clone()),
            TrackerKind::Relayed,
            TrackerChange::Started,
            &participant.relayed.deadline,
        );
        participant
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn own_status(&self) -> OwnStatus {
        self.own.status
    }

    pub fn relayed_status(&self) -> RelayedStatus {
        self.relayed.status
    }

    pub fn ping_tracker(&self) -> Option<&DeadlineTracker> {
        self.own.ping.as_ref()
    }

    pub fn work_tracker(&self) -> Option<&DeadlineTracker> {
        self.own.work.as_ref()
    }

    pub fn relayed_tracker(&self) -> &DeadlineTracker {
        &self.relayed.deadline
    }

    pub fn own_indicators(&self) -> Indicators {
        self.own.indicators
    }

    pub fn relayed_indicators(&self) -> Indicators {
        self.relayed.indicators
    }

    /// Apply an envelope from the participant's own channel
    pub fn on_envelope(&mut self, envelope: &EventEnvelope) {
        match ParticipantEvent::parse(envelope) {
            Ok(event) => self.on_event(event),
            Err(e) => {
                warn!("Participant {} dropped event: {}", self.id, e);
                crate::metrics::record_malformed(&ChannelId::Participant(self.id.clone()));
            }
        }
    }

    pub fn on_event(&mut self, event: ParticipantEvent) {
        match event {
            ParticipantEvent::Init(init) => self.init(init),
            ParticipantEvent::WaitPing => {
                match self.own.ping.as_mut() {
                    Some(ping) => {
                        ping.reset(0);
                        let restarted = ping.start();
                        let snapshot = ping.clone();
                        self.notify_tracker(TrackerKind::Ping, TrackerChange::Reset, &snapshot);
                        if restarted {
                            self.notify_tracker(TrackerKind::Ping, TrackerChange::Started, &snapshot);
                        }
                    }
                    None => debug!("Participant {} wait_ping before init", self.id),
                }
                self.advance_pre_vote(OwnStatus::WaitPing);
            }
            ParticipantEvent::Ping => {
                self.pulse_own(Indicator::Heartbeat);
                self.advance_pre_vote(OwnStatus::Ping);
            }
            ParticipantEvent::Touch => {
                self.pulse_own(Indicator::Activity);
                match self.own.work.as_mut() {
                    Some(work) => {
                        if work.start() {
                            let snapshot = work.clone();
                            self.notify_tracker(TrackerKind::Work, TrackerChange::Started, &snapshot);
                        }
                    }
                    None => debug!("Participant {} touch before init", self.id),
                }
            }
            ParticipantEvent::Status(outcome) => self.on_outcome(outcome),
            ParticipantEvent::Unrecognized(kind) => {
                warn!("Participant {} unhandled event: {}", self.id, kind);
                crate::metrics::record_unknown_event(&ChannelId::Participant(self.id.clone()));
            }
        }
    }

    fn init(&mut self, init: ParticipantInit) {
        info!(
            "Participant {} init: ping timeout {}ms, result timeout {}ms",
            self.id, init.ping_timeout, init.result_timeout
        );

        let mut ping = DeadlineTracker::new(init.ping_timeout.saturating_mul(2), self.step);
        let mut work = DeadlineTracker::new(init.result_timeout, self.step);
        ping.start();
        work.start();
        self.notify_tracker(TrackerKind::Ping, TrackerChange::Started, &ping);
        self.notify_tracker(TrackerKind::Work, TrackerChange::Started, &work);
        self.own.ping = Some(ping);
        self.own.work = Some(work);

        self.set_own_status(OwnStatus::Init);
        for indicator in [Indicator::Heartbeat, Indicator::Activity, Indicator::Alert] {
            self.pulse_own(indicator);
        }
    }

    fn on_outcome(&mut self, outcome: OutcomeKind) {
        self.set_own_status(OwnStatus::from(outcome));
        match outcome {
            OutcomeKind::Fail | OutcomeKind::Rollback => {
                self.stop_ping();
                self.stop_work();
            }
            OutcomeKind::Done => self.stop_work(),
            OutcomeKind::Finish => self.stop_ping(),
            OutcomeKind::ReadyCommit | OutcomeKind::Commit => {}
        }
    }

    /// Liveness statuses only apply before the participant has voted
    fn advance_pre_vote(&mut self, status: OwnStatus) {
        if self.own.status.is_pre_vote() {
            self.set_own_status(status);
        } else {
            debug!(
                "Participant {} keeps {:?} over {:?}",
                self.id, self.own.status, status
            );
        }
    }

    fn set_own_status(&mut self, status: OwnStatus) {
        if self.own.status == status {
            return;
        }
        debug!("Participant {} own status {:?} -> {:?}", self.id, self.own.status, status);
        self.own.status = status;
        self.notifier.emit(StateChange::OwnStatus {
            id: self.id.clone(),
            status,
        });
    }

    fn stop_ping(&mut self) {
        if let Some(ping) = self.own.ping.as_mut() {
            if ping.stop() {
                let snapshot = ping.clone();
                self.notify_tracker(TrackerKind::Ping, TrackerChange::Stopped, &snapshot);
            }
        }
    }

    fn stop_work(&mut self) {
        if let Some(work) = self.own.work.as_mut() {
            if work.stop() {
                let snapshot = work.clone();
                self.notify_tracker(TrackerKind::Work, TrackerChange::Stopped, &snapshot);
            }
        }
    }

    fn pulse_own(&mut self, indicator: Indicator) {
        self.own.indicators.pulse(indicator);
        self.notifier.emit(StateChange::Pulse {
            entity: Entity::Participant(self.id.clone()),
            indicator,
        });
    }

    fn notify_tracker(&self, kind: TrackerKind, change: TrackerChange, tracker: &DeadlineTracker) {
        self.notifier
            .tracker(Entity::Participant(self.id.clone()), kind, change, tracker);
    }

    /// Relayed `*_child` status from the coordinator
    pub fn on_relayed_status(&mut self, status: RelayedStatus) {
        if self.relayed.status != status {
            debug!("Participant {} relayed status {:?} -> {:?}", self.id, self.relayed.status, status);
            self.relayed.status = status;
            self.notifier.emit(StateChange::RelayedStatus {
                id: self.id.clone(),
                status,
            });
        }

        if matches!(
            status,
            RelayedStatus::ReadyCommit | RelayedStatus::Fail | RelayedStatus::Rollback
        ) && self.relayed.deadline.stop()
        {
            self.notifier.tracker(
                Entity::Relayed(self.id.clone()),
                TrackerKind::Relayed,
                TrackerChange::Stopped,
                &self.relayed.deadline,
            );
        }
    }

    /// Relayed `ping_child` / `prepare_commit_child`
    pub fn pulse_relayed(&mut self) {
        self.relayed.indicators.pulse(Indicator::Heartbeat);
        self.notifier.emit(StateChange::Pulse {
            entity: Entity::Relayed(self.id.clone()),
            indicator: Indicator::Heartbeat,
        });
    }

    /// Connectivity of the own channel; status and trackers are left alone
    pub fn set_connectivity(&mut self, state: ConnectivityState) {
        self.own.connectivity = state;
    }

    /// Stop the trackers driven by the own channel
    pub fn stop_own_trackers(&mut self) {
        self.stop_ping();
        self.stop_work();
    }

    /// Advance every running tracker by one step
    pub fn tick(&mut self) {
        for tracker in [self.own.ping.as_mut(), self.own.work.as_mut()]
            .into_iter()
            .flatten()
        {
            tracker.tick();
        }
        self.relayed.deadline.tick();
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            service_url: self.service_url.clone(),
            endpoint: self.endpoint.clone(),
            own: OwnViewSnapshot {
                status: self.own.status,
                connectivity: self.own.connectivity,
                ping: self.own.ping.as_ref().map(DeadlineTracker::snapshot),
                work: self.own.work.as_ref().map(DeadlineTracker::snapshot),
                indicators: self.own.indicators,
            },
            relayed: RelayedViewSnapshot {
                status: self.relayed.status,
                deadline: self.relayed.deadline.snapshot(),
                indicators: self.relayed.indicators,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantSnapshot {
    pub id: ParticipantId,
    pub name: String,
    pub service_url: String,
    pub endpoint: Option<String>,
    pub own: OwnViewSnapshot,
    pub relayed: RelayedViewSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnViewSnapshot {
    pub status: OwnStatus,
    pub connectivity: ConnectivityState,
    pub ping: Option<TrackerSnapshot>,
    pub work: Option<TrackerSnapshot>,
    pub indicators: Indicators,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayedViewSnapshot {
    pub status: RelayedStatus,
    pub deadline: TrackerSnapshot,
    pub indicators: Indicators,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServiceSpec;

    fn participant(timeout: u64) -> ParticipantStateMachine {
        let action = ActionSpec {
            id: "x1".into(),
            service: ServiceSpec {
                url: "http://localhost:5011".to_string(),
                timeout,
            },
        };
        ParticipantStateMachine::new(
            &action,
            "Service #1",
            Some("http://localhost:9011/debug_sse".to_string()),
            200,
            Notifier::new(64),
        )
    }

    fn init(p: &mut ParticipantStateMachine) {
        p.on_event(ParticipantEvent::Init(ParticipantInit {
            ping_timeout: 200,
            result_timeout: 3000,
        }));
    }

    #[test]
    fn test_relayed_deadline_starts_at_registration() {
        let p = participant(2000);
        assert!(p.relayed_tracker().is_running());
        assert_eq!(p.relayed_tracker().max(), 2000);
        assert!(p.ping_tracker().is_none());
    }

    #[test]
    fn test_init_arms_own_trackers() {
        let mut p = participant(2000);
        init(&mut p);

        assert_eq!(p.own_status(), OwnStatus::Init);
        assert_eq!(p.ping_tracker().unwrap().max(), 400);
        assert_eq!(p.work_tracker().unwrap().max(), 3000);
        assert!(p.ping_tracker().unwrap().is_running());
        let indicators = p.own_indicators();
        assert_eq!((indicators.heartbeat, indicators.activity, indicators.alert), (1, 1, 1));
    }

    #[test]
    fn test_wait_ping_restarts_ping_deadline() {
        let mut p = participant(2000);
        init(&mut p);
        p.tick();
        p.tick();
        assert!(p.ping_tracker().unwrap().is_expired());

        p.on_event(ParticipantEvent::WaitPing);
        assert_eq!(p.ping_tracker().unwrap().value(), 0);
        assert!(p.ping_tracker().unwrap().is_running());
        assert_eq!(p.own_status(), OwnStatus::WaitPing);
    }

    #[test]
    fn test_wait_ping_announces_restart() {
        let mut p = participant(2000);
        init(&mut p);
        let mut rx = p.notifier.subscribe();

        p.on_event(ParticipantEvent::WaitPing);
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(change);
        }
        let ping_changes = |changes: &[StateChange]| -> Vec<TrackerChange> {
            changes
                .iter()
                .filter_map(|c| match c {
                    StateChange::Tracker {
                        tracker: TrackerKind::Ping,
                        change,
                        ..
                    } => Some(*change),
                    _ => None,
                })
                .collect()
        };
        // Still running: only a reset
        assert_eq!(ping_changes(&changes), vec![TrackerChange::Reset]);

        p.tick();
        p.tick();
        assert!(p.ping_tracker().unwrap().is_expired());
        p.on_event(ParticipantEvent::WaitPing);
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(change);
        }
        assert_eq!(
            ping_changes(&changes),
            vec![TrackerChange::Reset, TrackerChange::Started]
        );
    }

    #[test]
    fn test_liveness_does_not_overwrite_vote() {
        let mut p = participant(2000);
        init(&mut p);
        p.on_event(ParticipantEvent::Status(OutcomeKind::ReadyCommit));
        p.on_event(ParticipantEvent::WaitPing);
        p.on_event(ParticipantEvent::Ping);

        assert_eq!(p.own_status(), OwnStatus::ReadyCommit);
        assert_eq!(p.own_indicators().heartbeat, 2);
    }

    #[test]
    fn test_events_before_init_are_harmless() {
        let mut p = participant(2000);
        p.on_event(ParticipantEvent::Touch);
        p.on_event(ParticipantEvent::WaitPing);
        assert!(p.work_tracker().is_none());
        assert_eq!(p.own_status(), OwnStatus::WaitPing);
    }

    #[test]
    fn test_outcomes_stop_trackers() {
        let mut p = participant(2000);
        init(&mut p);
        p.on_event(ParticipantEvent::Status(OutcomeKind::Done));
        assert!(!p.work_tracker().unwrap().is_running());
        assert!(p.ping_tracker().unwrap().is_running());

        p.on_event(ParticipantEvent::Status(OutcomeKind::Finish));
        assert!(!p.ping_tracker().unwrap().is_running());
        assert_eq!(p.own_status(), OwnStatus::Finish);
    }

    #[test]
    fn test_views_are_independent() {
        let mut p = participant(2000);
        init(&mut p);
        p.on_relayed_status(RelayedStatus::Fail);

        assert_eq!(p.relayed_status(), RelayedStatus::Fail);
        assert_eq!(p.own_status(), OwnStatus::Init);
        assert!(!p.relayed_tracker().is_running());
        assert!(p.ping_tracker().unwrap().is_running());

        p.on_event(ParticipantEvent::Status(OutcomeKind::Commit));
        assert_eq!(p.relayed_status(), RelayedStatus::Fail);
    }

    #[test]
    fn test_own_fail_leaves_relayed_view() {
        let mut p = participant(2000);
        init(&mut p);
        p.on_event(ParticipantEvent::Status(OutcomeKind::Fail));

        assert_eq!(p.own_status(), OwnStatus::Fail);
        assert!(!p.ping_tracker().unwrap().is_running());
        assert!(!p.work_tracker().unwrap().is_running());
        assert_eq!(p.relayed_status(), RelayedStatus::Default);
        assert!(p.relayed_tracker().is_running());

        p.on_relayed_status(RelayedStatus::from(OutcomeKind::Fail));
        assert_eq!(p.relayed_status(), RelayedStatus::Fail);
    }

    #[test]
    fn test_relayed_status_idempotent() {
        let mut p = participant(2000);
        let mut rx = p.notifier.subscribe();
        p.on_relayed_status(RelayedStatus::ReadyCommit);
        p.on_relayed_status(RelayedStatus::ReadyCommit);

        assert_eq!(p.relayed_status(), RelayedStatus::ReadyCommit);
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(change);
        }
        let status_changes = changes
            .iter()
            .filter(|c| matches!(c, StateChange::RelayedStatus { .. }))
            .count();
        assert_eq!(status_changes, 1);
    }

    #[test]
    fn test_connectivity_keeps_status_and_timers() {
        let mut p = participant(2000);
        init(&mut p);
        p.set_connectivity(ConnectivityState::Connected);
        p.set_connectivity(ConnectivityState::Disconnected);

        assert_eq!(p.own_status(), OwnStatus::Init);
        assert!(p.ping_tracker().unwrap().is_running());
        assert_eq!(p.snapshot().own.connectivity, ConnectivityState::Disconnected);
    }
}
