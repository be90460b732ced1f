//! Coordinator state machine and relayed-event routing

use super::notify::{Entity, Notifier, StateChange, TrackerChange, TrackerKind};
use super::participant::{ParticipantSnapshot, ParticipantStateMachine};
use super::session::TransactionSession;
use super::status::{CoordinatorStatus, Indicator, Indicators, RelayedStatus};
use crate::channel::{ChannelId, ConnectivityState};
use crate::config::MonitorConfig;
use crate::deadline::TrackerSnapshot;
use crate::error::{MonitorError, MonitorResult};
use crate::events::{
    CoordinatorEvent, CoordinatorInit, CoordinatorOutcome, EventEnvelope, ParticipantId,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Maps a participant's service URL to its event endpoint and display name
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    pattern: Regex,
    endpoint_template: String,
    name_template: String,
}

/// Endpoint and display name derived from a service URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub url: String,
    pub name: String,
}

impl EndpointResolver {
    pub fn from_config(config: &MonitorConfig) -> MonitorResult<Self> {
        let pattern = Regex::new(&config.participant_url_pattern).map_err(|e| {
            MonitorError::Config(format!("participant_url_pattern: {}", e))
        })?;
        Ok(Self {
            pattern,
            endpoint_template: config.participant_endpoint_template.clone(),
            name_template: config.participant_name_template.clone(),
        })
    }

    /// Fill both templates with the pattern's first capture group
    pub fn resolve(&self, service_url: &str) -> Option<ResolvedEndpoint> {
        let suffix = self.pattern.captures(service_url)?.get(1)?.as_str();
        Some(ResolvedEndpoint {
            url: self.endpoint_template.replace("{n}", suffix),
            name: self.name_template.replace("{n}", suffix),
        })
    }
}

/// Participant channel the engine should open after a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantChannel {
    pub id: ParticipantId,
    pub name: String,
    pub url: String,
}

pub struct CoordinatorStateMachine {
    name: String,
    status: CoordinatorStatus,
    connectivity: ConnectivityState,
    indicators: Indicators,
    /// Opened by the first `init`
    session: Option<TransactionSession>,
    resolver: EndpointResolver,
    step: u64,
    notifier: Notifier,
}

impl CoordinatorStateMachine {
    pub fn new(config: &MonitorConfig, notifier: Notifier) -> MonitorResult<Self> {
        Ok(Self {
            name: config.coordinator_name.clone(),
            status: CoordinatorStatus::Default,
            connectivity: ConnectivityState::Disconnected,
            indicators: Indicators::default(),
            session: None,
            resolver: EndpointResolver::from_config(config)?,
            step: config.tick_interval_ms,
            notifier,
        })
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status
    }

    pub fn session(&self) -> Option<&TransactionSession> {
        self.session.as_ref()
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&ParticipantStateMachine> {
        self.session.as_ref()?.participants.get(id)
    }

    pub fn participant_mut(&mut self, id: &ParticipantId) -> Option<&mut ParticipantStateMachine> {
        self.session.as_mut()?.participants.get_mut(id)
    }

    /// Apply an envelope from the coordinator's channel.
    ///
    /// Returns the channels of newly registered participants whose endpoint
    /// could be derived.
    pub fn on_envelope(&mut self, envelope: &EventEnvelope) -> Vec<ParticipantChannel> {
        self.indicators.pulse(Indicator::Activity);
        self.notifier.emit(StateChange::Pulse {
            entity: Entity::Coordinator,
            indicator: Indicator::Activity,
        });

        let event = match CoordinatorEvent::parse(envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!("Coordinator dropped event: {}", e);
                crate::metrics::record_malformed(&ChannelId::Coordinator);
                return Vec::new();
            }
        };

        match event {
            CoordinatorEvent::Init(init) => return self.init(init, envelope.timestamp),
            CoordinatorEvent::Status(outcome) => self.on_outcome(outcome),
            CoordinatorEvent::InitChild => debug!("Coordinator init_child"),
            CoordinatorEvent::InitChild2 { chid, ping_timeout } => {
                if self.route(&chid, "init_child_2").is_some() {
                    debug!("Participant {} init_child_2 (ping timeout {:?})", chid, ping_timeout);
                }
            }
            CoordinatorEvent::ChildActivity(chid) => {
                if let Some(participant) = self.route(&chid, &envelope.kind) {
                    participant.pulse_relayed();
                }
            }
            CoordinatorEvent::ChildStatus { chid, status } => {
                if let Some(participant) = self.route(&chid, &envelope.kind) {
                    participant.on_relayed_status(RelayedStatus::from(status));
                }
            }
            CoordinatorEvent::Unrecognized(kind) => {
                warn!("Coordinator unhandled event: {}", kind);
                crate::metrics::record_unknown_event(&ChannelId::Coordinator);
            }
        }

        Vec::new()
    }

    fn init(&mut self, init: CoordinatorInit, started_at: DateTime<Utc>) -> Vec<ParticipantChannel> {
        info!(
            "Transaction started: timeout {}ms, {} actions",
            init.timeout,
            init.actions.len()
        );

        let step = self.step;
        let repeated = self.session.is_some();
        let session = self
            .session
            .get_or_insert_with(|| TransactionSession::start(started_at, init.timeout, step));
        if repeated {
            warn!("Repeated init, re-arming global deadline");
            session.rearm(init.timeout);
        }
        self.notifier.tracker(
            Entity::Coordinator,
            TrackerKind::Global,
            TrackerChange::Started,
            &session.global_deadline,
        );

        let mut channels = Vec::new();
        for action in &init.actions {
            if session.participants.contains(&action.id) {
                warn!("Participant {} already registered, ignoring", action.id);
                continue;
            }

            let resolved = self.resolver.resolve(&action.service.url);
            let name = resolved
                .as_ref()
                .map(|r| r.name.clone())
                .unwrap_or_else(|| action.id.to_string());
            let endpoint = resolved.as_ref().map(|r| r.url.clone());
            if endpoint.is_none() {
                warn!(
                    "No event endpoint for participant {} at {}",
                    action.id, action.service.url
                );
            }

            let participant = ParticipantStateMachine::new(
                action,
                name.clone(),
                endpoint.clone(),
                step,
                self.notifier.clone(),
            );
            session.participants.register(participant);
            info!("Registered participant {} ({})", action.id, name);
            self.notifier.emit(StateChange::ParticipantRegistered {
                id: action.id.clone(),
                name: name.clone(),
                endpoint: endpoint.clone(),
            });

            if let Some(url) = endpoint {
                channels.push(ParticipantChannel {
                    id: action.id.clone(),
                    name,
                    url,
                });
            }
        }
        crate::metrics::record_participants(session.participants.len());

        self.set_status(CoordinatorStatus::InProgress);
        channels
    }

    fn on_outcome(&mut self, outcome: CoordinatorOutcome) {
        let status = match outcome {
            CoordinatorOutcome::ReadyCommit => CoordinatorStatus::ReadyCommit,
            CoordinatorOutcome::Fail => CoordinatorStatus::Fail,
            CoordinatorOutcome::Commit => CoordinatorStatus::Commit,
            CoordinatorOutcome::Rollback => CoordinatorStatus::Rollback,
            CoordinatorOutcome::Finish => CoordinatorStatus::Finish,
        };
        self.set_status(status);

        if matches!(
            outcome,
            CoordinatorOutcome::Fail | CoordinatorOutcome::Rollback | CoordinatorOutcome::Finish
        ) {
            self.stop_global_deadline();
        }
    }

    fn set_status(&mut self, status: CoordinatorStatus) {
        if self.status == status {
            return;
        }
        info!("Coordinator status {:?} -> {:?}", self.status, status);
        self.status = status;
        self.notifier.emit(StateChange::CoordinatorStatus { status });
    }

    /// Look up the target of a relayed event
    fn route(&mut self, chid: &ParticipantId, kind: &str) -> Option<&mut ParticipantStateMachine> {
        let participant = self
            .session
            .as_mut()
            .and_then(|session| session.participants.get_mut(chid));
        if participant.is_none() {
            warn!("Relayed {} for unregistered participant {}", kind, chid);
            crate::metrics::record_routing_miss();
        }
        participant
    }

    fn stop_global_deadline(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if session.global_deadline.stop() {
                self.notifier.tracker(
                    Entity::Coordinator,
                    TrackerKind::Global,
                    TrackerChange::Stopped,
                    &session.global_deadline,
                );
            }
        }
    }

    pub fn set_connectivity(&mut self, state: ConnectivityState) {
        self.connectivity = state;
    }

    /// Stop the global deadline when the coordinator's channel is closed
    pub fn stop_trackers(&mut self) {
        self.stop_global_deadline();
    }

    pub fn tick(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.tick();
        }
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            name: self.name.clone(),
            status: self.status,
            connectivity: self.connectivity,
            indicators: self.indicators,
            started_at: self.session.as_ref().map(|s| s.started_at),
            global_deadline: self
                .session
                .as_ref()
                .map(|s| s.global_deadline.snapshot()),
        }
    }

    /// Participants in registration order
    pub fn participant_snapshots(&self) -> Vec<ParticipantSnapshot> {
        self.session
            .as_ref()
            .map(|s| s.participants.iter().map(|p| p.snapshot()).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for CoordinatorStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorStateMachine")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("connectivity", &self.connectivity)
            .field("session", &self.session)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorSnapshot {
    pub name: String,
    pub status: CoordinatorStatus,
    pub connectivity: ConnectivityState,
    pub indicators: Indicators,
    pub started_at: Option<DateTime<Utc>>,
    pub global_deadline: Option<TrackerSnapshot>,
}
