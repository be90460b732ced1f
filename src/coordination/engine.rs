//! Monitor engine: owns every channel and state machine of the dashboard
//!
//! Listener tasks only forward signals. All state is mutated by the engine
//! loop, one signal or tick at a time, so handlers never interleave.

use super::coordinator::{CoordinatorSnapshot, CoordinatorStateMachine, ParticipantChannel};
use super::notify::{Notifier, StateChange};
use super::participant::ParticipantSnapshot;
use crate::channel::{
    AdapterOutput, ChannelAdapter, ChannelId, ChannelListener, ChannelSignal, ConnectivityState,
    EventTransport, Observer,
};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::events::EventEnvelope;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observer attached to every channel, including channels opened later
pub type SharedObserver = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Everything the engine loop mutates
pub struct Dashboard {
    coordinator: CoordinatorStateMachine,
    adapters: HashMap<ChannelId, ChannelAdapter>,
    /// Creation order; breaks timestamp ties in the merged log
    channel_order: Vec<ChannelId>,
    shared_observers: Vec<SharedObserver>,
}

impl Dashboard {
    fn new(config: &MonitorConfig, notifier: Notifier) -> MonitorResult<Self> {
        let mut dashboard = Self {
            coordinator: CoordinatorStateMachine::new(config, notifier)?,
            adapters: HashMap::new(),
            channel_order: Vec::new(),
            shared_observers: Vec::new(),
        };
        dashboard.add_channel(
            ChannelId::Coordinator,
            &config.coordinator_name,
            &config.coordinator_url,
        );
        Ok(dashboard)
    }

    fn add_channel(&mut self, id: ChannelId, name: &str, url: &str) {
        let mut adapter = ChannelAdapter::new(id.clone(), name, url);
        for observer in &self.shared_observers {
            adapter.observe(shared(observer));
        }
        self.channel_order.push(id.clone());
        self.adapters.insert(id, adapter);
    }

    /// Feed one listener signal, returning participant channels to open
    fn apply(&mut self, signal: ChannelSignal, notifier: &Notifier) -> Vec<ParticipantChannel> {
        let ChannelSignal { channel, kind } = signal;
        let Some(adapter) = self.adapters.get_mut(&channel) else {
            warn!("Signal for unknown channel {}", channel);
            return Vec::new();
        };

        match adapter.on_signal(kind) {
            AdapterOutput::Dropped => Vec::new(),
            AdapterOutput::Connectivity(state) => {
                self.set_connectivity(&channel, state);
                notifier.emit(StateChange::Connectivity {
                    channel: channel.to_string(),
                    state,
                });
                Vec::new()
            }
            AdapterOutput::Event(envelope) => match &channel {
                ChannelId::Coordinator => {
                    let opened = self.coordinator.on_envelope(&envelope);
                    for participant in &opened {
                        self.add_channel(
                            ChannelId::Participant(participant.id.clone()),
                            &participant.name,
                            &participant.url,
                        );
                    }
                    opened
                }
                ChannelId::Participant(id) => {
                    match self.coordinator.participant_mut(id) {
                        Some(participant) => participant.on_envelope(&envelope),
                        None => warn!("Event for unregistered participant {}", id),
                    }
                    Vec::new()
                }
            },
        }
    }

    fn set_connectivity(&mut self, channel: &ChannelId, state: ConnectivityState) {
        match channel {
            ChannelId::Coordinator => self.coordinator.set_connectivity(state),
            ChannelId::Participant(id) => {
                if let Some(participant) = self.coordinator.participant_mut(id) {
                    participant.set_connectivity(state);
                }
            }
        }
    }

    fn close(&mut self, channel: &ChannelId) -> MonitorResult<()> {
        let adapter = self
            .adapters
            .get_mut(channel)
            .ok_or_else(|| not_found(channel))?;
        adapter.close();

        self.set_connectivity(channel, ConnectivityState::Disconnected);
        match channel {
            ChannelId::Coordinator => self.coordinator.stop_trackers(),
            ChannelId::Participant(id) => {
                if let Some(participant) = self.coordinator.participant_mut(id) {
                    participant.stop_own_trackers();
                }
            }
        }
        Ok(())
    }

    pub fn coordinator(&self) -> &CoordinatorStateMachine {
        &self.coordinator
    }

    pub fn channel_log(&self, channel: &ChannelId) -> MonitorResult<Vec<EventEnvelope>> {
        self.adapters
            .get(channel)
            .map(|adapter| adapter.log().iter().cloned().collect())
            .ok_or_else(|| not_found(channel))
    }

    /// All channel logs interleaved by timestamp
    pub fn merged_log(&self) -> Vec<EventEnvelope> {
        let mut merged: Vec<EventEnvelope> = self
            .channel_order
            .iter()
            .filter_map(|id| self.adapters.get(id))
            .flat_map(|adapter| adapter.log().iter().cloned())
            .collect();
        // Stable: ties keep channel creation order, then log order
        merged.sort_by_key(|envelope| envelope.timestamp);
        merged
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            coordinator: self.coordinator.snapshot(),
            participants: self.coordinator.participant_snapshots(),
            channels: self
                .channel_order
                .iter()
                .filter_map(|id| self.adapters.get(id))
                .map(|adapter| ChannelSnapshot {
                    id: adapter.id().to_string(),
                    name: adapter.name().to_string(),
                    url: adapter.url().to_string(),
                    connectivity: adapter.connectivity(),
                    closed: adapter.is_closed(),
                    logged_events: adapter.log().len(),
                    last_event_at: adapter.log().latest().map(|e| e.timestamp),
                })
                .collect(),
        }
    }
}

fn shared(observer: &SharedObserver) -> Observer {
    let observer = observer.clone();
    Box::new(move |envelope: &EventEnvelope| observer(envelope))
}

fn not_found(channel: &ChannelId) -> MonitorError {
    match channel {
        ChannelId::Coordinator => MonitorError::ChannelNotFound {
            channel: channel.to_string(),
        },
        ChannelId::Participant(id) => MonitorError::ParticipantNotFound { id: id.to_string() },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub coordinator: CoordinatorSnapshot,
    pub participants: Vec<ParticipantSnapshot>,
    pub channels: Vec<ChannelSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub id: String,
    pub name: String,
    pub url: String,
    pub connectivity: ConnectivityState,
    pub closed: bool,
    pub logged_events: usize,
    /// Emitter time of the newest logged event
    pub last_event_at: Option<DateTime<Utc>>,
}

struct ListenerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives the dashboard from the coordinator's channel outwards
pub struct MonitorEngine {
    config: MonitorConfig,
    transport: Arc<dyn EventTransport>,
    dashboard: RwLock<Dashboard>,
    listeners: DashMap<ChannelId, ListenerHandle>,
    signal_tx: mpsc::UnboundedSender<ChannelSignal>,
    /// Taken by `run`
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelSignal>>>,
    notifier: Notifier,
    shutdown: CancellationToken,
}

impl MonitorEngine {
    pub fn new(config: MonitorConfig, transport: Arc<dyn EventTransport>) -> MonitorResult<Self> {
        if config.tick_interval_ms == 0 || config.notification_capacity == 0 {
            return Err(MonitorError::Config(
                "tick interval and notification capacity must be non-zero".to_string(),
            ));
        }
        let notifier = Notifier::new(config.notification_capacity);
        let dashboard = Dashboard::new(&config, notifier.clone())?;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            transport,
            dashboard: RwLock::new(dashboard),
            listeners: DashMap::new(),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            notifier,
            shutdown: CancellationToken::new(),
        })
    }

    /// Connect to the coordinator and process signals until stopped
    pub async fn run(&self) -> MonitorResult<()> {
        let mut signals = self
            .signal_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| MonitorError::Internal("engine is already running".to_string()))?;

        self.spawn_listener(ChannelId::Coordinator, self.config.coordinator_url.clone());

        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Monitor engine started for {} (tick {}ms)",
            self.config.coordinator_url, self.config.tick_interval_ms
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(signal) = signals.recv() => {
                    self.process(signal).await;
                }

                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Monitor engine stopped");
        Ok(())
    }

    /// Apply one listener signal to the dashboard
    pub async fn process(&self, signal: ChannelSignal) {
        let opened = self.dashboard.write().await.apply(signal, &self.notifier);
        for participant in opened {
            self.spawn_listener(ChannelId::Participant(participant.id), participant.url);
        }
    }

    /// Advance every deadline tracker by one step
    pub async fn tick(&self) {
        self.dashboard.write().await.coordinator.tick();
    }

    fn spawn_listener(&self, channel: ChannelId, url: String) {
        if self.shutdown.is_cancelled() {
            debug!("Not opening {} during shutdown", channel);
            return;
        }

        let cancel = self.shutdown.child_token();
        let task = ChannelListener::new(
            channel.clone(),
            url,
            self.transport.clone(),
            self.signal_tx.clone(),
            self.config.retry_delay(),
            cancel.clone(),
        )
        .spawn();

        if let Some(previous) = self.listeners.insert(channel, ListenerHandle { cancel, task }) {
            previous.cancel.cancel();
        }
    }

    /// Register a callback for every decoded envelope of one channel
    pub async fn observe(&self, channel: &ChannelId, observer: Observer) -> MonitorResult<()> {
        self.dashboard
            .write()
            .await
            .adapters
            .get_mut(channel)
            .ok_or_else(|| not_found(channel))?
            .observe(observer);
        Ok(())
    }

    /// Register a callback on all current and future channels
    pub async fn observe_all(&self, observer: SharedObserver) {
        let mut dashboard = self.dashboard.write().await;
        let dashboard = &mut *dashboard;
        for id in &dashboard.channel_order {
            if let Some(adapter) = dashboard.adapters.get_mut(id) {
                adapter.observe(shared(&observer));
            }
        }
        dashboard.shared_observers.push(observer);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.notifier.subscribe()
    }

    /// Cancel a channel's pending read and stop its trackers; its log stays readable
    pub async fn close_channel(&self, channel: &ChannelId) -> MonitorResult<()> {
        self.dashboard.write().await.close(channel)?;
        self.notifier.emit(StateChange::Connectivity {
            channel: channel.to_string(),
            state: ConnectivityState::Disconnected,
        });

        if let Some((_, listener)) = self.listeners.remove(channel) {
            listener.cancel.cancel();
            if let Err(e) = listener.task.await {
                warn!("Listener for {} ended abnormally: {}", channel, e);
            }
        }

        info!("Closed channel {}", channel);
        Ok(())
    }

    /// Stop the engine loop and close every channel
    pub async fn stop(&self) {
        info!("Stopping monitor engine");
        self.shutdown.cancel();

        let channels = self.dashboard.read().await.channel_order.clone();
        for channel in &channels {
            if let Err(e) = self.close_channel(channel).await {
                warn!("Failed to close {}: {}", channel, e);
            }
        }
    }

    pub async fn snapshot(&self) -> DashboardSnapshot {
        self.dashboard.read().await.snapshot()
    }

    pub async fn channel_log(&self, channel: &ChannelId) -> MonitorResult<Vec<EventEnvelope>> {
        self.dashboard.read().await.channel_log(channel)
    }

    pub async fn merged_log(&self) -> Vec<EventEnvelope> {
        self.dashboard.read().await.merged_log()
    }
}
