//! Per-channel adapter: keepalive filtering, decoding, audit log, observers

use super::{ChannelId, ConnectivityState, OrderedEventLog, SignalKind};
use crate::events::{EventEnvelope, KEEPALIVE_MESSAGES};

use tracing::{debug, info, warn};

/// Callback invoked with every decoded envelope of a channel
pub type Observer = Box<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Result of feeding one listener signal through the adapter
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutput {
    /// Decoded envelope for the owning state machine
    Event(EventEnvelope),
    Connectivity(ConnectivityState),
    /// Keepalive, malformed message, or closed channel
    Dropped,
}

/// Wraps one push connection on the engine side
pub struct ChannelAdapter {
    id: ChannelId,
    /// Label stamped on decoded envelopes
    name: String,
    url: String,
    connectivity: ConnectivityState,
    log: OrderedEventLog,
    observers: Vec<Observer>,
    closed: bool,
}

impl ChannelAdapter {
    pub fn new(id: ChannelId, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            url: url.into(),
            connectivity: ConnectivityState::Disconnected,
            log: OrderedEventLog::new(),
            observers: Vec::new(),
            closed: false,
        }
    }

    /// Register a callback; callbacks run in registration order
    pub fn observe(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    /// Feed one listener signal
    pub fn on_signal(&mut self, kind: SignalKind) -> AdapterOutput {
        if self.closed {
            debug!("Channel {} is closed, dropping signal", self.id);
            return AdapterOutput::Dropped;
        }

        match kind {
            SignalKind::Opened => self.set_connectivity(ConnectivityState::Connected),
            SignalKind::Failed(reason) => {
                warn!("Channel {} lost connection: {}", self.id, reason);
                self.set_connectivity(ConnectivityState::Disconnected)
            }
            SignalKind::Message(raw) => self.on_message(&raw),
        }
    }

    fn set_connectivity(&mut self, state: ConnectivityState) -> AdapterOutput {
        if self.connectivity != state {
            info!("Channel {} is now {:?}", self.id, state);
        }
        self.connectivity = state;
        crate::metrics::record_connectivity(&self.id, state);
        AdapterOutput::Connectivity(state)
    }

    fn on_message(&mut self, raw: &str) -> AdapterOutput {
        let trimmed = raw.trim();
        if KEEPALIVE_MESSAGES.contains(&trimmed) {
            debug!("Channel {} keepalive: {}", self.id, trimmed);
            crate::metrics::record_keepalive(&self.id);
            return AdapterOutput::Dropped;
        }

        let envelope = match EventEnvelope::decode(raw, &self.name) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Channel {} dropped message: {}", self.id, e);
                crate::metrics::record_malformed(&self.id);
                return AdapterOutput::Dropped;
            }
        };

        debug!("Channel {} event: {}", self.id, envelope.kind);
        crate::metrics::record_event(&self.id, &envelope.kind);

        self.log.insert(envelope.clone());
        for observer in &self.observers {
            observer(&envelope);
        }

        AdapterOutput::Event(envelope)
    }

    /// Stop accepting signals; the log stays readable as a frozen record
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.connectivity = ConnectivityState::Disconnected;
            crate::metrics::record_connectivity(&self.id, self.connectivity);
            info!("Channel {} closed with {} logged events", self.id, self.log.len());
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn log(&self) -> &OrderedEventLog {
        &self.log
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for ChannelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAdapter")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("connectivity", &self.connectivity)
            .field("logged", &self.log.len())
            .field("observers", &self.observers.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn adapter() -> ChannelAdapter {
        ChannelAdapter::new(
            ChannelId::Coordinator,
            "Controller",
            "http://localhost:9000/debug_sse",
        )
    }

    fn message(event: &str, t: f64) -> SignalKind {
        SignalKind::Message(format!(
            r#"{{"event": "{}", "t": {{"@datetime": {}}}, "data": null}}"#,
            event, t
        ))
    }

    #[test]
    fn test_keepalives_never_logged() {
        let mut adapter = adapter();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        adapter.observe(Box::new(move |_: &EventEnvelope| *counter.lock().unwrap() += 1));

        assert_eq!(
            adapter.on_signal(SignalKind::Message("INIT".to_string())),
            AdapterOutput::Dropped
        );
        assert_eq!(
            adapter.on_signal(SignalKind::Message("PING".to_string())),
            AdapterOutput::Dropped
        );

        assert!(adapter.log().is_empty());
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_decoded_event_logged_and_forwarded() {
        let mut adapter = adapter();
        match adapter.on_signal(message("commit", 12.5)) {
            AdapterOutput::Event(envelope) => {
                assert_eq!(envelope.kind, "commit");
                assert_eq!(envelope.source_name, "Controller");
            }
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(adapter.log().len(), 1);
    }

    #[test]
    fn test_malformed_dropped_and_processing_continues() {
        let mut adapter = adapter();
        assert_eq!(
            adapter.on_signal(SignalKind::Message("{\"event\":".to_string())),
            AdapterOutput::Dropped
        );
        assert!(matches!(
            adapter.on_signal(message("finish", 1.0)),
            AdapterOutput::Event(_)
        ));
        assert_eq!(adapter.log().len(), 1);
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let mut adapter = adapter();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let calls = calls.clone();
            adapter.observe(Box::new(move |env: &EventEnvelope| {
                calls.lock().unwrap().push(format!("{}:{}", tag, env.kind))
            }));
        }

        adapter.on_signal(message("rollback", 3.0));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["first:rollback", "second:rollback", "third:rollback"]
        );
    }

    #[test]
    fn test_connectivity_transitions_repeatable() {
        let mut adapter = adapter();
        assert_eq!(adapter.connectivity(), ConnectivityState::Disconnected);
        assert_eq!(
            adapter.on_signal(SignalKind::Opened),
            AdapterOutput::Connectivity(ConnectivityState::Connected)
        );
        assert_eq!(
            adapter.on_signal(SignalKind::Opened),
            AdapterOutput::Connectivity(ConnectivityState::Connected)
        );
        assert_eq!(
            adapter.on_signal(SignalKind::Failed("reset".to_string())),
            AdapterOutput::Connectivity(ConnectivityState::Disconnected)
        );
    }

    #[test]
    fn test_closed_adapter_freezes_log() {
        let mut adapter = adapter();
        adapter.on_signal(message("init", 1.0));
        adapter.close();

        assert_eq!(adapter.on_signal(message("finish", 2.0)), AdapterOutput::Dropped);
        assert_eq!(adapter.on_signal(SignalKind::Opened), AdapterOutput::Dropped);
        assert_eq!(adapter.log().len(), 1);
        assert!(adapter.is_closed());
    }
}
