//! Channel module - one push stream per coordinator or participant
//!
//! This module provides:
//! - SSE transport with an incremental frame decoder
//! - Listener tasks that reconnect the way a browser EventSource does
//! - Adapters that filter keepalives, decode envelopes and keep the audit log
//! - Time-ordered per-channel event logs

pub mod adapter;
pub mod listener;
pub mod log;
pub mod transport;

pub use adapter::{AdapterOutput, ChannelAdapter, Observer};
pub use listener::ChannelListener;
pub use log::OrderedEventLog;
pub use transport::{EventTransport, SseDecoder, SseEvent, SseStream, SseTransport};

use crate::events::ParticipantId;

use serde::Serialize;
use std::fmt;

/// Identity of a channel: the coordinator's or one participant's
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Coordinator,
    Participant(ParticipantId),
}

impl ChannelId {
    /// Low-cardinality label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelId::Coordinator => "coordinator",
            ChannelId::Participant(_) => "participant",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Coordinator => f.write_str("coordinator"),
            ChannelId::Participant(id) => write!(f, "participant:{}", id),
        }
    }
}

/// Transport-level connectivity of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Connected,
    Disconnected,
}

/// What a listener observed on its connection
#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    Opened,
    Failed(String),
    Message(String),
}

/// Listener-to-engine message
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSignal {
    pub channel: ChannelId,
    pub kind: SignalKind,
}

impl ChannelSignal {
    pub fn new(channel: ChannelId, kind: SignalKind) -> Self {
        Self { channel, kind }
    }
}
