//! Channel listener task with EventSource-style reconnection

use super::{ChannelId, ChannelSignal, EventTransport, SignalKind};

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reads one channel and forwards what it sees to the engine
pub struct ChannelListener {
    channel: ChannelId,
    url: String,
    transport: Arc<dyn EventTransport>,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    /// Current reconnect delay, replaced by the server's `retry:` field
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl ChannelListener {
    pub fn new(
        channel: ChannelId,
        url: impl Into<String>,
        transport: Arc<dyn EventTransport>,
        signals: mpsc::UnboundedSender<ChannelSignal>,
        retry_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            url: url.into(),
            transport,
            signals,
            retry_delay,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.listen())
    }

    /// Connect, forward, and reconnect until cancelled
    pub async fn listen(mut self) {
        let mut last_event_id: Option<String> = None;

        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = self.transport.open(&self.url, last_event_id.clone()) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    info!("Channel {} connected to {}", self.channel, self.url);
                    if !self.emit(SignalKind::Opened) {
                        break;
                    }

                    loop {
                        let next = tokio::select! {
                            _ = self.cancel.cancelled() => {
                                debug!("Channel {} listener cancelled", self.channel);
                                return;
                            }
                            next = stream.next() => next,
                        };

                        let failure = match next {
                            Some(Ok(frame)) => {
                                if let Some(ms) = frame.retry {
                                    debug!("Channel {} retry delay set to {}ms", self.channel, ms);
                                    self.retry_delay = Duration::from_millis(ms);
                                }
                                if frame.id.is_some() {
                                    last_event_id = frame.id;
                                }
                                if let Some(data) = frame.data {
                                    if !self.emit(SignalKind::Message(data)) {
                                        return;
                                    }
                                }
                                continue;
                            }
                            Some(Err(e)) if !e.is_retryable() => {
                                warn!("Channel {} stopped: {}", self.channel, e);
                                self.emit(SignalKind::Failed(e.to_string()));
                                return;
                            }
                            Some(Err(e)) => e.to_string(),
                            None => "stream closed by server".to_string(),
                        };

                        if !self.emit(SignalKind::Failed(failure)) {
                            return;
                        }
                        break;
                    }
                }
                Err(e) => {
                    warn!("Channel {} failed to connect to {}: {}", self.channel, self.url, e);
                    if !self.emit(SignalKind::Failed(e.to_string())) || !e.is_retryable() {
                        break;
                    }
                }
            }

            crate::metrics::record_reconnect(&self.channel);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        debug!("Channel {} listener stopped", self.channel);
    }

    /// Returns false once the engine has gone away
    fn emit(&self, kind: SignalKind) -> bool {
        self.signals
            .send(ChannelSignal::new(self.channel.clone(), kind))
            .is_ok()
    }
}
