//! Server-sent-event transport
//!
//! The event servers speak plain SSE: `data:` lines terminated by a blank
//! line, optional `event:`/`id:`/`retry:` fields and `:` comments.

use crate::error::{MonitorError, MonitorResult};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, StatusCode};
use tracing::debug;

/// One dispatched SSE frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    /// Joined `data:` lines, absent for frames that only carried `retry:`
    pub data: Option<String>,
    /// Last event id seen on the stream so far
    pub id: Option<String>,
    /// Reconnection delay requested by the server, in milliseconds
    pub retry: Option<u64>,
}

/// Stream of frames from one open connection
pub type SseStream = BoxStream<'static, MonitorResult<SseEvent>>;

/// Opens push connections to event servers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Connect to `url`, resuming after `last_event_id` when the server supports it
    async fn open(&self, url: &str, last_event_id: Option<String>) -> MonitorResult<SseStream>;
}

/// Incremental SSE line-protocol decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    skip_lf: bool,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    retry: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut i = 0;

        while i < self.buffer.len() {
            let byte = self.buffer[i];

            // CRLF split across chunks
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    i += 1;
                    start = i;
                    continue;
                }
            }

            if byte == b'\n' || byte == b'\r' {
                let line = String::from_utf8_lossy(&self.buffer[start..i]).into_owned();
                self.skip_lf = byte == b'\r';
                if let Some(frame) = self.process_line(&line) {
                    frames.push(frame);
                }
                i += 1;
                start = i;
            } else {
                i += 1;
            }
        }

        self.buffer.drain(..start);
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            _ => debug!("Ignoring SSE field {:?}", field),
        }

        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let retry = self.retry.take();

        if self.data.is_empty() && retry.is_none() {
            return None;
        }

        let data = if self.data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data).join("\n"))
        };

        Some(SseEvent {
            event,
            data,
            id: self.last_id.clone(),
            retry,
        })
    }
}

/// SSE over HTTP using reqwest byte streaming
pub struct SseTransport {
    client: Client,
}

impl SseTransport {
    pub fn new() -> MonitorResult<Self> {
        let client = Client::builder().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventTransport for SseTransport {
    async fn open(&self, url: &str, last_event_id: Option<String>) -> MonitorResult<SseStream> {
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id);
        }

        let response = request.send().await?;
        let status = response.status();
        // 204 is the server's way of saying "stop reconnecting"
        if status == StatusCode::NO_CONTENT {
            return Err(MonitorError::StreamClosed {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(MonitorError::Transport {
                url: url.to_string(),
                message: format!("unexpected HTTP status {}", status),
            });
        }

        let mut decoder = SseDecoder::new();
        let frames = response
            .bytes_stream()
            .map(move |chunk| chunk.map(|bytes| decoder.feed(&bytes)))
            .flat_map(|result| {
                let items: Vec<MonitorResult<SseEvent>> = match result {
                    Ok(frames) => frames.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(MonitorError::from(e))],
                };
                stream::iter(items)
            });

        Ok(frames.boxed())
    }
}
