//! In-process transports
//!
//! `RecordingTransport` keeps every published payload in memory and is what
//! the test suite replays into. `LogTransport` backs `--dry-run`: it writes
//! each payload to the log instead of a broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Connector, Transport};
use crate::error::TransportError;
use crate::types::OutboundMessage;

/// A payload accepted by a `RecordingTransport`
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Runtime clock reading at publish time
    pub at: Instant,
}

impl PublishedMessage {
    /// Decode the payload
    pub fn message(&self) -> Result<OutboundMessage, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    messages: Mutex<Vec<PublishedMessage>>,
    calls: AtomicUsize,
    disconnected: AtomicBool,
}

/// Transport that records publishes in memory
///
/// Clones share the same recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    state: Arc<RecordingState>,
    failing_calls: Vec<usize>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the publish calls with these zero-based indices
    pub fn failing_calls(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.failing_calls = calls.into_iter().collect();
        self
    }

    /// Cancel `token` once `count` messages have been recorded
    pub fn cancel_after(mut self, count: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((count, token));
        self
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.state
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.state
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of publish attempts, including rejected ones
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let call = self.state.calls.fetch_add(1, Ordering::SeqCst);

        if self.state.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.failing_calls.contains(&call) {
            return Err(TransportError::Publish(format!(
                "publish {} rejected",
                call
            )));
        }

        let recorded = {
            let mut messages = self
                .state
                .messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            messages.push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                at: Instant::now(),
            });
            messages.len()
        };

        if let Some((count, token)) = &self.cancel_after {
            if recorded >= *count {
                token.cancel();
            }
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ConnectBehavior {
    #[default]
    Accept,
    Refuse,
    Stall,
}

/// Hands out a shared `RecordingTransport`, refuses to connect, or stalls
#[derive(Debug, Clone, Default)]
pub struct RecordingConnector {
    transport: RecordingTransport,
    behavior: ConnectBehavior,
}

impl RecordingConnector {
    pub fn new(transport: RecordingTransport) -> Self {
        Self {
            transport,
            behavior: ConnectBehavior::Accept,
        }
    }

    /// A connector whose broker is unreachable
    pub fn refusing() -> Self {
        Self {
            transport: RecordingTransport::new(),
            behavior: ConnectBehavior::Refuse,
        }
    }

    /// A connector whose broker never answers
    pub fn stalled() -> Self {
        Self {
            transport: RecordingTransport::new(),
            behavior: ConnectBehavior::Stall,
        }
    }

    pub fn transport(&self) -> &RecordingTransport {
        &self.transport
    }
}

impl Connector for RecordingConnector {
    type Transport = RecordingTransport;

    async fn connect(&self) -> Result<RecordingTransport, TransportError> {
        match self.behavior {
            ConnectBehavior::Accept => Ok(self.transport.clone()),
            ConnectBehavior::Refuse => {
                Err(TransportError::Connect("connection refused".to_string()))
            }
            ConnectBehavior::Stall => std::future::pending().await,
        }
    }
}

/// Writes every payload to the log instead of a broker
#[derive(Debug, Default)]
pub struct LogTransport {
    published: AtomicUsize,
}

impl LogTransport {
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

impl Transport for LogTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.published.fetch_add(1, Ordering::Relaxed);
        info!(topic, payload = %String::from_utf8_lossy(&payload), "dry-run publish");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        info!(published = self.published(), "dry-run transport closed");
        Ok(())
    }
}

/// Connector for `LogTransport`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConnector;

impl Connector for LogConnector {
    type Transport = LogTransport;

    async fn connect(&self) -> Result<LogTransport, TransportError> {
        info!("dry-run mode, messages are logged and not sent");
        Ok(LogTransport::default())
    }
}
