//! Composable transport channels.
//!
//! Every transport the agent speaks — broker topics, UDP, HTTP ingest,
//! raw TCP streams — implements the same [`Channel`] contract: a `send`
//! returning [`SendResult`] and a broadcast stream of received payloads.
//! The [`RetryChannel`] and [`TeamChannel`] decorators compose persistence
//! and fan-out on top of any base channel without the callers noticing.

pub mod http;
pub mod metrics;
pub mod mqtt;
pub mod persist;
pub mod retry;
pub mod stream;
pub mod team;
pub mod udp;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use http::HttpChannel;
pub use metrics::{ChannelMetrics, MetricsHandle};
pub use mqtt::{MqttChannel, MqttLink, MqttLinkConfig};
pub use persist::BacklogFile;
pub use retry::{DrainOrder, RetryChannel, RetryMetrics};
pub use stream::StreamChannel;
pub use team::{TeamChannel, TeamPolicy};
pub use udp::UdpChannel;

/// Buffered capacity of each channel's received stream.
pub const RECEIVED_CAPACITY: usize = 256;

/// Payload travelling through a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Bytes(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Line rendering used by backlog persistence.
    pub fn to_line(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

/// Outcome of a single send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SendResult {
    Ok,
    Failed,
    NoConnection,
}

impl SendResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Combine two non-ok outcomes: `Failed` dominates `NoConnection`.
    pub fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Ok, other) => other,
            (me, Self::Ok) => me,
            (Self::Failed, _) | (_, Self::Failed) => Self::Failed,
            _ => Self::NoConnection,
        }
    }
}

/// An abstract transport endpoint.
///
/// Sends are FIFO per channel as submitted; received payloads are fanned
/// out over a broadcast stream so several consumers can tap one transport.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, payload: Payload) -> SendResult;

    /// Subscribe to payloads arriving on this channel. Channels that never
    /// receive return a stream that stays silent.
    fn received(&self) -> broadcast::Receiver<Payload>;

    fn metrics(&self) -> ChannelMetrics;

    /// Release sockets and subscriptions. Idempotent.
    async fn close(&self);
}

/// Broadcast sender side used by channel implementations for their
/// received streams.
#[derive(Clone)]
pub(crate) struct ReceivedBus {
    tx: broadcast::Sender<Payload>,
}

impl ReceivedBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(RECEIVED_CAPACITY);
        Self { tx }
    }

    pub(crate) fn emit(&self, payload: Payload) {
        // No subscribers just means nobody is listening yet.
        let _ = self.tx.send(payload);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Payload> {
        self.tx.subscribe()
    }
}
