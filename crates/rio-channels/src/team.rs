//! Team decorator: fan a send out to several channels.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{Channel, ChannelMetrics, MetricsHandle, Payload, SendResult};

/// Fan-out policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TeamPolicy {
    /// Try members in declaration order; the first success wins and the
    /// remaining members are skipped.
    Any,
    /// Attempt every member; the team succeeds iff the success ratio
    /// reaches the quorum (0 < quorum <= 1).
    All { quorum: f64 },
}

pub struct TeamChannel {
    name: String,
    members: Vec<Arc<dyn Channel>>,
    policy: TeamPolicy,
    metrics: MetricsHandle,
    last_error: Mutex<Option<String>>,
}

impl TeamChannel {
    pub fn new(
        name: impl Into<String>,
        members: Vec<Arc<dyn Channel>>,
        policy: TeamPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            members,
            policy,
            metrics: MetricsHandle::new(),
            last_error: Mutex::new(None),
        }
    }

    pub fn members(&self) -> usize {
        self.members.len()
    }

    async fn send_any(&self, payload: &Payload) -> SendResult {
        let mut worst = SendResult::NoConnection;
        for member in &self.members {
            match member.send(payload.clone()).await {
                SendResult::Ok => return SendResult::Ok,
                SendResult::Failed => {
                    *self.last_error.lock() = Some(format!("{} failed", member.name()));
                    worst = worst.worst(SendResult::Failed);
                }
                SendResult::NoConnection => worst = worst.worst(SendResult::NoConnection),
            }
        }
        worst
    }

    async fn send_all(&self, payload: &Payload, quorum: f64) -> SendResult {
        let mut successes = 0usize;
        let mut worst = SendResult::NoConnection;
        for member in &self.members {
            match member.send(payload.clone()).await {
                SendResult::Ok => successes += 1,
                SendResult::Failed => {
                    *self.last_error.lock() = Some(format!("{} failed", member.name()));
                    worst = worst.worst(SendResult::Failed);
                }
                SendResult::NoConnection => worst = worst.worst(SendResult::NoConnection),
            }
        }
        if self.members.is_empty() {
            return SendResult::NoConnection;
        }
        if successes as f64 / self.members.len() as f64 >= quorum {
            SendResult::Ok
        } else {
            worst
        }
    }
}

#[async_trait::async_trait]
impl Channel for TeamChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: Payload) -> SendResult {
        let result = match self.policy {
            TeamPolicy::Any => self.send_any(&payload).await,
            TeamPolicy::All { quorum } => self.send_all(&payload, quorum).await,
        };
        match result {
            SendResult::Ok => self.metrics.record_sent(payload.len()),
            _ => {
                let reason = self
                    .last_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "no member reachable".to_string());
                self.metrics.record_failed(reason);
            }
        }
        result
    }

    /// A team never receives; members expose their own streams.
    fn received(&self) -> broadcast::Receiver<Payload> {
        broadcast::channel(1).1
    }

    fn metrics(&self) -> ChannelMetrics {
        self.metrics.snapshot()
    }

    async fn close(&self) {
        for member in &self.members {
            member.close().await;
        }
    }
}
