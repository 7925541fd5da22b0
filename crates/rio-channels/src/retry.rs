//! Retry decorator with a persistent backlog.
//!
//! Failed payloads go onto a stack and drain as soon as the wrapped
//! channel delivers again. The default drain order is LIFO so the
//! freshest telemetry ships first after an outage; FIFO is available per
//! channel for consumers that want strict chronology.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use rio_core::notify::{Notification, NotifyBus};

use crate::{Channel, ChannelMetrics, Payload, SendResult};

/// How the backlog is drained on recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainOrder {
    /// Most recent failure first.
    #[default]
    Lifo,
    /// Oldest failure first.
    Fifo,
}

/// Backlog counters on top of the wrapped channel's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct RetryMetrics {
    #[serde(flatten)]
    pub channel: ChannelMetrics,
    pub holding: usize,
    pub max_backlog: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_last: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_since: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Backlog {
    /// Stack in push (chronological) order; the top is the end.
    items: Vec<Payload>,
    max_backlog: usize,
    pushes: u64,
    failed_last: Option<DateTime<Utc>>,
    failed_since: Option<DateTime<Utc>>,
}

/// Number of pushes between cumulated-unsent notifications.
const CUMULATE_EVERY: u64 = 500;

pub struct RetryChannel {
    inner: Arc<dyn Channel>,
    backlog: Mutex<Backlog>,
    order: DrainOrder,
    notify: NotifyBus,
}

impl RetryChannel {
    pub fn new(inner: Arc<dyn Channel>, notify: NotifyBus) -> Self {
        Self::with_order(inner, notify, DrainOrder::default())
    }

    pub fn with_order(inner: Arc<dyn Channel>, notify: NotifyBus, order: DrainOrder) -> Self {
        Self {
            inner,
            backlog: Mutex::new(Backlog::default()),
            order,
            notify,
        }
    }

    /// Payloads currently held.
    pub fn holding(&self) -> usize {
        self.backlog.lock().items.len()
    }

    pub fn retry_metrics(&self) -> RetryMetrics {
        let backlog = self.backlog.lock();
        RetryMetrics {
            channel: self.inner.metrics(),
            holding: backlog.items.len(),
            max_backlog: backlog.max_backlog,
            failed_last: backlog.failed_last,
            failed_since: backlog.failed_since,
        }
    }

    /// Chronological snapshot of the backlog as persistence lines.
    pub fn snapshot_lines(&self) -> Vec<String> {
        self.backlog
            .lock()
            .items
            .iter()
            .map(Payload::to_line)
            .collect()
    }

    /// Re-load persisted lines onto the stack and try to drain them.
    ///
    /// Lines arrive in their persisted chronological order, so pushing them
    /// in sequence restores the original stack.
    pub async fn recover(&self, lines: Vec<String>) {
        {
            let mut backlog = self.backlog.lock();
            for line in lines {
                backlog.items.push(Payload::Text(line));
            }
            backlog.max_backlog = backlog.max_backlog.max(backlog.items.len());
        }
        self.drain().await;
    }

    fn push_failed(&self, payload: Payload, error: &str) {
        let (pushes, snapshot, first_failure) = {
            let mut backlog = self.backlog.lock();
            let now = Utc::now();
            backlog.items.push(payload);
            backlog.pushes += 1;
            backlog.max_backlog = backlog.max_backlog.max(backlog.items.len());
            backlog.failed_last = Some(now);
            if backlog.failed_since.is_none() {
                backlog.failed_since = Some(now);
            }
            tracing::debug!(
                channel = self.inner.name(),
                holding = backlog.items.len(),
                error,
                "payload queued for retry"
            );
            let snapshot = if backlog.pushes % CUMULATE_EVERY == 0 {
                Some(backlog.items.iter().map(Payload::to_line).collect::<Vec<_>>())
            } else {
                None
            };
            (backlog.pushes, snapshot, backlog.failed_since)
        };
        if let Some(lines) = snapshot {
            tracing::info!(
                channel = self.inner.name(),
                pushes,
                holding = lines.len(),
                "cumulated unsent payloads"
            );
            self.notify.publish(Notification::CumulatedUnsent {
                channel: self.inner.name().to_string(),
                lines,
                first_failure: first_failure.unwrap_or_else(Utc::now),
            });
        }
    }

    /// Send held payloads until one fails again or the backlog is empty.
    async fn drain(&self) {
        loop {
            let item = {
                let mut backlog = self.backlog.lock();
                match self.order {
                    DrainOrder::Lifo => backlog.items.pop(),
                    DrainOrder::Fifo => {
                        if backlog.items.is_empty() {
                            None
                        } else {
                            Some(backlog.items.remove(0))
                        }
                    }
                }
            };
            let Some(item) = item else {
                let mut backlog = self.backlog.lock();
                backlog.failed_last = None;
                backlog.failed_since = None;
                return;
            };
            if !self.inner.send(item.clone()).await.is_ok() {
                let mut backlog = self.backlog.lock();
                match self.order {
                    DrainOrder::Lifo => backlog.items.push(item),
                    DrainOrder::Fifo => backlog.items.insert(0, item),
                }
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl Channel for RetryChannel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, payload: Payload) -> SendResult {
        match self.inner.send(payload.clone()).await {
            SendResult::Ok => {
                self.drain().await;
                SendResult::Ok
            }
            other => {
                self.push_failed(payload, &format!("{other:?}"));
                other
            }
        }
    }

    fn received(&self) -> broadcast::Receiver<Payload> {
        self.inner.received()
    }

    fn metrics(&self) -> ChannelMetrics {
        self.inner.metrics()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
