//! Notification bus.
//!
//! Cross-subsystem events (manager notices, delayed execution results,
//! telemetry, retry cumulation) travel over one bounded broadcast channel.
//! Subscribers that fall behind skip ahead instead of blocking publishers.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::value::Value;

/// Default buffered capacity of the notify bus.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

/// Events published on the notify bus.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Manager lifecycle notice (enable, disable, start, stop, shutdown).
    Manager { text: String },

    /// A delayed execution finished.
    ExecutionResult {
        correlation: Uuid,
        execution: String,
        error: Option<String>,
    },

    /// Plugin telemetry on its way out.
    Telemetry { source: String, payload: Value },

    /// A retry channel accumulated another batch of unsent payloads.
    CumulatedUnsent {
        channel: String,
        /// Chronological snapshot of the backlog.
        lines: Vec<String>,
        first_failure: DateTime<Utc>,
    },
}

impl Notification {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Manager { .. } => "Manager",
            Self::ExecutionResult { .. } => "Execution Result",
            Self::Telemetry { .. } => "telemetry",
            Self::CumulatedUnsent { .. } => "CumulatedUnsent",
        }
    }

    /// One-line rendering for admin-client broadcast.
    pub fn render(&self) -> String {
        match self {
            Self::Manager { text } => format!("[Manager] {text}"),
            Self::ExecutionResult {
                correlation,
                execution,
                error,
            } => format!(
                "[Execution Result] {execution} ({correlation}): {}",
                error.as_deref().unwrap_or("none")
            ),
            Self::Telemetry { source, payload } => format!("[telemetry] {source}: {payload}"),
            Self::CumulatedUnsent {
                channel,
                lines,
                first_failure,
            } => format!(
                "[CumulatedUnsent] {channel}: {} payloads since {first_failure}",
                lines.len()
            ),
        }
    }
}

/// Broadcast bus for [`Notification`]s. Cheap to clone.
#[derive(Clone)]
pub struct NotifyBus {
    tx: broadcast::Sender<Notification>,
}

impl NotifyBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. Returns true when at least one
    /// subscriber existed.
    pub fn publish(&self, notification: Notification) -> bool {
        self.tx.send(notification).is_ok()
    }

    pub fn subscribe(&self) -> NotifyReceiver {
        NotifyReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotifyBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of the notify bus.
pub struct NotifyReceiver {
    rx: broadcast::Receiver<Notification>,
}

impl NotifyReceiver {
    /// Receive the next notification, or `None` once the bus is closed.
    /// A lagged receiver skips the overwritten entries and keeps going.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "notify subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = NotifyBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert!(bus.publish(Notification::Manager {
            text: "started".into()
        }));
        assert_eq!(a.recv().await.unwrap().type_name(), "Manager");
        assert_eq!(b.recv().await.unwrap().type_name(), "Manager");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_discarded() {
        let bus = NotifyBus::new();
        assert!(!bus.publish(Notification::Manager { text: "x".into() }));
    }

    #[test]
    fn render_is_short_and_typed() {
        let n = Notification::ExecutionResult {
            correlation: Uuid::nil(),
            execution: "gps.poll".into(),
            error: None,
        };
        assert!(n.render().contains("gps.poll"));
        assert!(n.render().ends_with("none"));
    }
}
