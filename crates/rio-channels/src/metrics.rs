//! Per-channel counters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Counters every channel reports through `status`.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelMetrics {
    pub start: DateTime<Utc>,
    pub sent: u64,
    pub failed: u64,
    pub received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self {
            start: Utc::now(),
            sent: 0,
            failed: 0,
            received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            last_error: None,
        }
    }
}

/// Shared recorder handed to a channel's background tasks.
#[derive(Clone, Default)]
pub struct MetricsHandle {
    inner: Arc<Mutex<ChannelMetrics>>,
}

impl MetricsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        let mut m = self.inner.lock();
        m.sent += 1;
        m.bytes_sent += bytes as u64;
    }

    pub fn record_failed(&self, error: impl Into<String>) {
        let mut m = self.inner.lock();
        m.failed += 1;
        m.last_error = Some(error.into());
    }

    pub fn record_received(&self, bytes: usize) {
        let mut m = self.inner.lock();
        m.received += 1;
        m.bytes_received += bytes as u64;
    }

    pub fn snapshot(&self) -> ChannelMetrics {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let handle = MetricsHandle::new();
        handle.record_sent(10);
        handle.record_sent(5);
        handle.record_failed("boom");
        handle.record_received(3);
        let m = handle.snapshot();
        assert_eq!(m.sent, 2);
        assert_eq!(m.bytes_sent, 15);
        assert_eq!(m.failed, 1);
        assert_eq!(m.received, 1);
        assert_eq!(m.last_error.as_deref(), Some("boom"));
    }
}
