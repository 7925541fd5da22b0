//! HTTP ingest channel.
//!
//! Send-only: payloads are posted as UTF-8 JSON. A 409 counts as success
//! because the ingest endpoint answers it for idempotent re-posts.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::{Channel, ChannelMetrics, MetricsHandle, Payload, ReceivedBus, SendResult};

pub struct HttpChannel {
    name: String,
    url: String,
    client: reqwest::Client,
    received: ReceivedBus,
    metrics: MetricsHandle,
}

impl HttpChannel {
    pub fn new(name: impl Into<String>, url: impl Into<String>, proxy: Option<&str>)
        -> Result<Self, reqwest::Error>
    {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client: builder.build()?,
            received: ReceivedBus::new(),
            metrics: MetricsHandle::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Channel for HttpChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: Payload) -> SendResult {
        let size = payload.len();
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.as_bytes().to_vec())
            .send()
            .await;
        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status == reqwest::StatusCode::CONFLICT {
                    self.metrics.record_sent(size);
                    SendResult::Ok
                } else {
                    debug!(status = %status, url = %self.url, "ingest rejected payload");
                    self.metrics.record_failed(format!("status {status}"));
                    SendResult::Failed
                }
            }
            Err(err) => {
                self.metrics.record_failed(err.to_string());
                SendResult::NoConnection
            }
        }
    }

    fn received(&self) -> broadcast::Receiver<Payload> {
        self.received.subscribe()
    }

    fn metrics(&self) -> ChannelMetrics {
        self.metrics.snapshot()
    }

    async fn close(&self) {}
}
