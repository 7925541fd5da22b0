//! Pub/sub channels over a shared MQTT broker link.
//!
//! One [`MqttLink`] owns the broker connection and its event loop task;
//! each [`MqttChannel`] binds one topic on that link. The event loop keeps
//! polling through connection errors, so the link reconnects on its own
//! and channels only ever see `NoConnection` while the handle is down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{Channel, ChannelMetrics, MetricsHandle, Payload, ReceivedBus, SendResult};

/// Broker endpoint parameters for the shared link.
#[derive(Debug, Clone)]
pub struct MqttLinkConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl MqttLinkConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

type TopicTable = Arc<Mutex<HashMap<String, ReceivedBus>>>;

/// Shared broker connection. Cheap to clone; channels are created from it.
#[derive(Clone)]
pub struct MqttLink {
    client: Arc<Mutex<Option<AsyncClient>>>,
    topics: TopicTable,
}

impl MqttLink {
    /// Connect to the broker and spawn the polling task.
    pub fn connect(config: MqttLinkConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let client_slot: Arc<Mutex<Option<AsyncClient>>> = Arc::new(Mutex::new(Some(client)));
        let topics: TopicTable = Arc::new(Mutex::new(HashMap::new()));

        let loop_topics = topics.clone();
        let reconnect_delay = config.reconnect_delay;
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let bus = loop_topics.lock().get(&publish.topic).cloned();
                        if let Some(bus) = bus {
                            bus.emit(Payload::Bytes(publish.payload.to_vec()));
                        } else {
                            debug!(topic = %publish.topic, "publish on unclaimed topic");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "broker link error, retrying");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });

        Self {
            client: client_slot,
            topics,
        }
    }

    /// A link with no broker behind it; every send is `NoConnection`.
    /// Used when the agent runs without broker settings.
    pub fn disconnected() -> Self {
        Self {
            client: Arc::new(Mutex::new(None)),
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind a channel to `topic`. When `subscribe` is set the topic is
    /// subscribed on construction and inbound publishes surface on the
    /// channel's received stream.
    pub fn channel(&self, name: impl Into<String>, topic: impl Into<String>, subscribe: bool)
        -> MqttChannel
    {
        let topic = topic.into();
        let bus = self
            .topics
            .lock()
            .entry(topic.clone())
            .or_insert_with(ReceivedBus::new)
            .clone();

        if subscribe {
            if let Some(client) = self.client.lock().clone() {
                let sub_topic = topic.clone();
                tokio::spawn(async move {
                    if let Err(err) = client.subscribe(&sub_topic, QoS::AtLeastOnce).await {
                        warn!(topic = %sub_topic, error = %err, "subscribe failed");
                    }
                });
            }
        }

        MqttChannel {
            name: name.into(),
            topic,
            client: self.client.clone(),
            received: bus,
            metrics: MetricsHandle::new(),
        }
    }

    /// Drop the broker handle; subsequent sends report `NoConnection`.
    pub fn shutdown(&self) {
        if let Some(client) = self.client.lock().take() {
            tokio::spawn(async move {
                let _ = client.disconnect().await;
            });
        }
    }
}

/// One topic bound on the shared broker link.
pub struct MqttChannel {
    name: String,
    topic: String,
    client: Arc<Mutex<Option<AsyncClient>>>,
    received: ReceivedBus,
    metrics: MetricsHandle,
}

impl MqttChannel {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait::async_trait]
impl Channel for MqttChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: Payload) -> SendResult {
        let client = match self.client.lock().clone() {
            Some(client) => client,
            None => {
                self.metrics.record_failed("no broker handle");
                return SendResult::NoConnection;
            }
        };
        let bytes = payload.as_bytes().to_vec();
        let size = bytes.len();
        match client
            .publish(&self.topic, QoS::AtLeastOnce, false, bytes)
            .await
        {
            Ok(()) => {
                self.metrics.record_sent(size);
                SendResult::Ok
            }
            Err(err) => {
                self.metrics.record_failed(err.to_string());
                SendResult::Failed
            }
        }
    }

    fn received(&self) -> broadcast::Receiver<Payload> {
        self.received.subscribe()
    }

    fn metrics(&self) -> ChannelMetrics {
        self.metrics.snapshot()
    }

    async fn close(&self) {
        // The link owns the connection; nothing per-topic to release.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnected_link_reports_no_connection() {
        let link = MqttLink::disconnected();
        let channel = link.channel("mgmt", "RIO-D01-Mgmt", false);
        assert_eq!(channel.send("x".into()).await, SendResult::NoConnection);
        assert_eq!(channel.metrics().failed, 1);
    }
}
