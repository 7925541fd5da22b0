//! The agent's channel wiring.
//!
//! Management, heartbeat, and alert traffic each bind one broker topic on
//! the shared link. Telemetry goes through a retry decorator around a
//! team of broker topic + HTTP ingest, so an outage on either transport
//! queues instead of losing data.

use std::sync::Arc;

use tracing::warn;

use rio_channels::{
    Channel, HttpChannel, MqttChannel, MqttLink, MqttLinkConfig, RetryChannel, RetryMetrics,
    TeamChannel, TeamPolicy,
};
use rio_core::notify::NotifyBus;
use rio_core::settings::Settings;
use rio_core::value::{Value, ValueMap};

/// Topic carrying the periodic heartbeat.
pub const HEARTBEAT_TOPIC: &str = "Heartbeat-Channel";
/// Topic carrying plugin telemetry.
pub const TELEMETRY_TOPIC: &str = "Telemetry-Channel";
/// Topic carrying emergency alerts.
pub const ALERT_TOPIC: &str = "RIO-TAD-Alert";

/// Per-device management topic.
pub fn mgmt_topic(device_id: &str) -> String {
    format!("RIO-{device_id}-Mgmt")
}

pub struct ChannelSet {
    pub link: MqttLink,
    pub mgmt: Arc<MqttChannel>,
    pub heartbeat: Arc<MqttChannel>,
    pub alert: Arc<MqttChannel>,
    /// Retry around a team of broker telemetry + HTTP ingest.
    pub telemetry: Arc<RetryChannel>,
}

impl ChannelSet {
    /// Build every channel from the settings. A missing broker host still
    /// yields a working (if disconnected) set, so the agent can run on
    /// the admin socket alone.
    pub fn build(settings: &Settings, notify: NotifyBus) -> Self {
        let link = if settings.broker.host.is_empty() {
            MqttLink::disconnected()
        } else {
            let mut config = MqttLinkConfig::new(
                &settings.broker.host,
                settings.broker.port,
                format!("rio-{}", settings.id),
            );
            if let (Some(user), Some(pass)) =
                (&settings.broker.username, &settings.broker.password)
            {
                config = config.with_credentials(user, pass);
            }
            MqttLink::connect(config)
        };

        let mgmt = Arc::new(link.channel("mgmt", mgmt_topic(&settings.id), true));
        let heartbeat = Arc::new(link.channel("heartbeat", HEARTBEAT_TOPIC, false));
        let alert = Arc::new(link.channel("alert", ALERT_TOPIC, true));

        let mut members: Vec<Arc<dyn Channel>> =
            vec![Arc::new(link.channel("telemetry", TELEMETRY_TOPIC, false))];
        if let Some(url) = &settings.ingest_url {
            match HttpChannel::new("ingest", url, settings.proxy.as_deref()) {
                Ok(http) => members.push(Arc::new(http)),
                Err(err) => warn!(error = %err, "ingest channel unavailable"),
            }
        }
        let team = Arc::new(TeamChannel::new("telemetry", members, TeamPolicy::Any));
        let telemetry = Arc::new(RetryChannel::new(team, notify));

        Self {
            link,
            mgmt,
            heartbeat,
            alert,
            telemetry,
        }
    }

    /// Metrics of every channel, keyed by name, for the status report.
    pub fn metrics_report(&self) -> ValueMap {
        let mut report = ValueMap::new();
        for (name, metrics) in [
            ("mgmt", self.mgmt.metrics()),
            ("heartbeat", self.heartbeat.metrics()),
            ("alert", self.alert.metrics()),
            ("telemetry", self.telemetry.metrics()),
        ] {
            let value = serde_json::to_value(&metrics)
                .map(Value::from)
                .unwrap_or(Value::Null);
            report.insert(name.to_string(), value);
        }
        report
    }

    pub fn retry_report(&self) -> RetryMetrics {
        self.telemetry.retry_metrics()
    }

    pub async fn close(&self) {
        self.mgmt.close().await;
        self.heartbeat.close().await;
        self.alert.close().await;
        self.telemetry.close().await;
        self.link.shutdown();
    }
}
