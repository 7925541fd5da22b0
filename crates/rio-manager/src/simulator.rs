//! Built-in simulator plugin.
//!
//! Emits a synthetic metric on a fixed interval: a sine sweep around a
//! settable base value. Exists so a bare agent has one working feature to
//! drive the telemetry path, and so the integration tests have a real
//! plugin to exercise the registry with.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use rio_core::command::{Command, CommandError, ParamType, ParameterDefinition};
use rio_core::knowledge::Knowledge;
use rio_core::message::Message;
use rio_core::notify::{Notification, NotifyBus};
use rio_core::settings::{FeatureConfig, Settings};
use rio_core::value::{Value, ValueMap};

use crate::feature::{Feature, PropertyDefinition, Task};

pub const SIMULATOR_TYPE: &str = "simulator";

pub struct SimulatorFeature {
    knowledge: Knowledge,
    notify: NotifyBus,
}

impl SimulatorFeature {
    pub fn new() -> Self {
        Self {
            knowledge: Knowledge::new(),
            notify: NotifyBus::new(),
        }
    }

    /// Bind the shared handles the tasks publish through.
    pub fn with_handles(knowledge: Knowledge, notify: NotifyBus) -> Self {
        Self { knowledge, notify }
    }
}

impl Default for SimulatorFeature {
    fn default() -> Self {
        Self::new()
    }
}

impl Feature for SimulatorFeature {
    fn name(&self) -> &str {
        SIMULATOR_TYPE
    }

    fn version(&self) -> &str {
        "1.1"
    }

    fn declared_properties(&self) -> Vec<PropertyDefinition> {
        vec![
            PropertyDefinition::new("interval", "int", Value::Int(10)),
            PropertyDefinition::new("amplitude", "real", Value::Float(1.0)),
            PropertyDefinition::new("metric", "string", Value::Str("level".into())),
        ]
    }

    fn declared_commands(&self) -> Vec<Command> {
        vec![Command::new(SIMULATOR_TYPE, "set")
            .with_parameter(ParameterDefinition::new("value", ParamType::Real).required())]
    }

    fn create_tasks(&self, _settings: &Settings, config: &FeatureConfig) -> Vec<Arc<dyn Task>> {
        vec![Arc::new(SimulatorTask {
            feature_id: config.id.clone(),
            interval: Duration::from_secs(config.property_int("interval", 10).max(1) as u64),
            amplitude: config.property_float("amplitude", 1.0),
            metric: config.property_string("metric", "level"),
            knowledge: self.knowledge.clone(),
            notify: self.notify.clone(),
            base: Mutex::new(0.0),
            emitted: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(false),
            status: Mutex::new("created".to_string()),
            worker: Mutex::new(None),
        })]
    }
}

pub struct SimulatorTask {
    feature_id: String,
    interval: Duration,
    amplitude: f64,
    metric: String,
    knowledge: Knowledge,
    notify: NotifyBus,
    base: Mutex<f64>,
    emitted: Arc<AtomicU64>,
    running: AtomicBool,
    status: Mutex<String>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Task for SimulatorTask {
    fn name(&self) -> &str {
        &self.feature_id
    }

    fn version(&self) -> &str {
        "1.1"
    }

    fn feature(&self) -> &str {
        &self.feature_id
    }

    fn status(&self) -> String {
        self.status.lock().clone()
    }

    fn metrics(&self) -> ValueMap {
        ValueMap::from([
            (
                "emitted".to_string(),
                Value::Int(self.emitted.load(Ordering::Relaxed) as i64),
            ),
            ("interval".to_string(), Value::Int(self.interval.as_secs() as i64)),
        ])
    }

    async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.status.lock() = "running".to_string();

        let feature_id = self.feature_id.clone();
        let metric = self.metric.clone();
        let interval = self.interval;
        let amplitude = self.amplitude;
        let knowledge = self.knowledge.clone();
        let notify = self.notify.clone();
        let base = *self.base.lock();
        let emitted_handle = self.emitted.clone();

        *self.worker.lock() = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            let mut step = 0u64;
            loop {
                tick.tick().await;
                let value = base + amplitude * (step as f64 * 0.1).sin();
                step += 1;
                emitted_handle.fetch_add(1, Ordering::Relaxed);
                knowledge.set(&feature_id, [(metric.as_str(), Value::Float(value))]);
                let mut payload = ValueMap::new();
                payload.insert(metric.clone(), Value::Float(value));
                notify.publish(Notification::Telemetry {
                    source: feature_id.clone(),
                    payload: Value::Map(payload),
                });
                debug!(feature = %feature_id, value, "simulator sample");
            }
        }));
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        *self.status.lock() = "stopped".to_string();
    }

    async fn run(
        &self,
        action: &str,
        parameters: &ValueMap,
        response: &mut Message,
    ) -> Result<(), CommandError> {
        match action {
            "set" => {
                let value = parameters
                    .get("value")
                    .and_then(Value::as_float)
                    .ok_or_else(|| CommandError::ParameterMissing("value".into()))?;
                *self.base.lock() = value;
                self.knowledge
                    .set(&self.feature_id, [(self.metric.as_str(), Value::Float(value))]);
                response
                    .parameters
                    .insert("result".into(), Value::Str(format!("base set to {value}")));
                Ok(())
            }
            other => Err(CommandError::UnknownCommand {
                target: SIMULATOR_TYPE.to_string(),
                name: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rio_core::message::MessageType;

    fn config() -> FeatureConfig {
        let mut config = FeatureConfig::new("sim0", SIMULATOR_TYPE);
        config.enabled = true;
        config
            .properties
            .insert("interval".into(), Value::Int(1));
        config
    }

    #[tokio::test]
    async fn set_command_updates_base_and_knowledge() {
        let knowledge = Knowledge::new();
        let feature = SimulatorFeature::with_handles(knowledge.clone(), NotifyBus::new());
        let tasks = feature.create_tasks(&Settings::new("D01"), &config());
        let task = &tasks[0];

        let mut response = Message::new(MessageType::Response, "D01");
        task.run(
            "set",
            &ValueMap::from([("value".to_string(), Value::Float(4.5))]),
            &mut response,
        )
        .await
        .unwrap();
        assert_eq!(knowledge.get("sim0_level"), Some(Value::Float(4.5)));
        assert!(response.parameters.contains_key("result"));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears() {
        let feature = SimulatorFeature::new();
        let tasks = feature.create_tasks(&Settings::new("D01"), &config());
        let task = &tasks[0];

        task.start().await;
        task.start().await;
        assert_eq!(task.status(), "running");
        task.stop().await;
        task.stop().await;
        assert_eq!(task.status(), "stopped");
    }

    #[tokio::test]
    async fn emitting_reaches_telemetry_subscribers() {
        let knowledge = Knowledge::new();
        let notify = NotifyBus::new();
        let mut rx = notify.subscribe();
        let feature = SimulatorFeature::with_handles(knowledge.clone(), notify);
        let tasks = feature.create_tasks(&Settings::new("D01"), &config());
        tasks[0].start().await;

        let notification =
            tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap();
        match notification {
            Some(Notification::Telemetry { source, .. }) => assert_eq!(source, "sim0"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(knowledge.get("sim0_level").is_some());
        tasks[0].stop().await;
    }
}
