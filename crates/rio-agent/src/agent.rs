//! Agent wiring and main loop.
//!
//! Builds every subsystem from the settings file, connects the pumps
//! between them, and blocks until the shutdown signal fires. The
//! shutdown path stops the scheduler first, then the tasks (gracefully
//! unless the shutdown was forced), flushes settings, and reports the
//! process exit code.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use rio_channels::{BacklogFile, Channel, Payload};
use rio_core::knowledge::Knowledge;
use rio_core::message::Message;
use rio_core::notify::{Notification, NotifyBus};
use rio_core::settings::SettingsStore;
use rio_core::value::Value;
use rio_manager::{Manager, PluginRegistry};
use rio_rules::{AlertProcessor, CompiledExpr, Rule, RuleEngine, RulesetStore, Scheduler,
    SYSTEM_RULE_ID};

use crate::admin::AdminServer;
use crate::channels::ChannelSet;
use crate::router::Router;

/// Heartbeat publication interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// How often the display-capability probe refreshes the system rule gate.
const CAPABILITY_PROBE_INTERVAL: Duration = Duration::from_secs(10);

pub struct AgentConfig {
    pub settings_path: PathBuf,
    pub data_dir: PathBuf,
}

/// Run the agent until shutdown. Returns the process exit code: zero on
/// a normal shutdown, non-zero only when settings cannot be written.
pub async fn run(config: AgentConfig) -> anyhow::Result<i32> {
    let (settings_store, mut settings_changed) = SettingsStore::load(&config.settings_path)?;
    let settings = settings_store.get();
    let knowledge = Knowledge::new();
    let notify = NotifyBus::new();

    // A static position makes location variables available to rules on
    // devices without a GPS feature.
    if let Some(location) = settings.location {
        knowledge.set(
            &settings.id,
            [
                ("lat", Value::Float(location.lat)),
                ("lon", Value::Float(location.lon)),
            ],
        );
    }

    let plugins = PluginRegistry::with_builtins(knowledge.clone(), notify.clone());
    let manager = Manager::new(settings_store.clone(), knowledge.clone(), notify.clone(), plugins);
    manager.setup();

    let channels = Arc::new(ChannelSet::build(&settings, notify.clone()));

    // Recover any retry backlog a previous run left behind.
    let backlog_file = BacklogFile::new(config.data_dir.join("retryBuffer.txt"));
    let leftover = backlog_file.rotate_and_read();
    if !leftover.is_empty() {
        channels.telemetry.recover(leftover).await;
    }

    let engine = Arc::new(RuleEngine::new(knowledge.clone()));
    install_system_rule(&engine);

    let (dispatch_tx, mut dispatch_rx) = tokio::sync::mpsc::unbounded_channel();
    let scheduler = Arc::new(Scheduler::new(
        engine.clone(),
        config.data_dir.join("crontab.json"),
        dispatch_tx,
    ));
    scheduler.reload();

    let ruleset = RulesetStore::load(config.data_dir.join("Ruleset.json"))?;
    let alerts = Arc::new(AlertProcessor::new(
        settings.id.clone(),
        knowledge.clone(),
        engine.clone(),
        ruleset.clone(),
    ));

    let router = Arc::new(Router::new(
        manager.clone(),
        scheduler.clone(),
        engine.clone(),
        ruleset,
        channels.clone(),
        config.data_dir.clone(),
    ));

    // The admin port being taken is the one fatal startup condition.
    if settings.admin.enabled {
        AdminServer::start(
            settings.admin.port,
            router.clone(),
            notify.clone(),
            settings.id.clone(),
        )
        .await
        .map_err(|err| {
            error!(port = settings.admin.port, error = %err, "admin port unavailable");
            err
        })?;
    }

    // Settings persister: every mutation notification flushes to disk.
    {
        let store = settings_store.clone();
        tokio::spawn(async move {
            while settings_changed.recv().await.is_some() {
                if let Err(err) = store.save() {
                    warn!(error = %err, "settings persist failed");
                }
            }
        });
    }

    // Retry cumulation persister and telemetry pump share the notify bus.
    {
        let mut rx = notify.subscribe();
        let telemetry = channels.telemetry.clone();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                match notification {
                    Notification::CumulatedUnsent { lines, .. } => {
                        if let Err(err) = backlog_file.write_snapshot(&lines) {
                            warn!(error = %err, "retry snapshot persist failed");
                        }
                    }
                    Notification::Telemetry { source, payload } => {
                        let wire = serde_json::json!({
                            "Source": source,
                            "Timestamp": Utc::now().to_rfc3339(),
                            "Payload": serde_json::Value::from(payload),
                        });
                        telemetry.send(Payload::Text(wire.to_string())).await;
                    }
                    _ => {}
                }
            }
        });
    }

    // Management pump: inbound requests, outbound responses.
    {
        let mut rx = channels.mgmt.received();
        let mgmt = channels.mgmt.clone();
        let router = router.clone();
        let local_id = settings.id.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        let text = String::from_utf8_lossy(payload.as_bytes()).into_owned();
                        let message = Message::parse(&text, &local_id);
                        if let Some(response) = router.handle(message).await {
                            mgmt.send(Payload::Text(response.to_json())).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "management pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // Alert pump.
    {
        let mut rx = channels.alert.received();
        let alerts = alerts.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        let text = String::from_utf8_lossy(payload.as_bytes()).into_owned();
                        alerts.handle(&text);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "alert pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // Scheduler dispatch pump.
    {
        let router = router.clone();
        tokio::spawn(async move {
            while let Some(execution) = dispatch_rx.recv().await {
                router.dispatch(execution).await;
            }
        });
    }

    // Heartbeat.
    {
        let heartbeat = channels.heartbeat.clone();
        let store = settings_store.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tick.tick().await;
                let wire = serde_json::json!({
                    "Timestamp": Utc::now().to_rfc3339(),
                    "Id": store.device_id(),
                });
                heartbeat.send(Payload::Text(wire.to_string())).await;
            }
        });
    }

    // Display-capability probe gating the system rule.
    {
        let manager = manager.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CAPABILITY_PROBE_INTERVAL);
            loop {
                tick.tick().await;
                engine.set_system_enabled(manager.has_capability("display"));
            }
        });
    }

    scheduler.start();
    manager.start_all().await;
    info!(id = %settings.id, "agent running");

    // Block until a confirmed shutdown.
    let mut shutdown = manager.shutdown_signal();
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!(forced = manager.shutdown_was_forced(), "agent stopping");
    scheduler.stop();
    if !manager.shutdown_was_forced() {
        manager.stop_all().await;
    }
    channels.close().await;

    // In-memory state is authoritative; a failed final flush is the only
    // condition worth a non-zero exit.
    match settings_store.save() {
        Ok(()) => Ok(0),
        Err(err) => {
            error!(error = %err, "final settings write failed");
            Ok(1)
        }
    }
}

/// The reserved system rule: reacts to a remote `setPage` addressed to
/// this device, driving the local display task. It stays dormant until a
/// display-capable task is registered.
fn install_system_rule(engine: &Arc<RuleEngine>) {
    let expression = match CompiledExpr::compile("command = 'setPage' AND addresses.Contains(ID)")
    {
        Ok(expression) => expression,
        Err(err) => {
            warn!(error = %err, "system rule unavailable");
            return;
        }
    };
    let action = rio_core::command::Execution::new("display", "setPage")
        .with_parameter("page", Value::Str("$page".into()));
    engine.set_system_rule(Some(Rule::new(
        SYSTEM_RULE_ID,
        expression,
        vec![action],
        Duration::from_secs(1),
    )));
}
