//! Module manager: plugin binding, task lifecycle, and the command table.
//!
//! The manager owns every running task. Startup binds each registered
//! plugin to a feature config (creating a disabled default when none
//! exists), indexes declared commands, instantiates tasks for enabled
//! features, and starts them in registration order. All lifecycle
//! operations go through here and persist their settings changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use rio_core::command::{Command, ParamType, ParameterDefinition};
use rio_core::knowledge::Knowledge;
use rio_core::notify::{Notification, NotifyBus};
use rio_core::settings::{FeatureConfig, SettingsStore};
use rio_core::value::{Value, ValueMap};
use rio_core::SYSTEM_TARGET;

use crate::error::ManagerError;
use crate::feature::{Feature, Task};
use crate::registry::PluginRegistry;

/// Window in which a second `shutdown` request confirms the first.
pub const SHUTDOWN_ARM_WINDOW: Duration = Duration::from_secs(10);

/// Outcome of a shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// First request: armed, waiting for confirmation.
    Requested,
    /// Second request inside the window, or a forced request.
    Confirmed,
}

struct TaskEntry {
    feature_id: String,
    feature_type: String,
    task: Arc<dyn Task>,
}

pub struct Manager {
    settings: SettingsStore,
    knowledge: Knowledge,
    notify: NotifyBus,
    plugins: PluginRegistry,
    tasks: Mutex<Vec<TaskEntry>>,
    commands: Mutex<HashMap<String, Command>>,
    shutdown_armed: Mutex<Option<Instant>>,
    shutdown_forced: std::sync::atomic::AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Manager {
    pub fn new(
        settings: SettingsStore,
        knowledge: Knowledge,
        notify: NotifyBus,
        plugins: PluginRegistry,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            knowledge,
            notify,
            plugins,
            tasks: Mutex::new(Vec::new()),
            commands: Mutex::new(HashMap::new()),
            shutdown_armed: Mutex::new(None),
            shutdown_forced: std::sync::atomic::AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn knowledge(&self) -> &Knowledge {
        &self.knowledge
    }

    pub fn notify(&self) -> &NotifyBus {
        &self.notify
    }

    pub fn device_id(&self) -> String {
        self.settings.device_id()
    }

    /// Subscribe to the process shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Bind plugins to settings, index commands, and create tasks for
    /// enabled features. Tasks are not started yet.
    pub fn setup(&self) {
        // Every known plugin gets at least a disabled default feature.
        for plugin in self.plugins.all() {
            let missing = self
                .settings
                .get()
                .features
                .iter()
                .all(|f| f.feature_type != plugin.name());
            if missing {
                let config = default_config(plugin.as_ref());
                info!(plugin = plugin.name(), "default feature added");
                self.settings.mutate(|s| s.features.push(config));
            }
            let mut commands = self.commands.lock();
            for command in plugin.declared_commands() {
                commands.insert(command.key(), command);
            }
        }
        for command in system_commands() {
            self.commands.lock().insert(command.key(), command);
        }

        let settings = self.settings.get();
        for config in settings.features.iter().filter(|f| f.enabled) {
            self.create_tasks_for(config);
        }
        let task_count = self.tasks.lock().len();
        info!(
            plugins = self.plugins.len(),
            tasks = task_count,
            "manager ready"
        );
    }

    fn create_tasks_for(&self, config: &FeatureConfig) {
        let Some(plugin) = self.plugins.find(&config.feature_type) else {
            warn!(feature = %config.id, kind = %config.feature_type, "no plugin for feature");
            return;
        };
        let settings = self.settings.get();
        let mut tasks = self.tasks.lock();
        // Exactly one task set per (feature id, plugin).
        if tasks.iter().any(|entry| entry.feature_id == config.id) {
            return;
        }
        for task in plugin.create_tasks(&settings, config) {
            info!(feature = %config.id, task = task.name(), "task registered");
            tasks.push(TaskEntry {
                feature_id: config.id.clone(),
                feature_type: config.feature_type.clone(),
                task,
            });
        }
    }

    /// Start every registered task, in registration order.
    pub async fn start_all(&self) {
        for task in self.tasks_snapshot(None) {
            task.start().await;
        }
    }

    // -----------------------------------------------------------------
    // Command table
    // -----------------------------------------------------------------

    /// Resolve a command: target may be a plugin type, a feature id, or
    /// the reserved system identifier.
    pub fn find_command(&self, target: &str, name: &str) -> Option<Command> {
        let commands = self.commands.lock();
        if let Some(command) = commands.get(&format!("{target}+{name}")) {
            return Some(command.clone());
        }
        // A feature id resolves through its plugin type.
        let feature_type = self.find_feature(target)?.feature_type;
        commands.get(&format!("{feature_type}+{name}")).cloned()
    }

    /// Feature lookup: by type first, then by id.
    pub fn find_feature(&self, target: &str) -> Option<FeatureConfig> {
        let settings = self.settings.get();
        settings
            .features
            .iter()
            .find(|f| f.feature_type == target)
            .or_else(|| settings.features.iter().find(|f| f.id == target))
            .cloned()
    }

    /// Resolve a request's targets to features. The device id and the
    /// reserved system identifier inject a synthetic feature describing
    /// the agent itself.
    pub fn select_features(&self, targets: &[String]) -> Vec<FeatureConfig> {
        let device_id = self.device_id();
        let mut selected: Vec<FeatureConfig> = Vec::new();
        for target in targets {
            if target == SYSTEM_TARGET || *target == device_id {
                selected.push(self.synthetic_feature());
                continue;
            }
            if let Some(feature) = self.find_feature(target) {
                if selected.iter().all(|f| f.id != feature.id) {
                    selected.push(feature);
                }
            }
        }
        selected
    }

    /// The agent itself, presented as a feature.
    pub fn synthetic_feature(&self) -> FeatureConfig {
        let mut config = FeatureConfig::new(self.device_id(), SYSTEM_TARGET);
        config.enabled = true;
        config.version = env!("CARGO_PKG_VERSION").to_string();
        config
    }

    /// Declared commands for a target, for the help listing.
    pub fn commands_for(&self, target: &str) -> Vec<Command> {
        let feature_type = self
            .find_feature(target)
            .map(|f| f.feature_type)
            .unwrap_or_else(|| target.to_string());
        let mut commands: Vec<Command> = self
            .commands
            .lock()
            .values()
            .filter(|c| c.target == feature_type)
            .cloned()
            .collect();
        commands.sort_by(|a, b| a.name.cmp(&b.name));
        commands
    }

    pub fn all_commands(&self) -> Vec<Command> {
        let mut commands: Vec<Command> = self.commands.lock().values().cloned().collect();
        commands.sort_by(|a, b| a.key().cmp(&b.key()));
        commands
    }

    // -----------------------------------------------------------------
    // Task access
    // -----------------------------------------------------------------

    /// Tasks, optionally filtered to features matching `target` (type or
    /// id).
    pub fn tasks_snapshot(&self, target: Option<&str>) -> Vec<Arc<dyn Task>> {
        self.tasks
            .lock()
            .iter()
            .filter(|entry| match target {
                Some(target) => entry.feature_type == target || entry.feature_id == target,
                None => true,
            })
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Status lines of every registered task.
    pub fn task_report(&self) -> Vec<ValueMap> {
        self.tasks
            .lock()
            .iter()
            .map(|entry| {
                ValueMap::from([
                    ("name".to_string(), Value::Str(entry.task.name().to_string())),
                    ("feature".to_string(), Value::Str(entry.feature_id.clone())),
                    ("type".to_string(), Value::Str(entry.feature_type.clone())),
                    (
                        "status".to_string(),
                        Value::Str(entry.task.status()),
                    ),
                    ("metrics".to_string(), Value::Map(entry.task.metrics())),
                ])
            })
            .collect()
    }

    /// True when any registered task advertises the capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.tasks
            .lock()
            .iter()
            .any(|entry| entry.task.has_capability(capability))
    }

    pub fn driver_names(&self) -> Vec<String> {
        self.plugins.names()
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Enable a feature: mark it, create its tasks, persist.
    pub fn enable(&self, target: &str) -> Result<(), ManagerError> {
        let feature = self
            .find_feature(target)
            .ok_or_else(|| ManagerError::UnknownTarget(target.to_string()))?;
        self.settings.mutate(|s| {
            if let Some(f) = s.feature_mut(&feature.id) {
                f.enabled = true;
            }
        });
        let updated = self
            .find_feature(&feature.id)
            .ok_or_else(|| ManagerError::UnknownTarget(target.to_string()))?;
        self.create_tasks_for(&updated);
        self.notice(format!("feature {} enabled", feature.id));
        Ok(())
    }

    /// Disable a feature. Existing tasks keep running until `stop`.
    pub fn disable(&self, target: &str) -> Result<(), ManagerError> {
        let feature = self
            .find_feature(target)
            .ok_or_else(|| ManagerError::UnknownTarget(target.to_string()))?;
        self.settings.mutate(|s| {
            if let Some(f) = s.feature_mut(&feature.id) {
                f.enabled = false;
            }
        });
        self.notice(format!("feature {} disabled", feature.id));
        Ok(())
    }

    /// Start tasks of enabled features matching the target.
    pub async fn start(&self, target: &str) -> Result<(), ManagerError> {
        let feature = self
            .find_feature(target)
            .ok_or_else(|| ManagerError::UnknownTarget(target.to_string()))?;
        if !feature.enabled {
            return Err(ManagerError::NotEnabled(feature.id));
        }
        for task in self.tasks_snapshot(Some(&feature.id)) {
            task.start().await;
        }
        self.notice(format!("feature {} started", feature.id));
        Ok(())
    }

    /// Stop tasks of matching features; a disabled feature's tasks are
    /// removed from the registry afterwards.
    pub async fn stop(&self, target: &str) -> Result<(), ManagerError> {
        let feature = self
            .find_feature(target)
            .ok_or_else(|| ManagerError::UnknownTarget(target.to_string()))?;
        for task in self.tasks_snapshot(Some(&feature.id)) {
            task.stop().await;
        }
        if !feature.enabled {
            self.tasks
                .lock()
                .retain(|entry| entry.feature_id != feature.id);
            info!(feature = %feature.id, "tasks removed");
        }
        self.notice(format!("feature {} stopped", feature.id));
        Ok(())
    }

    /// Merge properties into a feature; changed values are mirrored into
    /// knowledge under `<featureId>_<key>` and the settings persisted.
    pub fn configure(&self, target: &str, properties: &ValueMap) -> Result<(), ManagerError> {
        let feature = self
            .find_feature(target)
            .ok_or_else(|| ManagerError::UnknownTarget(target.to_string()))?;
        let mut changed = ValueMap::new();
        self.settings.mutate(|s| {
            if let Some(f) = s.feature_mut(&feature.id) {
                for (name, value) in properties {
                    if f.properties.get(name) != Some(value) {
                        changed.insert(name.clone(), value.clone());
                    }
                    f.properties.insert(name.clone(), value.clone());
                }
            }
        });
        if !changed.is_empty() {
            self.knowledge.set(&feature.id, changed);
        }
        Ok(())
    }

    /// Two-step shutdown: the first call arms a 10 second window and
    /// reports `Requested`; a second call inside the window (or `force`)
    /// confirms and raises the process shutdown signal.
    pub fn request_shutdown(&self, force: bool) -> ShutdownOutcome {
        let mut armed = self.shutdown_armed.lock();
        let confirm = force
            || matches!(*armed, Some(at) if at.elapsed() <= SHUTDOWN_ARM_WINDOW);
        if confirm {
            *armed = None;
            if force {
                self.shutdown_forced
                    .store(true, std::sync::atomic::Ordering::SeqCst);
            }
            self.notice("shutdown confirmed".to_string());
            let _ = self.shutdown_tx.send(true);
            ShutdownOutcome::Confirmed
        } else {
            *armed = Some(Instant::now());
            self.notice("shutdown requested".to_string());
            ShutdownOutcome::Requested
        }
    }

    /// Whether the confirmed shutdown asked for an immediate exit.
    pub fn shutdown_was_forced(&self) -> bool {
        self.shutdown_forced
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Stop every task, awaiting each. Used by the graceful shutdown path.
    pub async fn stop_all(&self) {
        for task in self.tasks_snapshot(None) {
            task.stop().await;
        }
    }

    fn notice(&self, text: String) {
        info!("{text}");
        self.notify.publish(Notification::Manager { text });
    }
}

fn default_config(plugin: &dyn Feature) -> FeatureConfig {
    let mut config = FeatureConfig::new(plugin.name(), plugin.name());
    config.version = plugin.version().to_string();
    for property in plugin.declared_properties() {
        config.properties.insert(property.name, property.default);
    }
    config
}

/// Commands the agent itself answers, indexed under the system target.
fn system_commands() -> Vec<Command> {
    vec![
        Command::new(SYSTEM_TARGET, "execute")
            .with_parameter(ParameterDefinition::new("program", ParamType::String).required())
            .with_parameter(ParameterDefinition::new("arguments", ParamType::String)),
        Command::new(SYSTEM_TARGET, "shutdown")
            .with_parameter(ParameterDefinition::new("force", ParamType::Bool)),
        Command::new(SYSTEM_TARGET, "status"),
        Command::new(SYSTEM_TARGET, "list").with_parameter(
            ParameterDefinition::new("what", ParamType::String)
                .with_domain(vec!["features".into(), "tasks".into(), "drivers".into()]),
        ),
    ]
}
