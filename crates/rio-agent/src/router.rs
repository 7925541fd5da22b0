//! Management request router.
//!
//! Every management message — from the broker topic, the admin socket, or
//! a Test.json replay — lands here. Dispatch is by message type; each
//! handler fills a response that always carries the local id as source.
//! A message whose source is the local id is an echo and is ignored.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use rio_core::command::Execution;
use rio_core::message::{Message, MessageType};
use rio_core::value::{Value, ValueMap};
use rio_core::SYSTEM_TARGET;
use rio_manager::{dispatch_execution, execute, Manager};
use rio_rules::{RuleEngine, RulesetFile, RulesetStore, Scheduler};

use crate::channels::ChannelSet;

pub struct Router {
    manager: Arc<Manager>,
    scheduler: Arc<Scheduler>,
    engine: Arc<RuleEngine>,
    ruleset: RulesetStore,
    channels: Arc<ChannelSet>,
    /// Directory media updates are written into.
    media_dir: PathBuf,
    /// Test.json location for the `test` verb.
    test_path: PathBuf,
    started: Instant,
}

impl Router {
    pub fn new(
        manager: Arc<Manager>,
        scheduler: Arc<Scheduler>,
        engine: Arc<RuleEngine>,
        ruleset: RulesetStore,
        channels: Arc<ChannelSet>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            manager,
            scheduler,
            engine,
            ruleset,
            channels,
            media_dir: data_dir.clone(),
            test_path: data_dir.join("Test.json"),
            started: Instant::now(),
        }
    }

    /// Route one message. `None` means no reply is due (own echo).
    pub async fn handle(&self, message: Message) -> Option<Message> {
        let local_id = self.manager.device_id();
        if message.source == local_id {
            return None;
        }
        let mut response = message.response_from(&local_id);

        if !message.is_valid {
            response.message_type = MessageType::Error;
            response.parameters = message.parameters.clone();
            return Some(response);
        }

        match message.message_type {
            MessageType::Status => self.status(&mut response),
            MessageType::Update => self.update(&message, &mut response).await,
            MessageType::Schedule => self.schedule(&message, &mut response).await,
            MessageType::Config => self.config(&message, &mut response),
            MessageType::Enable
            | MessageType::Disable
            | MessageType::Start
            | MessageType::Stop => self.lifecycle(&message, &mut response).await,
            MessageType::List => self.list(&message, &mut response),
            MessageType::Help => self.help(&message, &mut response),
            MessageType::Exec => self.exec(&message, &mut response).await,
            MessageType::Shutdown => self.shutdown(&message, &mut response).await,
            MessageType::Ruleset => self.ruleset(&message, &mut response),
            MessageType::Name => self.rename(&message, &mut response),
            MessageType::Test => self.test(&message, &mut response).await,
            MessageType::Retry => self.retry(&mut response),
            MessageType::Telemetry | MessageType::Response => return None,
            MessageType::History => {
                error_entry(&mut response, "history is a console command");
            }
            MessageType::Error => {
                response.parameters = message.parameters.clone();
                response.message_type = MessageType::Error;
            }
        }
        Some(response)
    }

    fn status(&self, response: &mut Message) {
        let (periodic, until_true, until_false) = self.engine.counts();
        response
            .parameters
            .insert("Id".into(), Value::Str(self.manager.device_id()));
        response.parameters.insert(
            "Uptime".into(),
            Value::Int(self.started.elapsed().as_secs() as i64),
        );
        response.parameters.insert(
            "tasks".into(),
            Value::Array(
                self.manager
                    .task_report()
                    .into_iter()
                    .map(Value::Map)
                    .collect(),
            ),
        );
        response
            .parameters
            .insert("channels".into(), Value::Map(self.channels.metrics_report()));
        response.parameters.insert(
            "rules".into(),
            Value::Map(ValueMap::from([
                ("periodic".to_string(), Value::Int(periodic as i64)),
                ("untilTrue".to_string(), Value::Int(until_true as i64)),
                ("untilFalse".to_string(), Value::Int(until_false as i64)),
            ])),
        );
        response.parameters.insert(
            "knowledge".into(),
            Value::Int(self.manager.knowledge().len() as i64),
        );
    }

    /// Media updates: per entry `ADD` downloads a URL, `DELETE` removes a
    /// file. Each entry reports CONFIRM or ERROR independently.
    async fn update(&self, message: &Message, response: &mut Message) {
        let entries = match message.parameters.get("entries").and_then(Value::as_array) {
            Some(entries) => entries.to_vec(),
            None => {
                error_entry(response, "update needs an entries array");
                return;
            }
        };
        let mut results = Vec::new();
        for entry in &entries {
            let Some(entry) = entry.as_map() else {
                results.push(Value::Str("ERROR: malformed entry".into()));
                continue;
            };
            let action = entry.get("action").map(Value::to_text).unwrap_or_default();
            let file = entry.get("file").map(Value::to_text).unwrap_or_default();
            let result = match action.to_ascii_uppercase().as_str() {
                "ADD" => {
                    let url = entry.get("url").map(Value::to_text).unwrap_or_default();
                    self.download(&url, &file).await
                }
                "DELETE" => std::fs::remove_file(self.media_dir.join(&file))
                    .map_err(|e| e.to_string()),
                other => Err(format!("unknown action {other}")),
            };
            results.push(Value::Str(match result {
                Ok(()) => format!("CONFIRM {file}"),
                Err(err) => format!("ERROR {file}: {err}"),
            }));
        }
        response
            .parameters
            .insert("entries".into(), Value::Array(results));
    }

    async fn download(&self, url: &str, file: &str) -> Result<(), String> {
        if file.is_empty() || file.contains("..") {
            return Err("bad file name".to_string());
        }
        let bytes = reqwest::get(url)
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .bytes()
            .await
            .map_err(|e| e.to_string())?;
        std::fs::write(self.media_dir.join(file), &bytes).map_err(|e| e.to_string())
    }

    /// `schedule` sub-commands: variable get/set, crontab reload, rule
    /// debug listing, or firing a named scheduled command.
    async fn schedule(&self, message: &Message, response: &mut Message) {
        let sub = message
            .parameters
            .get("command")
            .map(Value::to_text)
            .unwrap_or_else(|| "debug".to_string());
        match sub.as_str() {
            "get" => {
                let name = message
                    .parameters
                    .get("name")
                    .map(Value::to_text)
                    .unwrap_or_default();
                let value = self
                    .manager
                    .knowledge()
                    .get(&name)
                    .unwrap_or(Value::Null);
                response.parameters.insert(name, value);
            }
            "set" => {
                let name = message
                    .parameters
                    .get("name")
                    .map(Value::to_text)
                    .unwrap_or_default();
                if name.is_empty() {
                    error_entry(response, "set needs a name");
                    return;
                }
                let value = message
                    .parameters
                    .get("value")
                    .cloned()
                    .unwrap_or(Value::Null);
                self.manager
                    .knowledge()
                    .set_single("schedule", name.clone(), value.clone());
                response.parameters.insert(name, value);
            }
            "reload" => {
                self.scheduler.reload();
                response
                    .parameters
                    .insert("schedules".into(), Value::Int(self.scheduler.schedules().len() as i64));
            }
            "debug" => {
                response.parameters.insert(
                    "rules".into(),
                    Value::Array(
                        self.scheduler
                            .describe()
                            .into_iter()
                            .map(Value::Str)
                            .collect(),
                    ),
                );
                response.parameters.insert(
                    "schedules".into(),
                    Value::Array(
                        self.scheduler
                            .schedules()
                            .into_iter()
                            .map(Value::Str)
                            .collect(),
                    ),
                );
            }
            name => match self.scheduler.command(name) {
                Some(execution) => {
                    info!(command = name, "scheduled command fired by request");
                    dispatch_execution(&self.manager, execution).await;
                    response
                        .parameters
                        .insert("executed".into(), Value::Str(name.to_string()));
                }
                None => error_entry(response, &format!("unknown scheduled command {name}")),
            },
        }
    }

    /// Feature property read/write; targeting the agent itself mutates
    /// the named top-level settings.
    fn config(&self, message: &Message, response: &mut Message) {
        let targets = message.targets();
        if targets.is_empty() {
            error_entry(response, "config needs a target");
            return;
        }
        let properties = message
            .parameters
            .get("properties")
            .and_then(Value::as_map)
            .cloned();
        let local_id = self.manager.device_id();

        for feature in self.manager.select_features(&targets) {
            let is_agent = feature.feature_type == SYSTEM_TARGET;
            match &properties {
                Some(properties) => {
                    if is_agent {
                        let mut applied = ValueMap::new();
                        self.manager.settings().mutate(|settings| {
                            for (name, value) in properties {
                                if settings.set_named(name, value) {
                                    applied.insert(name.clone(), value.clone());
                                }
                            }
                        });
                        response
                            .parameters
                            .insert(local_id.clone(), Value::Map(applied));
                    } else if let Err(err) = self.manager.configure(&feature.id, properties) {
                        error_entry(response, &err.to_string());
                    } else {
                        response
                            .parameters
                            .insert(feature.id.clone(), Value::Map(properties.clone()));
                    }
                }
                None => {
                    let rendered = if is_agent {
                        serde_json::to_value(self.manager.settings().get())
                            .map(Value::from)
                            .unwrap_or(Value::Null)
                    } else {
                        Value::Map(feature.properties.clone())
                    };
                    response.parameters.insert(feature.id.clone(), rendered);
                }
            }
        }
    }

    async fn lifecycle(&self, message: &Message, response: &mut Message) {
        let targets = message.targets();
        if targets.is_empty() {
            error_entry(response, "lifecycle request needs a target");
            return;
        }
        for feature in self.manager.select_features(&targets) {
            let result = match message.message_type {
                MessageType::Enable => self.manager.enable(&feature.id),
                MessageType::Disable => self.manager.disable(&feature.id),
                MessageType::Start => self.manager.start(&feature.id).await,
                MessageType::Stop => self.manager.stop(&feature.id).await,
                _ => unreachable!("non-lifecycle type routed to lifecycle"),
            };
            let entry = match result {
                Ok(()) => Value::Str("OK".into()),
                Err(err) => Value::Str(format!("ERROR: {err}")),
            };
            response.parameters.insert(feature.id.clone(), entry);
        }
    }

    fn list(&self, message: &Message, response: &mut Message) {
        let what = message
            .parameters
            .get("what")
            .map(Value::to_text)
            .unwrap_or_else(|| "features".to_string());
        let selection = message.targets();
        let keep = |name: &str| selection.is_empty() || selection.iter().any(|s| s == name);

        let listing: Vec<Value> = match what.as_str() {
            "tasks" => self
                .manager
                .tasks_snapshot(None)
                .iter()
                .filter(|t| keep(t.name()))
                .map(|t| {
                    Value::Map(ValueMap::from([
                        ("name".to_string(), Value::Str(t.name().to_string())),
                        ("status".to_string(), Value::Str(t.status())),
                    ]))
                })
                .collect(),
            "drivers" => self
                .manager
                .driver_names()
                .into_iter()
                .filter(|name| keep(name))
                .map(Value::Str)
                .collect(),
            _ => self
                .manager
                .settings()
                .get()
                .features
                .iter()
                .filter(|f| keep(&f.id) || keep(&f.feature_type))
                .map(|f| {
                    Value::Map(ValueMap::from([
                        ("id".to_string(), Value::Str(f.id.clone())),
                        ("type".to_string(), Value::Str(f.feature_type.clone())),
                        ("enabled".to_string(), Value::Bool(f.enabled)),
                    ]))
                })
                .collect(),
        };
        response.parameters.insert(what, Value::Array(listing));
    }

    /// Declared commands of a target, or the parameters of one action.
    fn help(&self, message: &Message, response: &mut Message) {
        let targets = message.targets();
        let action = message.parameters.get("action").map(Value::to_text);

        if let (Some(target), Some(action)) = (targets.first(), &action) {
            match self.manager.find_command(target, action) {
                Some(command) => {
                    let params: Vec<Value> = command
                        .parameters
                        .iter()
                        .map(|p| {
                            Value::Map(ValueMap::from([
                                ("name".to_string(), Value::Str(p.name.clone())),
                                (
                                    "type".to_string(),
                                    Value::Str(p.param_type.type_name()),
                                ),
                                ("required".to_string(), Value::Bool(p.required)),
                            ]))
                        })
                        .collect();
                    response
                        .parameters
                        .insert(format!("{target}.{action}"), Value::Array(params));
                }
                None => error_entry(response, &format!("unknown command {target}.{action}")),
            }
            return;
        }

        let commands = match targets.first() {
            Some(target) => self.manager.commands_for(target),
            None => self.manager.all_commands(),
        };
        response.parameters.insert(
            "commands".into(),
            Value::Array(
                commands
                    .iter()
                    .map(|c| Value::Str(format!("{}.{}", c.target, c.name)))
                    .collect(),
            ),
        );
    }

    async fn exec(&self, message: &Message, response: &mut Message) {
        let action = match message.parameters.get("action").map(Value::to_text) {
            Some(action) if !action.is_empty() => action,
            _ => {
                error_entry(response, "exec needs an action");
                return;
            }
        };
        let targets = message.targets();

        // Request context for the system rule: the command name, its
        // addressees, and the local id become visible to conditions like
        // `command = 'setPage' AND addresses.Contains(ID)`.
        let context = ValueMap::from([
            ("command".to_string(), Value::Str(action.clone())),
            ("addresses".to_string(), Value::Str(targets.join(","))),
            ("ID".to_string(), Value::Str(self.manager.device_id())),
        ]);
        self.engine.update(&context);

        // Pseudo-targets: the scheduler's named commands and the rule
        // set's action presets.
        if targets.iter().any(|t| t == "scheduler") {
            match self.scheduler.command(&action) {
                Some(execution) => dispatch_execution(&self.manager, execution).await,
                None => error_entry(response, &format!("unknown scheduled command {action}")),
            }
            return;
        }
        if targets.iter().any(|t| t == "ruleset") {
            match self.ruleset.get().actions.get(&action) {
                Some(preset) => {
                    for execution in preset.clone() {
                        dispatch_execution(&self.manager, execution).await;
                    }
                }
                None => error_entry(response, &format!("unknown preset {action}")),
            }
            return;
        }

        let features = self.manager.select_features(&targets);
        if features.is_empty() {
            error_entry(response, "exec target matched nothing");
            return;
        }
        for feature in features {
            let target = if feature.feature_type == SYSTEM_TARGET {
                SYSTEM_TARGET.to_string()
            } else {
                feature.id.clone()
            };
            if let Err(err) = execute(
                &self.manager,
                &target,
                &action,
                &message.parameters,
                response,
            )
            .await
            {
                warn!(target = %target, action = %action, error = %err, "exec failed");
                error_entry(response, &err.to_string());
            }
        }
    }

    async fn shutdown(&self, message: &Message, response: &mut Message) {
        let force = message
            .parameters
            .get("force")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let outcome = self.manager.request_shutdown(force);
        response
            .parameters
            .insert("Status".into(), Value::Str(format!("{outcome:?}")));
    }

    /// Read or replace the persisted rule set document.
    fn ruleset(&self, message: &Message, response: &mut Message) {
        let sub = message
            .parameters
            .get("command")
            .map(Value::to_text)
            .unwrap_or_else(|| "get".to_string());
        match sub.as_str() {
            "get" => {
                let rendered = serde_json::to_value(self.ruleset.get())
                    .map(Value::from)
                    .unwrap_or(Value::Null);
                response.parameters.insert("ruleset".into(), rendered);
            }
            "set" => {
                let Some(document) = message.parameters.get("ruleset") else {
                    error_entry(response, "ruleset set needs a document");
                    return;
                };
                let parsed: Result<RulesetFile, _> =
                    serde_json::from_value(document.clone().into());
                match parsed {
                    Ok(file) => match self.ruleset.replace(file) {
                        Ok(()) => {
                            response
                                .parameters
                                .insert("ruleset".into(), Value::Str("replaced".into()));
                        }
                        Err(err) => error_entry(response, &err.to_string()),
                    },
                    Err(err) => error_entry(response, &err.to_string()),
                }
            }
            "reload" => {
                if let Err(err) = self.ruleset.reload() {
                    error_entry(response, &err.to_string());
                    return;
                }
                // Settings are re-read on an explicit ruleset reload too.
                if let Err(err) = self.manager.settings().reload() {
                    error_entry(response, &err.to_string());
                    return;
                }
                response
                    .parameters
                    .insert("ruleset".into(), Value::Str("reloaded".into()));
            }
            other => error_entry(response, &format!("unknown ruleset command {other}")),
        }
    }

    fn rename(&self, message: &Message, response: &mut Message) {
        let name = message
            .parameters
            .get("name")
            .map(Value::to_text)
            .unwrap_or_default();
        if name.is_empty() {
            error_entry(response, "name needs a value");
            return;
        }
        self.manager.settings().mutate(|s| s.id = name.clone());
        info!(id = %name, "device renamed");
        response.parameters.insert("Id".into(), Value::Str(name));
    }

    /// Replay a named message array from Test.json through the router.
    async fn test(&self, message: &Message, response: &mut Message) {
        let name = message
            .parameters
            .get("name")
            .map(Value::to_text)
            .unwrap_or_default();
        let text = match std::fs::read_to_string(&self.test_path) {
            Ok(text) => text,
            Err(err) => {
                error_entry(response, &format!("Test.json: {err}"));
                return;
            }
        };
        let suites: std::collections::HashMap<String, Vec<Message>> =
            match serde_json::from_str(&text) {
                Ok(suites) => suites,
                Err(err) => {
                    error_entry(response, &format!("Test.json: {err}"));
                    return;
                }
            };
        let Some(suite) = suites.get(&name) else {
            error_entry(response, &format!("unknown test {name}"));
            return;
        };
        let mut replies = Vec::new();
        for test_message in suite.clone() {
            let reply = Box::pin(self.handle(test_message)).await;
            if let Some(reply) = reply {
                replies.push(Value::Str(reply.to_json()));
            }
        }
        response
            .parameters
            .insert("results".into(), Value::Array(replies));
    }

    fn retry(&self, response: &mut Message) {
        let rendered = serde_json::to_value(self.channels.retry_report())
            .map(Value::from)
            .unwrap_or(Value::Null);
        response.parameters.insert("retry".into(), rendered);
    }

    /// Fire one prepared execution, used by the scheduler pump.
    pub async fn dispatch(&self, execution: Execution) {
        dispatch_execution(&self.manager, execution).await;
    }
}

fn error_entry(response: &mut Message, text: &str) {
    warn!("request error: {text}");
    response
        .parameters
        .insert("Error".into(), Value::Str(text.to_string()));
}
