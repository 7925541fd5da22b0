//! Command execution: parse, reflect, dispatch, optional delay.
//!
//! Every invocation — remote `exec` requests, scheduler-fired executions,
//! admin commands — funnels through [`execute`]. Parameters are parsed
//! against the declared command, the call is reflected into the response,
//! and a positive `delay` moves the run onto a worker with the result
//! delivered later over the notify bus.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use rio_core::command::{CommandError, Execution};
use rio_core::message::{Message, MessageType};
use rio_core::notify::Notification;
use rio_core::template::expand_template;
use rio_core::value::{Value, ValueMap};
use rio_core::SYSTEM_TARGET;

use crate::error::ManagerError;
use crate::manager::Manager;

/// Execute `action` on `target` with raw parameters, writing results into
/// `response`.
pub async fn execute(
    manager: &Arc<Manager>,
    target: &str,
    action: &str,
    supplied: &ValueMap,
    response: &mut Message,
) -> Result<(), ManagerError> {
    let command = manager
        .find_command(target, action)
        .ok_or_else(|| CommandError::UnknownCommand {
            target: target.to_string(),
            name: action.to_string(),
        })?;
    let parsed = command.parse(supplied)?;

    // Reflect the invocation so the caller sees what actually ran.
    let mut reflected = parsed.clone();
    reflected.insert("target".into(), Value::Str(target.to_string()));
    reflected.insert("action".into(), Value::Str(action.to_string()));
    response
        .parameters
        .insert("command".into(), Value::Map(reflected));

    let delay = supplied.get("delay").and_then(Value::as_int).unwrap_or(0);
    if delay > 0 {
        let correlation = Uuid::new_v4();
        let label = format!("{target}.{action}");
        response.parameters.insert(
            "execution".into(),
            Value::Str(format!("{label} scheduled")),
        );
        response
            .parameters
            .insert("correlation".into(), Value::Str(correlation.to_string()));

        let manager = Arc::clone(manager);
        let target = target.to_string();
        let action = action.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            let mut scratch = Message::new(MessageType::Response, manager.device_id());
            let error = run(&manager, &target, &action, &parsed, &mut scratch)
                .await
                .err()
                .map(|e| e.to_string());
            info!(execution = %label, ?error, "delayed execution finished");
            manager.notify().publish(Notification::ExecutionResult {
                correlation,
                execution: format!("{label} executed"),
                error,
            });
        });
        return Ok(());
    }

    run(manager, target, action, &parsed, response).await
}

/// Dispatch one prepared [`Execution`] (rule or schedule fired); results
/// go to the notify bus instead of a caller.
pub async fn dispatch_execution(manager: &Arc<Manager>, execution: Execution) {
    let mut scratch = Message::new(MessageType::Response, manager.device_id());
    if let Err(err) = execute(
        manager,
        &execution.target,
        &execution.command,
        &execution.parameters,
        &mut scratch,
    )
    .await
    {
        warn!(execution = %execution.label(), error = %err, "dispatched execution failed");
        manager.notify().publish(Notification::ExecutionResult {
            correlation: Uuid::new_v4(),
            execution: format!("{} executed", execution.label()),
            error: Some(err.to_string()),
        });
    }
}

/// Run a parsed invocation on the system or on matching tasks.
async fn run(
    manager: &Arc<Manager>,
    target: &str,
    action: &str,
    parsed: &ValueMap,
    response: &mut Message,
) -> Result<(), ManagerError> {
    if target == SYSTEM_TARGET || target == manager.device_id() {
        return run_system(manager, action, parsed, response).await;
    }
    let tasks = manager.tasks_snapshot(Some(target));
    if tasks.is_empty() {
        return Err(ManagerError::UnknownTarget(target.to_string()));
    }
    for task in tasks {
        if let Err(err) = task.run(action, parsed, response).await {
            warn!(task = task.name(), action, error = %err, "task command failed");
            response
                .parameters
                .insert("Error".into(), Value::Str(err.to_string()));
        }
    }
    Ok(())
}

/// The agent's own command set.
async fn run_system(
    manager: &Arc<Manager>,
    action: &str,
    parsed: &ValueMap,
    response: &mut Message,
) -> Result<(), ManagerError> {
    match action {
        "execute" => {
            let program = parsed
                .get("program")
                .map(Value::to_text)
                .ok_or_else(|| CommandError::ParameterMissing("program".into()))?;
            // Arguments are templated from knowledge plus the call itself.
            let mut globals = manager.knowledge().all();
            globals.insert("Id".into(), Value::Str(manager.device_id()));
            let arguments = parsed
                .get("arguments")
                .map(Value::to_text)
                .unwrap_or_default();
            let arguments = expand_template(&arguments, &globals, parsed);
            let output = tokio::process::Command::new(&program)
                .args(arguments.split_whitespace())
                .output()
                .await
                .map_err(|err| ManagerError::Lifecycle(err.to_string()))?;
            response.parameters.insert(
                "exit".into(),
                Value::Int(output.status.code().unwrap_or(-1) as i64),
            );
            response.parameters.insert(
                "stdout".into(),
                Value::Str(String::from_utf8_lossy(&output.stdout).into_owned()),
            );
            Ok(())
        }
        "shutdown" => {
            let force = parsed.get("force").and_then(Value::as_bool).unwrap_or(false);
            let outcome = manager.request_shutdown(force);
            response
                .parameters
                .insert("Status".into(), Value::Str(format!("{outcome:?}")));
            Ok(())
        }
        "status" => {
            response.parameters.insert(
                "tasks".into(),
                Value::Array(manager.task_report().into_iter().map(Value::Map).collect()),
            );
            Ok(())
        }
        "list" => {
            let what = parsed
                .get("what")
                .map(Value::to_text)
                .unwrap_or_else(|| "features".to_string());
            let listing: Vec<Value> = match what.as_str() {
                "tasks" => manager
                    .tasks_snapshot(None)
                    .iter()
                    .map(|t| Value::Str(t.name().to_string()))
                    .collect(),
                "drivers" => manager
                    .driver_names()
                    .into_iter()
                    .map(Value::Str)
                    .collect(),
                _ => manager
                    .settings()
                    .get()
                    .features
                    .iter()
                    .map(|f| Value::Str(f.id.clone()))
                    .collect(),
            };
            response
                .parameters
                .insert(what.into(), Value::Array(listing));
            Ok(())
        }
        other => Err(ManagerError::Command(CommandError::UnknownCommand {
            target: SYSTEM_TARGET.to_string(),
            name: other.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PluginRegistry;
    use rio_core::knowledge::Knowledge;
    use rio_core::notify::NotifyBus;
    use rio_core::settings::{FeatureConfig, Settings, SettingsStore};

    fn manager() -> Arc<Manager> {
        let mut settings = Settings::new("D01");
        let mut sim = FeatureConfig::new("sim0", "simulator");
        sim.enabled = true;
        settings.features.push(sim);
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = SettingsStore::in_memory(dir.path().join("s.json"), settings);
        let knowledge = Knowledge::new();
        let notify = NotifyBus::new();
        let plugins = PluginRegistry::with_builtins(knowledge.clone(), notify.clone());
        let manager = Manager::new(store, knowledge, notify, plugins);
        manager.setup();
        manager
    }

    #[tokio::test]
    async fn execute_reflects_and_runs_synchronously() {
        let manager = manager();
        let mut response = Message::new(MessageType::Response, "D01");
        execute(
            &manager,
            "sim0",
            "set",
            &ValueMap::from([("value".to_string(), Value::Str("2.5".into()))]),
            &mut response,
        )
        .await
        .unwrap();

        let reflected = response
            .parameters
            .get("command")
            .and_then(Value::as_map)
            .unwrap();
        assert_eq!(reflected.get("target"), Some(&Value::Str("sim0".into())));
        assert_eq!(reflected.get("action"), Some(&Value::Str("set".into())));
        assert_eq!(reflected.get("value"), Some(&Value::Float(2.5)));
        assert!(response.parameters.contains_key("result"));
        assert_eq!(manager.knowledge().get("sim0_level"), Some(Value::Float(2.5)));
    }

    #[tokio::test]
    async fn missing_required_parameter_aborts_without_state_change() {
        let manager = manager();
        let mut response = Message::new(MessageType::Response, "D01");
        let err = execute(&manager, "sim0", "set", &ValueMap::new(), &mut response)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Command(CommandError::ParameterMissing(_))
        ));
        assert!(manager.knowledge().get("sim0_level").is_none());
    }

    #[tokio::test]
    async fn delayed_execution_acknowledges_then_notifies() {
        let manager = manager();
        let mut rx = manager.notify().subscribe();
        let mut response = Message::new(MessageType::Response, "D01");
        execute(
            &manager,
            "sim0",
            "set",
            &ValueMap::from([
                ("value".to_string(), Value::Float(1.0)),
                ("delay".to_string(), Value::Int(20)),
            ]),
            &mut response,
        )
        .await
        .unwrap();

        assert_eq!(
            response.parameters.get("execution"),
            Some(&Value::Str("sim0.set scheduled".into()))
        );
        assert!(response.parameters.contains_key("correlation"));
        // Nothing ran yet.
        assert!(manager.knowledge().get("sim0_level").is_none());

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match notification {
            Notification::ExecutionResult {
                execution, error, ..
            } => {
                assert_eq!(execution, "sim0.set executed");
                assert!(error.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(manager.knowledge().get("sim0_level"), Some(Value::Float(1.0)));
    }

    #[tokio::test]
    async fn shutdown_command_reports_status() {
        let manager = manager();
        let mut response = Message::new(MessageType::Response, "D01");
        execute(&manager, "RIO", "shutdown", &ValueMap::new(), &mut response)
            .await
            .unwrap();
        assert_eq!(
            response.parameters.get("Status"),
            Some(&Value::Str("Requested".into()))
        );
    }
}
