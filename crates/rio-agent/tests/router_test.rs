//! Router behaviour against a fully wired (but offline) agent core.

use std::sync::Arc;

use rio_agent::channels::ChannelSet;
use rio_agent::router::Router;
use rio_core::knowledge::Knowledge;
use rio_core::message::{Message, MessageType};
use rio_core::notify::NotifyBus;
use rio_core::settings::{FeatureConfig, Settings, SettingsStore};
use rio_core::value::{Value, ValueMap};
use rio_manager::{Manager, PluginRegistry};
use rio_rules::{RuleEngine, RulesetStore, Scheduler};

struct Fixture {
    router: Router,
    manager: Arc<Manager>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();

    let mut settings = Settings::new("D01");
    settings.broker.host = String::new();
    let mut sim = FeatureConfig::new("sim0", "simulator");
    sim.enabled = true;
    settings.features.push(sim);

    let (store, _rx) = SettingsStore::in_memory(dir.path().join("settings.json"), settings);
    let knowledge = Knowledge::new();
    let notify = NotifyBus::new();
    let plugins = PluginRegistry::with_builtins(knowledge.clone(), notify.clone());
    let manager = Manager::new(store, knowledge.clone(), notify.clone(), plugins);
    manager.setup();

    let channels = Arc::new(ChannelSet::build(&manager.settings().get(), notify));
    let engine = Arc::new(RuleEngine::new(knowledge));
    let (tx, _dispatch_rx) = tokio::sync::mpsc::unbounded_channel();
    let scheduler = Arc::new(Scheduler::new(
        engine.clone(),
        dir.path().join("crontab.json"),
        tx,
    ));
    let ruleset = RulesetStore::load(dir.path().join("Ruleset.json")).unwrap();

    let router = Router::new(
        manager.clone(),
        scheduler,
        engine,
        ruleset,
        channels,
        dir.path().to_path_buf(),
    );
    Fixture {
        router,
        manager,
        _dir: dir,
    }
}

fn request(message_type: MessageType) -> Message {
    Message::new(message_type, "ops").with_id("42")
}

#[tokio::test]
async fn own_echo_is_ignored() {
    let fx = fixture();
    let echo = Message::new(MessageType::Status, "D01");
    assert!(fx.router.handle(echo).await.is_none());
}

#[tokio::test]
async fn status_reports_tasks_channels_and_id() {
    let fx = fixture();
    let response = fx.router.handle(request(MessageType::Status)).await.unwrap();
    assert!(response.is_valid);
    assert_eq!(response.source, "D01");
    assert_eq!(response.id.as_deref(), Some("42"));
    assert_eq!(response.parameters.get("Id"), Some(&Value::Str("D01".into())));
    assert!(response.parameters.contains_key("tasks"));
    let channels = response
        .parameters
        .get("channels")
        .and_then(Value::as_map)
        .unwrap();
    assert!(channels.contains_key("telemetry"));
    assert!(channels.contains_key("mgmt"));
}

#[tokio::test]
async fn two_step_shutdown_over_the_router() {
    let fx = fixture();
    let mut signal = fx.manager.shutdown_signal();

    let first = fx
        .router
        .handle(request(MessageType::Shutdown))
        .await
        .unwrap();
    assert_eq!(
        first.parameters.get("Status"),
        Some(&Value::Str("Requested".into()))
    );
    assert!(!*signal.borrow_and_update());

    let second = fx
        .router
        .handle(request(MessageType::Shutdown))
        .await
        .unwrap();
    assert_eq!(
        second.parameters.get("Status"),
        Some(&Value::Str("Confirmed".into()))
    );
    assert!(*signal.borrow_and_update());
}

#[tokio::test]
async fn lifecycle_round_trip() {
    let fx = fixture();
    let stop = request(MessageType::Stop).with_parameter("target", Value::Str("sim0".into()));
    let response = fx.router.handle(stop).await.unwrap();
    assert_eq!(response.parameters.get("sim0"), Some(&Value::Str("OK".into())));

    let disable =
        request(MessageType::Disable).with_parameter("target", Value::Str("simulator".into()));
    fx.router.handle(disable).await.unwrap();
    let stop = request(MessageType::Stop).with_parameter("target", Value::Str("sim0".into()));
    fx.router.handle(stop).await.unwrap();
    assert!(fx.manager.tasks_snapshot(None).is_empty());

    let enable =
        request(MessageType::Enable).with_parameter("target", Value::Str("sim0".into()));
    let response = fx.router.handle(enable).await.unwrap();
    assert_eq!(response.parameters.get("sim0"), Some(&Value::Str("OK".into())));
    assert_eq!(fx.manager.tasks_snapshot(None).len(), 1);
}

#[tokio::test]
async fn list_and_help_enumerate() {
    let fx = fixture();
    let list = request(MessageType::List).with_parameter("what", Value::Str("drivers".into()));
    let response = fx.router.handle(list).await.unwrap();
    assert_eq!(
        response.parameters.get("drivers"),
        Some(&Value::Array(vec![Value::Str("simulator".into())]))
    );

    let help = request(MessageType::Help)
        .with_parameter("target", Value::Str("sim0".into()))
        .with_parameter("action", Value::Str("set".into()));
    let response = fx.router.handle(help).await.unwrap();
    let params = response
        .parameters
        .get("sim0.set")
        .and_then(Value::as_array)
        .unwrap();
    assert_eq!(params.len(), 1);
}

#[tokio::test]
async fn exec_runs_a_task_command() {
    let fx = fixture();
    let exec = request(MessageType::Exec)
        .with_parameter("target", Value::Str("sim0".into()))
        .with_parameter("action", Value::Str("set".into()))
        .with_parameter("value", Value::Float(7.0));
    let response = fx.router.handle(exec).await.unwrap();
    assert!(response.parameters.contains_key("command"));
    assert!(response.parameters.contains_key("result"));
    assert_eq!(
        fx.manager.knowledge().get("sim0_level"),
        Some(Value::Float(7.0))
    );
}

#[tokio::test]
async fn schedule_variables_round_trip() {
    let fx = fixture();
    let set = request(MessageType::Schedule)
        .with_parameter("command", Value::Str("set".into()))
        .with_parameter("name", Value::Str("gps_max".into()))
        .with_parameter("value", Value::Str("99".into()));
    fx.router.handle(set).await.unwrap();

    let get = request(MessageType::Schedule)
        .with_parameter("command", Value::Str("get".into()))
        .with_parameter("name", Value::Str("gps_max".into()));
    let response = fx.router.handle(get).await.unwrap();
    assert_eq!(response.parameters.get("gps_max"), Some(&Value::Float(99.0)));
}

#[tokio::test]
async fn config_reads_and_writes_properties() {
    let fx = fixture();
    let set = request(MessageType::Config)
        .with_parameter("target", Value::Str("sim0".into()))
        .with_parameter(
            "properties",
            Value::Map(ValueMap::from([(
                "interval".to_string(),
                Value::Int(3),
            )])),
        );
    fx.router.handle(set).await.unwrap();

    let get = request(MessageType::Config).with_parameter("target", Value::Str("sim0".into()));
    let response = fx.router.handle(get).await.unwrap();
    let properties = response
        .parameters
        .get("sim0")
        .and_then(Value::as_map)
        .unwrap();
    assert_eq!(properties.get("interval"), Some(&Value::Int(3)));
}

#[tokio::test]
async fn rename_changes_the_device_id() {
    let fx = fixture();
    let rename = request(MessageType::Name).with_parameter("name", Value::Str("D99".into()));
    let response = fx.router.handle(rename).await.unwrap();
    assert_eq!(response.parameters.get("Id"), Some(&Value::Str("D99".into())));
    assert_eq!(fx.manager.device_id(), "D99");

    // Responses still come from the (new) local id.
    let status = fx.router.handle(request(MessageType::Status)).await.unwrap();
    assert_eq!(status.source, "D99");
}

#[tokio::test]
async fn invalid_message_reflects_the_parse_error() {
    let fx = fixture();
    let broken = Message::parse("{not json", "ops");
    let response = fx.router.handle(broken).await.unwrap();
    assert_eq!(response.message_type, MessageType::Error);
    assert!(response.parameters.contains_key("error"));
    assert!(response.parameters.contains_key("text"));
    assert!(response.is_valid);
}
