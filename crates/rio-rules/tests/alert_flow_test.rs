//! End-to-end alert path: parse, dedupe, knowledge, ephemeral rules.

use std::sync::Arc;
use std::time::Duration;

use rio_core::knowledge::Knowledge;
use rio_core::value::Value;
use rio_rules::{AlertProcessor, RuleEngine, RulesetFile, RulesetStore};

fn ruleset_store(dir: &std::path::Path, devices: &[&str]) -> RulesetStore {
    let file: RulesetFile = serde_json::from_str(&format!(
        r#"{{
            "Devices": {devices},
            "Actions": {{
                "warn": [{{"Target": "mail", "Command": "send", "Parameters": {{}}}}]
            }},
            "Ruleset": [
                {{"Id": "storm", "Expression": "tadAlertLevel >= 2",
                  "TimeTrigger": "00:01:00", "Actions": "warn"}}
            ]
        }}"#,
        devices = serde_json::to_string(devices).unwrap()
    ))
    .unwrap();
    let store = RulesetStore::load(dir.join("Ruleset.json")).unwrap();
    store.replace(file).unwrap();
    store
}

fn alert_json(identifier: &str, sender: &str, level: i64) -> String {
    format!(
        r#"{{
            "identifier": "{identifier}",
            "sender": "{sender}",
            "info": [{{
                "source": "dwd",
                "status": "Actual",
                "msgType": "Alert",
                "eventType": "storm",
                "parameters": [{{"valueName": "tadAlertLevel", "value": "{level}"}}]
            }}]
        }}"#
    )
}

#[test]
fn duplicate_identifiers_process_once() {
    let dir = tempfile::tempdir().unwrap();
    let knowledge = Knowledge::new();
    let engine = Arc::new(RuleEngine::new(knowledge.clone()));
    let processor = AlertProcessor::new(
        "D01",
        knowledge,
        engine.clone(),
        ruleset_store(dir.path(), &["tad"]),
    );

    assert!(processor.handle(&alert_json("X", "tad", 3)));
    assert!(!processor.handle(&alert_json("X", "tad", 3)));
    // Exactly one ephemeral rule planted.
    assert_eq!(engine.counts().1, 1);

    // A different identifier is fresh.
    assert!(processor.handle(&alert_json("Y", "tad", 3)));
    assert_eq!(engine.counts().1, 2);
}

#[test]
fn own_alerts_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let knowledge = Knowledge::new();
    let engine = Arc::new(RuleEngine::new(knowledge.clone()));
    let processor = AlertProcessor::new(
        "D01",
        knowledge.clone(),
        engine.clone(),
        ruleset_store(dir.path(), &["D01"]),
    );

    assert!(!processor.handle(&alert_json("X", "D01", 3)));
    assert_eq!(engine.counts().1, 0);
    assert!(knowledge.is_empty());
}

#[test]
fn unmanaged_sender_updates_knowledge_without_rules() {
    let dir = tempfile::tempdir().unwrap();
    let knowledge = Knowledge::new();
    let engine = Arc::new(RuleEngine::new(knowledge.clone()));
    let processor = AlertProcessor::new(
        "D01",
        knowledge.clone(),
        engine.clone(),
        ruleset_store(dir.path(), &["other-device"]),
    );

    assert!(processor.handle(&alert_json("X", "stranger", 3)));
    // Knowledge saw the alert; no rules were planted.
    assert_eq!(
        knowledge.get("stranger_tadAlertLevel"),
        Some(Value::Float(3.0))
    );
    assert_eq!(engine.counts().1, 0);
}

#[test]
fn planted_rule_fires_from_alert_variables() {
    let dir = tempfile::tempdir().unwrap();
    let knowledge = Knowledge::new();
    let engine = Arc::new(RuleEngine::new(knowledge.clone()));
    let processor = AlertProcessor::new(
        "D01",
        knowledge,
        engine.clone(),
        ruleset_store(dir.path(), &["tad"]),
    );

    processor.handle(&alert_json("X", "tad", 3));
    let fired = engine.process();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].label(), "mail.send");
    // The alert's variables were merged into the execution.
    assert_eq!(
        fired[0].parameters.get("eventType"),
        Some(&Value::Str("storm".into()))
    );
    // One-shot: the rule is gone afterwards.
    assert_eq!(engine.counts().1, 0);
}

#[test]
fn re_trigger_window_suppresses_second_fire() {
    let dir = tempfile::tempdir().unwrap();
    let knowledge = Knowledge::new();
    let engine = Arc::new(RuleEngine::new(knowledge.clone()));
    let store = ruleset_store(dir.path(), &["tad"]);
    // Switch the rule to while-true so it stays in the engine.
    let mut file = store.get();
    file.ruleset[0].mode = rio_rules::RuleMode::While;
    store.replace(file).unwrap();

    let processor = AlertProcessor::new("D01", knowledge, engine.clone(), store);
    processor.handle(&alert_json("X", "tad", 3));

    // First tick fires, second tick inside the one-minute window does not.
    assert_eq!(engine.process().len(), 1);
    assert_eq!(engine.process().len(), 0);
    assert_eq!(engine.counts().2, 1);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(engine.process().len(), 0);
}
