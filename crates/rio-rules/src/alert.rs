//! Emergency-alert ingest: parsing, dedupe, and rule instantiation.
//!
//! Inbound alert payloads are parsed, deduplicated by identifier within a
//! two-minute window, and turned into knowledge variables plus ephemeral
//! rules from the persisted rule set.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rio_core::knowledge::Knowledge;
use rio_core::value::{Value, ValueMap};

use crate::engine::RuleEngine;
use crate::ruleset::{RuleMode, RulesetStore};

/// Dedupe window for repeated alert identifiers.
pub const DEDUPE_WINDOW: Duration = Duration::from_secs(120);

/// One value entry inside an alert info block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertParameter {
    pub value_name: String,
    pub value: String,
}

/// One info block of an alert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertInfo {
    pub source: String,
    pub status: String,
    pub msg_type: String,
    pub codes: Vec<String>,
    /// Addressed device ids, a string or an array on the wire.
    pub addresses: Option<Value>,
    pub event_type: String,
    pub language: Option<String>,
    pub parameters: Vec<AlertParameter>,
}

/// An inbound emergency alert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Alert {
    pub identifier: String,
    pub sender: String,
    pub sent: Option<String>,
    pub info: Vec<AlertInfo>,
    /// Optional geo areas, passed through untouched.
    pub areas: Vec<Value>,
}

impl Alert {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl AlertInfo {
    /// Variables this info block contributes, numeric-coerced, with the
    /// translations table applied to the event type and codes.
    pub fn variables(&self, translate: impl Fn(&str) -> String) -> ValueMap {
        let mut vars = ValueMap::new();
        vars.insert("source".into(), Value::Str(self.source.clone()));
        vars.insert("status".into(), Value::Str(self.status.clone()));
        vars.insert("msgType".into(), Value::Str(self.msg_type.clone()));
        let codes: Vec<String> = self.codes.iter().map(|c| translate(c)).collect();
        vars.insert("codes".into(), Value::Str(codes.join(",")));
        if let Some(addresses) = &self.addresses {
            vars.insert("addresses".into(), addresses.clone());
        }
        vars.insert(
            "eventType".into(),
            Value::Str(translate(&self.event_type)),
        );
        vars.insert(
            "Language".into(),
            Value::Str(
                self.language
                    .clone()
                    .unwrap_or_else(|| "en-US".to_string()),
            ),
        );
        for parameter in &self.parameters {
            vars.insert(
                parameter.value_name.clone(),
                Value::from_text(&parameter.value),
            );
        }
        vars
    }
}

struct DedupeEntry {
    identifier: String,
    received_at: Instant,
}

/// Sliding-window dedupe on alert identifiers.
pub struct AlertDeduper {
    window: Duration,
    entries: Mutex<Vec<DedupeEntry>>,
}

impl AlertDeduper {
    pub fn new() -> Self {
        Self::with_window(DEDUPE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// True when this identifier has not been seen inside the window.
    /// Expired entries are purged on every check.
    pub fn accept(&self, identifier: &str) -> bool {
        let mut entries = self.entries.lock();
        let window = self.window;
        entries.retain(|entry| entry.received_at.elapsed() <= window);
        if entries.iter().any(|entry| entry.identifier == identifier) {
            return false;
        }
        entries.push(DedupeEntry {
            identifier: identifier.to_string(),
            received_at: Instant::now(),
        });
        true
    }

    pub fn holding(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for AlertDeduper {
    fn default() -> Self {
        Self::new()
    }
}

/// Wires alert payloads into knowledge and the rule engine.
pub struct AlertProcessor {
    local_id: String,
    knowledge: Knowledge,
    engine: std::sync::Arc<RuleEngine>,
    ruleset: RulesetStore,
    deduper: AlertDeduper,
}

impl AlertProcessor {
    pub fn new(
        local_id: impl Into<String>,
        knowledge: Knowledge,
        engine: std::sync::Arc<RuleEngine>,
        ruleset: RulesetStore,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            knowledge,
            engine,
            ruleset,
            deduper: AlertDeduper::new(),
        }
    }

    /// Handle one raw alert payload. Returns true when the alert was fed
    /// to the rule engine (parsed, not own echo, not a duplicate).
    pub fn handle(&self, text: &str) -> bool {
        let alert = match Alert::parse(text) {
            Ok(alert) => alert,
            Err(err) => {
                warn!(error = %err, "unparseable alert payload");
                return false;
            }
        };
        if alert.sender == self.local_id {
            debug!(identifier = %alert.identifier, "own alert echo dropped");
            return false;
        }
        if !self.deduper.accept(&alert.identifier) {
            debug!(identifier = %alert.identifier, "duplicate alert dropped");
            return false;
        }
        self.apply(&alert);
        true
    }

    /// Knowledge updates happen for every accepted alert; rules are
    /// instantiated only when the sender is a known device or the agent
    /// itself.
    fn apply(&self, alert: &Alert) {
        let ruleset = self.ruleset.get();
        let mut merged = ValueMap::new();
        for info in &alert.info {
            let vars = info.variables(|raw| ruleset.translate(raw).to_string());
            self.knowledge.set(&alert.sender, vars.clone());
            if !info.source.is_empty() && info.source != alert.sender {
                self.knowledge.set(&info.source, vars.clone());
            }
            merged.extend(vars);
        }
        self.engine.update(&merged);

        let manage = ruleset.devices.iter().any(|d| d == &alert.sender)
            || alert.sender == self.local_id;
        if !manage {
            debug!(sender = %alert.sender, "alert sender not managed, rules skipped");
            return;
        }

        for config in &ruleset.ruleset {
            match ruleset.build_rule(config) {
                Ok(rule) => {
                    let rule = rule.with_variables(merged.clone());
                    info!(rule = %config.id, mode = ?config.mode, "alert rule planted");
                    match config.mode {
                        RuleMode::Once => self.engine.add_until_true(rule),
                        RuleMode::While => self.engine.add_until_false(rule),
                    }
                }
                Err(err) => {
                    warn!(rule = %config.id, error = %err, "rule skipped");
                }
            }
        }
    }

    pub fn deduper(&self) -> &AlertDeduper {
        &self.deduper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_window_accepts_then_rejects() {
        let deduper = AlertDeduper::with_window(Duration::from_millis(50));
        assert!(deduper.accept("X"));
        assert!(!deduper.accept("X"));
        assert!(deduper.accept("Y"));
        std::thread::sleep(Duration::from_millis(60));
        // Expired: the identifier is fresh again and old entries purged.
        assert!(deduper.accept("X"));
    }

    #[test]
    fn info_variables_are_extracted_and_coerced() {
        let alert = Alert::parse(
            r#"{
                "identifier": "A1",
                "sender": "tad",
                "info": [{
                    "source": "dwd",
                    "status": "Actual",
                    "msgType": "Alert",
                    "codes": ["BBK-EVC-040"],
                    "addresses": "D01,D02",
                    "eventType": "storm",
                    "parameters": [
                        {"valueName": "tadAlertLevel", "value": "3"},
                        {"valueName": "region", "value": "north"}
                    ]
                }]
            }"#,
        )
        .unwrap();
        let vars = alert.info[0].variables(|raw| raw.to_string());
        assert_eq!(vars.get("tadAlertLevel"), Some(&Value::Int(3)));
        assert_eq!(vars.get("region"), Some(&Value::Str("north".into())));
        assert_eq!(vars.get("Language"), Some(&Value::Str("en-US".into())));
        assert_eq!(vars.get("codes"), Some(&Value::Str("BBK-EVC-040".into())));
    }
}
