//! Process-wide knowledge store.
//!
//! Telemetry, settings changes, and alerts all land here as namespaced
//! variables (`<source>_<key>`); the rule engines read consistent snapshots
//! back out. Updates from one source are applied atomically as a unit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::value::{Value, ValueMap};

#[derive(Default)]
struct KnowledgeInner {
    values: ValueMap,
    /// Which value names each source owns, for aging and removal.
    source_keys: HashMap<String, HashSet<String>>,
    aging: HashMap<String, Instant>,
}

/// Shared handle to the knowledge store. Cheap to clone.
#[derive(Clone, Default)]
pub struct Knowledge {
    inner: Arc<RwLock<KnowledgeInner>>,
}

impl Knowledge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `source_key = value` for every entry, as one atomic unit.
    ///
    /// Numeric-looking string values are coerced to floats. A key ending in
    /// `AlertLevel` (case-insensitive) additionally sets the bare `source`
    /// variable to that numeric value, so rules can test the source name
    /// directly.
    pub fn set<I, K>(&self, source: &str, entries: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut inner = self.inner.write();
        let owned = inner.source_keys.entry(source.to_string()).or_default();
        let mut pending: Vec<(String, Value)> = Vec::new();
        for (key, value) in entries {
            let key = key.as_ref();
            let name = format!("{source}_{key}");
            let value = coerce_numeric(value);
            if key.to_ascii_lowercase().ends_with("alertlevel") {
                if let Some(level) = value.as_float() {
                    owned.insert(source.to_string());
                    pending.push((source.to_string(), Value::Float(level)));
                }
            }
            owned.insert(name.clone());
            pending.push((name, value));
        }
        for (name, value) in pending {
            inner.values.insert(name, value);
        }
        inner.aging.insert(source.to_string(), Instant::now());
    }

    /// Set one fully qualified variable owned by `source`.
    pub fn set_single(&self, source: &str, name: impl Into<String>, value: Value) {
        let name = name.into();
        let mut inner = self.inner.write();
        inner
            .source_keys
            .entry(source.to_string())
            .or_default()
            .insert(name.clone());
        inner.values.insert(name, coerce_numeric(value));
    }

    /// Stamp `now` as the source's last update without writing values.
    pub fn update_aging(&self, source: &str) {
        self.inner
            .write()
            .aging
            .insert(source.to_string(), Instant::now());
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().values.get(name).cloned()
    }

    /// Copy of every variable, aged or not. Used by debug listings.
    pub fn all(&self) -> ValueMap {
        self.inner.read().values.clone()
    }

    /// Snapshot for one rule evaluation: variables of sources whose last
    /// update is older than `max_age` are invisible.
    pub fn snapshot(&self, max_age: Duration) -> ValueMap {
        let inner = self.inner.read();
        let now = Instant::now();
        let mut aged_out: HashSet<&String> = HashSet::new();
        for (source, last) in &inner.aging {
            if now.duration_since(*last) > max_age {
                aged_out.insert(source);
            }
        }
        if aged_out.is_empty() {
            return inner.values.clone();
        }
        let mut hidden: HashSet<&String> = HashSet::new();
        for source in aged_out {
            if let Some(keys) = inner.source_keys.get(source) {
                hidden.extend(keys.iter());
            }
        }
        inner
            .values
            .iter()
            .filter(|(name, _)| !hidden.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Drop every variable a source owns, e.g. when its feature is removed.
    pub fn remove_source(&self, source: &str) {
        let mut inner = self.inner.write();
        if let Some(keys) = inner.source_keys.remove(source) {
            for key in keys {
                inner.values.remove(&key);
            }
        }
        inner.aging.remove(source);
    }

    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().values.is_empty()
    }
}

fn coerce_numeric(value: Value) -> Value {
    match value {
        Value::Str(ref s) => {
            if let Ok(f) = s.trim().parse::<f64>() {
                Value::Float(f)
            } else {
                value
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_namespaced_and_coerced() {
        let knowledge = Knowledge::new();
        knowledge.set(
            "gps",
            [
                ("lat", Value::Str("48.1".into())),
                ("fix", Value::Str("ok".into())),
            ],
        );
        assert_eq!(knowledge.get("gps_lat"), Some(Value::Float(48.1)));
        assert_eq!(knowledge.get("gps_fix"), Some(Value::Str("ok".into())));
    }

    #[test]
    fn alert_level_sets_bare_source_key() {
        let knowledge = Knowledge::new();
        knowledge.set("tad", [("SevereAlertLevel", Value::Str("3".into()))]);
        assert_eq!(knowledge.get("tad"), Some(Value::Float(3.0)));
        assert_eq!(knowledge.get("tad_SevereAlertLevel"), Some(Value::Float(3.0)));
    }

    #[test]
    fn aged_sources_are_invisible_to_snapshots() {
        let knowledge = Knowledge::new();
        knowledge.set("fresh", [("v", Value::Int(1))]);
        knowledge.set("stale", [("v", Value::Int(2))]);
        // Backdate the stale source far past any window.
        {
            let mut inner = knowledge.inner.write();
            let past = Instant::now() - Duration::from_secs(3600);
            inner.aging.insert("stale".into(), past);
        }
        let snapshot = knowledge.snapshot(Duration::from_secs(60));
        assert!(snapshot.contains_key("fresh_v"));
        assert!(!snapshot.contains_key("stale_v"));
        // The full view still has it.
        assert!(knowledge.all().contains_key("stale_v"));
    }

    #[test]
    fn remove_source_drops_owned_keys() {
        let knowledge = Knowledge::new();
        knowledge.set("sim", [("a", Value::Int(1)), ("b", Value::Int(2))]);
        knowledge.remove_source("sim");
        assert!(knowledge.get("sim_a").is_none());
        assert!(knowledge.is_empty());
    }
}
