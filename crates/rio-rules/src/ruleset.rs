//! Persisted rule set: device list, translations, action presets, and the
//! rule configurations instantiated on alert processing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use rio_core::command::Execution;

use crate::expr::CompiledExpr;
use crate::rule::Rule;

#[derive(Debug, Error)]
pub enum RulesetError {
    #[error("ruleset file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ruleset parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown action preset: {0}")]
    UnknownPreset(String),

    #[error("rule expression: {0}")]
    Expression(#[from] crate::expr::ExprError),
}

/// Whether an instantiated rule is one-shot or runs while true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    /// Fire once on true, then remove (until-true set).
    #[default]
    Once,
    /// Fire while true, remove when false (until-false set).
    While,
}

/// One configured rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleConfig {
    pub id: String,
    pub expression: String,
    /// Duration string: `HH:MM:SS`, optionally with fractional seconds,
    /// or a plain number of seconds.
    pub time_trigger: String,
    /// Name of the action preset to fire.
    pub actions: String,
    #[serde(default)]
    pub mode: RuleMode,
}

/// `Ruleset.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RulesetFile {
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub translations: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: BTreeMap<String, Vec<Execution>>,
    #[serde(default)]
    pub ruleset: Vec<RuleConfig>,
}

impl RulesetFile {
    /// Instantiate one configured rule, resolving its action preset.
    pub fn build_rule(&self, config: &RuleConfig) -> Result<Rule, RulesetError> {
        let actions = self
            .actions
            .get(&config.actions)
            .cloned()
            .ok_or_else(|| RulesetError::UnknownPreset(config.actions.clone()))?;
        let expression = CompiledExpr::compile(&config.expression)?;
        Ok(Rule::new(
            &config.id,
            expression,
            actions,
            parse_duration(&config.time_trigger),
        ))
    }

    /// Translate a raw alert value through the translations table.
    pub fn translate<'a>(&'a self, raw: &'a str) -> &'a str {
        self.translations.get(raw).map(String::as_str).unwrap_or(raw)
    }
}

/// Parse `HH:MM:SS[.fff]`, `SS`, or fall back to zero.
pub fn parse_duration(text: &str) -> Duration {
    let text = text.trim();
    if let Ok(seconds) = text.parse::<f64>() {
        return Duration::from_secs_f64(seconds.max(0.0));
    }
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() == 3 {
        let hours: u64 = parts[0].parse().unwrap_or(0);
        let minutes: u64 = parts[1].parse().unwrap_or(0);
        let seconds: f64 = parts[2].parse().unwrap_or(0.0);
        return Duration::from_secs(hours * 3600 + minutes * 60)
            + Duration::from_secs_f64(seconds.max(0.0));
    }
    warn!(text, "unparseable duration, using zero");
    Duration::ZERO
}

/// Shared handle to the persisted rule set.
#[derive(Clone)]
pub struct RulesetStore {
    path: PathBuf,
    inner: Arc<Mutex<RulesetFile>>,
}

impl RulesetStore {
    /// Load from `path`; a missing file yields an empty rule set.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RulesetError> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let file: RulesetFile = serde_json::from_str(&text)?;
            info!(
                path = %path.display(),
                devices = file.devices.len(),
                rules = file.ruleset.len(),
                "ruleset loaded"
            );
            file
        } else {
            RulesetFile::default()
        };
        Ok(Self {
            path,
            inner: Arc::new(Mutex::new(file)),
        })
    }

    pub fn get(&self) -> RulesetFile {
        self.inner.lock().clone()
    }

    /// Replace the whole document and persist it.
    pub fn replace(&self, file: RulesetFile) -> Result<(), RulesetError> {
        let text = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, text)?;
        *self.inner.lock() = file;
        Ok(())
    }

    /// Re-read the document from disk.
    pub fn reload(&self) -> Result<(), RulesetError> {
        let text = std::fs::read_to_string(&self.path)?;
        let file: RulesetFile = serde_json::from_str(&text)?;
        *self.inner.lock() = file;
        Ok(())
    }
}
