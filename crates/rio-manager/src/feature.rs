//! Plugin interface: feature descriptors and their runtime tasks.
//!
//! A [`Feature`] is the static side of a plugin: metadata, declared
//! configuration properties, declared commands, and a factory producing
//! [`Task`]s. Tasks are the running instances; they own their own
//! concurrency and record lifecycle problems on their status string
//! instead of failing the process.

use async_trait::async_trait;
use std::sync::Arc;

use rio_core::command::{Command, CommandError};
use rio_core::message::Message;
use rio_core::settings::{FeatureConfig, Settings};
use rio_core::value::{Value, ValueMap};

/// One configuration property a plugin declares, with its default.
#[derive(Debug, Clone)]
pub struct PropertyDefinition {
    pub name: String,
    pub type_name: String,
    pub default: Value,
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default,
        }
    }
}

/// Static plugin descriptor and task factory.
pub trait Feature: Send + Sync {
    /// Plugin type name; selects this plugin from feature configs.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn declared_properties(&self) -> Vec<PropertyDefinition>;

    fn declared_commands(&self) -> Vec<Command>;

    /// Build the tasks for one configured feature instance.
    fn create_tasks(&self, settings: &Settings, config: &FeatureConfig) -> Vec<Arc<dyn Task>>;
}

/// A running instance of a feature.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Id of the feature config this task belongs to.
    fn feature(&self) -> &str;

    /// Human-readable state, including the last lifecycle error if any.
    fn status(&self) -> String;

    fn metrics(&self) -> ValueMap {
        ValueMap::new()
    }

    /// Start the task's own workers. Idempotent.
    async fn start(&self);

    /// Stop the task's workers and wait for them. Idempotent.
    async fn stop(&self);

    /// Run one declared command with parsed parameters, writing results
    /// into the response.
    async fn run(
        &self,
        action: &str,
        parameters: &ValueMap,
        response: &mut Message,
    ) -> Result<(), CommandError>;

    /// Capability probe, e.g. `display` for the system rule.
    fn has_capability(&self, _capability: &str) -> bool {
        false
    }
}
