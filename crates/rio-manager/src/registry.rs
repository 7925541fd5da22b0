//! Compile-time plugin registry.
//!
//! Plugins register themselves by type name at startup; feature configs
//! then select from this registry. There is no dynamic loading: the set
//! of linkable plugins is fixed at build time, discovery is config-driven.

use std::collections::HashMap;
use std::sync::Arc;

use rio_core::knowledge::Knowledge;
use rio_core::notify::NotifyBus;

use crate::feature::Feature;
use crate::simulator::SimulatorFeature;

/// Registry of linkable plugins, keyed by type name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Feature>>,
    order: Vec<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with every built-in plugin registered, publishing
    /// through the shared knowledge and notify handles.
    pub fn with_builtins(knowledge: Knowledge, notify: NotifyBus) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SimulatorFeature::with_handles(knowledge, notify)));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn Feature>) {
        let name = plugin.name().to_string();
        if self.plugins.insert(name.clone(), plugin).is_none() {
            self.order.push(name);
        }
    }

    pub fn find(&self, type_name: &str) -> Option<Arc<dyn Feature>> {
        self.plugins.get(type_name).cloned()
    }

    /// Plugins in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Feature>> {
        self.order
            .iter()
            .filter_map(|name| self.plugins.get(name).cloned())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtins() -> PluginRegistry {
        PluginRegistry::with_builtins(Knowledge::new(), NotifyBus::new())
    }

    #[test]
    fn builtins_contain_the_simulator() {
        let registry = builtins();
        assert!(registry.find("simulator").is_some());
        assert!(registry.find("nothing").is_none());
        assert_eq!(registry.names(), vec!["simulator"]);
    }

    #[test]
    fn re_registration_replaces_without_duplicating() {
        let mut registry = builtins();
        registry.register(Arc::new(SimulatorFeature::new()));
        assert_eq!(registry.len(), 1);
    }
}
