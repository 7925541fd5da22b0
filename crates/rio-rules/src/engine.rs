//! Rule engine: three rule sets sharing one knowledge base.
//!
//! The periodic set holds persistent (cron and system) rules; the
//! until-true and until-false sets hold ephemeral rules planted by alert
//! processing. Every tick evaluates each rule against its own consistent
//! knowledge snapshot; rules never observe each other's fires within the
//! same tick.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use rio_core::command::Execution;
use rio_core::knowledge::Knowledge;
use rio_core::value::ValueMap;

use crate::rule::{Rule, Tristate};

/// Reserved id of the optional system rule.
pub const SYSTEM_RULE_ID: &str = "System";

pub struct RuleEngine {
    knowledge: Knowledge,
    periodic: Mutex<Vec<Rule>>,
    until_true: Mutex<Vec<Rule>>,
    until_false: Mutex<Vec<Rule>>,
    system_rule: Mutex<Option<Rule>>,
    /// Whether a display-capable task is present; gates the system rule.
    system_enabled: AtomicBool,
}

impl RuleEngine {
    pub fn new(knowledge: Knowledge) -> Self {
        Self {
            knowledge,
            periodic: Mutex::new(Vec::new()),
            until_true: Mutex::new(Vec::new()),
            until_false: Mutex::new(Vec::new()),
            system_rule: Mutex::new(None),
            system_enabled: AtomicBool::new(false),
        }
    }

    pub fn knowledge(&self) -> &Knowledge {
        &self.knowledge
    }

    /// Replace the persistent rule set (schedule reload).
    pub fn set_periodic(&self, rules: Vec<Rule>) {
        *self.periodic.lock() = rules;
    }

    pub fn add_periodic(&self, rule: Rule) {
        self.periodic.lock().push(rule);
    }

    /// Plant a one-shot rule: fires once on `True`, then disappears.
    pub fn add_until_true(&self, rule: Rule) {
        self.until_true.lock().push(rule);
    }

    /// Plant a while-true rule: fires while `True`, removed on `False`.
    pub fn add_until_false(&self, rule: Rule) {
        self.until_false.lock().push(rule);
    }

    pub fn set_system_rule(&self, rule: Option<Rule>) {
        *self.system_rule.lock() = rule;
    }

    /// Toggle the system rule with the availability of a display task.
    pub fn set_system_enabled(&self, enabled: bool) {
        self.system_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Merge event variables into every periodic rule (and the system
    /// rule) so alert- and request-provided values are visible to cron
    /// conditions too.
    pub fn update(&self, variables: &ValueMap) {
        let mut periodic = self.periodic.lock();
        for rule in periodic.iter_mut() {
            for (name, value) in variables {
                rule.variables.insert(name.clone(), value.clone());
            }
        }
        drop(periodic);
        if let Some(rule) = self.system_rule.lock().as_mut() {
            for (name, value) in variables {
                rule.variables.insert(name.clone(), value.clone());
            }
        }
    }

    /// Evaluate all three sets once and collect the fired executions.
    pub fn process(&self) -> Vec<Execution> {
        let mut fired = Vec::new();

        {
            let mut periodic = self.periodic.lock();
            for rule in periodic.iter_mut() {
                if rule.condition(&self.knowledge) == Tristate::True {
                    tracing::info!(rule = %rule.id, "periodic rule fired");
                    fired.extend(rule.fired_actions());
                }
            }
        }

        if self.system_enabled.load(Ordering::Relaxed) {
            let mut system = self.system_rule.lock();
            if let Some(rule) = system.as_mut() {
                if rule.condition(&self.knowledge) == Tristate::True {
                    tracing::info!(rule = %rule.id, "system rule fired");
                    fired.extend(rule.fired_actions());
                }
            }
        }

        {
            let mut until_true = self.until_true.lock();
            until_true.retain_mut(|rule| match rule.condition(&self.knowledge) {
                Tristate::True => {
                    tracing::info!(rule = %rule.id, "one-shot rule fired");
                    fired.extend(rule.fired_actions());
                    false
                }
                _ => true,
            });
        }

        {
            let mut until_false = self.until_false.lock();
            until_false.retain_mut(|rule| match rule.condition(&self.knowledge) {
                Tristate::True => {
                    tracing::info!(rule = %rule.id, "while-true rule fired");
                    fired.extend(rule.fired_actions());
                    true
                }
                Tristate::False => false,
                Tristate::Suspended => true,
            });
        }

        fired
    }

    /// Expressions of every live rule, for the schedule debug listing.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for rule in self.periodic.lock().iter() {
            lines.push(format!(
                "periodic {}: {}",
                rule.id,
                rule.expression.source()
            ));
        }
        if let Some(rule) = self.system_rule.lock().as_ref() {
            lines.push(format!("system {}: {}", rule.id, rule.expression.source()));
        }
        for rule in self.until_true.lock().iter() {
            lines.push(format!(
                "until-true {}: {}",
                rule.id,
                rule.expression.source()
            ));
        }
        for rule in self.until_false.lock().iter() {
            lines.push(format!(
                "until-false {}: {}",
                rule.id,
                rule.expression.source()
            ));
        }
        lines
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.periodic.lock().len(),
            self.until_true.lock().len(),
            self.until_false.lock().len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::CompiledExpr;
    use rio_core::value::Value;
    use std::time::Duration;

    fn rule(id: &str, expr: &str) -> Rule {
        Rule::new(
            id,
            CompiledExpr::compile(expr).unwrap(),
            vec![Execution::new("sim", "beep")],
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn until_true_rules_fire_once_and_vanish() {
        let knowledge = Knowledge::new();
        knowledge.set("sim", [("level", Value::Int(5))]);
        let engine = RuleEngine::new(knowledge);
        engine.add_until_true(rule("once", "sim_level > 1"));

        let fired = engine.process();
        assert_eq!(fired.len(), 1);
        assert_eq!(engine.counts().1, 0);
        assert!(engine.process().is_empty());
    }

    #[test]
    fn until_false_rules_survive_while_true() {
        let knowledge = Knowledge::new();
        knowledge.set("sim", [("level", Value::Int(5))]);
        let engine = RuleEngine::new(knowledge.clone());
        let mut while_rule = rule("while", "sim_level > 1");
        while_rule.time_trigger = Duration::from_millis(0);
        engine.add_until_false(while_rule);

        assert_eq!(engine.process().len(), 1);
        assert_eq!(engine.counts().2, 1);

        // Condition goes false: the rule is removed without firing.
        knowledge.set("sim", [("level", Value::Int(0))]);
        assert!(engine.process().is_empty());
        assert_eq!(engine.counts().2, 0);
    }

    #[test]
    fn suspended_rules_are_kept() {
        let knowledge = Knowledge::new();
        let engine = RuleEngine::new(knowledge);
        // Unresolvable variable: suspended, not removed.
        engine.add_until_true(rule("pending", "ghost_var > 1"));
        assert!(engine.process().is_empty());
        assert_eq!(engine.counts().1, 1);
    }

    #[test]
    fn system_rule_is_gated_on_display_capability() {
        let knowledge = Knowledge::new();
        knowledge.set("mgmt", [("command", Value::Str("setPage".into()))]);
        let engine = RuleEngine::new(knowledge);
        let mut system = rule(SYSTEM_RULE_ID, "mgmt_command = 'setPage'");
        system.time_trigger = Duration::from_millis(0);
        engine.set_system_rule(Some(system));

        assert!(engine.process().is_empty());
        engine.set_system_enabled(true);
        assert_eq!(engine.process().len(), 1);
    }

    #[test]
    fn update_reaches_periodic_rules() {
        let knowledge = Knowledge::new();
        let engine = RuleEngine::new(knowledge);
        let mut cron = rule("cron", "eventType = 'storm'");
        cron.time_trigger = Duration::from_millis(0);
        engine.add_periodic(cron);

        assert!(engine.process().is_empty());
        engine.update(&ValueMap::from([(
            "eventType".to_string(),
            Value::Str("storm".into()),
        )]));
        assert_eq!(engine.process().len(), 1);
    }
}
