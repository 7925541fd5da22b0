//! Rules: a compiled boolean condition, an action list, and a re-trigger
//! window.

use std::time::{Duration, Instant};

use rio_core::command::Execution;
use rio_core::knowledge::Knowledge;
use rio_core::value::ValueMap;

use crate::expr::CompiledExpr;

/// Outcome of one rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tristate {
    True,
    False,
    /// Within the re-trigger window, or the condition failed to evaluate.
    Suspended,
}

/// One evaluatable rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub expression: CompiledExpr,
    pub actions: Vec<Execution>,
    /// Minimum interval between fires; also the aging window for the
    /// knowledge snapshot this rule sees.
    pub time_trigger: Duration,
    pub last_fired: Option<Instant>,
    /// Variables of the triggering context (alert info entries), layered
    /// over the knowledge snapshot and merged into fired executions.
    pub variables: ValueMap,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        expression: CompiledExpr,
        actions: Vec<Execution>,
        time_trigger: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            expression,
            actions,
            time_trigger,
            last_fired: None,
            variables: ValueMap::new(),
        }
    }

    pub fn with_variables(mut self, variables: ValueMap) -> Self {
        self.variables = variables;
        self
    }

    /// Evaluate the condition against a fresh knowledge snapshot.
    ///
    /// `Suspended` while the re-trigger window is open or when evaluation
    /// fails (unresolved variable, type error); a `True` result stamps
    /// `last_fired`.
    pub fn condition(&mut self, knowledge: &Knowledge) -> Tristate {
        if let Some(last) = self.last_fired {
            if last.elapsed() < self.time_trigger {
                return Tristate::Suspended;
            }
        }
        // A zero trigger means no re-fire suppression; it also must not
        // age every source out of the snapshot.
        let window = if self.time_trigger.is_zero() {
            Duration::MAX
        } else {
            self.time_trigger
        };
        let mut snapshot = knowledge.snapshot(window);
        for (name, value) in &self.variables {
            snapshot.insert(name.clone(), value.clone());
        }
        match self.expression.eval_bool(&snapshot) {
            Ok(true) => {
                self.last_fired = Some(Instant::now());
                Tristate::True
            }
            Ok(false) => Tristate::False,
            Err(err) => {
                tracing::debug!(rule = %self.id, error = %err, "rule evaluation suspended");
                Tristate::Suspended
            }
        }
    }

    /// Clone the action list, merging this rule's context variables over
    /// each execution's preset parameters.
    pub fn fired_actions(&self) -> Vec<Execution> {
        self.actions
            .iter()
            .map(|action| action.merged_with(&self.variables))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rio_core::value::Value;

    fn rule(expr: &str, trigger: Duration) -> Rule {
        Rule::new(
            "r1",
            CompiledExpr::compile(expr).unwrap(),
            vec![Execution::new("sim", "beep")],
            trigger,
        )
    }

    #[test]
    fn true_then_suspended_within_window() {
        let knowledge = Knowledge::new();
        knowledge.set("sim", [("level", Value::Int(5))]);
        let mut rule = rule("sim_level > 1", Duration::from_secs(60));
        assert_eq!(rule.condition(&knowledge), Tristate::True);
        // Immediately again: inside the window.
        assert_eq!(rule.condition(&knowledge), Tristate::Suspended);
    }

    #[test]
    fn false_does_not_stamp_last_fired() {
        let knowledge = Knowledge::new();
        knowledge.set("sim", [("level", Value::Int(0))]);
        let mut rule = rule("sim_level > 1", Duration::from_secs(60));
        assert_eq!(rule.condition(&knowledge), Tristate::False);
        assert!(rule.last_fired.is_none());
    }

    #[test]
    fn evaluation_error_suspends() {
        let knowledge = Knowledge::new();
        let mut rule = rule("missing_var > 1", Duration::from_secs(60));
        assert_eq!(rule.condition(&knowledge), Tristate::Suspended);
    }

    #[test]
    fn context_variables_reach_condition_and_actions() {
        let knowledge = Knowledge::new();
        let mut rule = rule("eventType = 'storm'", Duration::from_secs(1)).with_variables(
            ValueMap::from([("eventType".to_string(), Value::Str("storm".into()))]),
        );
        assert_eq!(rule.condition(&knowledge), Tristate::True);
        let actions = rule.fired_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].parameters.get("eventType"),
            Some(&Value::Str("storm".into()))
        );
    }
}
