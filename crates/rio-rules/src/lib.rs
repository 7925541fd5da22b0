//! Rule engine, cron scheduler, and alert processing.
//!
//! Three rule sets (periodic, until-true, until-false) share one knowledge
//! base and one expression language. The scheduler ticks them once per
//! second; alert ingest plants ephemeral rules and feeds knowledge.

pub mod alert;
pub mod cron;
pub mod engine;
pub mod expr;
pub mod rule;
pub mod ruleset;
pub mod scheduler;

pub use alert::{Alert, AlertDeduper, AlertInfo, AlertProcessor, DEDUPE_WINDOW};
pub use cron::{parse_schedule, CronError};
pub use engine::{RuleEngine, SYSTEM_RULE_ID};
pub use expr::{CompiledExpr, Expr, ExprError};
pub use rule::{Rule, Tristate};
pub use ruleset::{parse_duration, RuleConfig, RuleMode, RulesetError, RulesetFile, RulesetStore};
pub use scheduler::{Crontab, Scheduler};
