//! Cron-like schedule lines.
//!
//! Format, space-separated:
//!
//! ```text
//! second minute hour dayOfWeek dayOfMonth month periodSeconds extraExpr command
//! ```
//!
//! `*` means any. Non-star fields accept comma lists, ranges `a-b`, and
//! steps `base/step` (`*` base meaning 0). Day-of-week accepts full or
//! 3-letter English names. `extraExpr` is appended verbatim as one more
//! conjunct; it (and only it) may be omitted entirely. The schedule
//! compiles into a plain [`Rule`] so the engine treats cron and alert
//! rules identically.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use rio_core::command::Execution;

use crate::expr::CompiledExpr;
use crate::rule::Rule;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("schedule needs 8 fields and a command: {0}")]
    TooShort(String),

    #[error("bad field {field}: {detail}")]
    BadField { field: &'static str, detail: String },

    #[error("unknown day name: {0}")]
    UnknownDay(String),

    #[error("unknown scheduled command: {0}")]
    UnknownCommand(String),

    #[error("schedule expression: {0}")]
    Expression(#[from] crate::expr::ExprError),
}

const FIELDS: [(&str, &str); 6] = [
    ("second", "utc.second"),
    ("minute", "utc.minute"),
    ("hour", "utc.hour"),
    ("dayOfWeek", "utc.dayofweek"),
    ("dayOfMonth", "utc.day"),
    ("month", "utc.month"),
];

/// Parse one schedule line against the named-command table.
pub fn parse_schedule(
    line: &str,
    commands: &HashMap<String, Execution>,
) -> Result<Rule, CronError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    // The extraExpr slot may be omitted: 8 tokens = fields without it.
    let (fields, command_tokens): (Vec<&str>, &[&str]) = if tokens.len() == 8 {
        let mut fields: Vec<&str> = tokens[..7].to_vec();
        fields.push("*");
        (fields, &tokens[7..])
    } else if tokens.len() >= 9 {
        (tokens[..8].to_vec(), &tokens[8..])
    } else {
        return Err(CronError::TooShort(line.to_string()));
    };

    let command_name = command_tokens.join(" ");
    let action = commands
        .get(command_name.as_str())
        .cloned()
        .ok_or_else(|| CronError::UnknownCommand(command_name.clone()))?;

    let mut conjuncts: Vec<String> = Vec::new();
    for (i, (field_name, member)) in FIELDS.iter().enumerate() {
        if let Some(conjunct) = field_conjunct(fields[i], field_name, member)? {
            conjuncts.push(conjunct);
        }
    }

    let period = match fields[6] {
        "*" => None,
        text => Some(text.parse::<u64>().map_err(|_| CronError::BadField {
            field: "periodSeconds",
            detail: text.to_string(),
        })?),
    };

    if fields[7] != "*" {
        conjuncts.push(fields[7].to_string());
    }

    let source = if conjuncts.is_empty() {
        "true".to_string()
    } else {
        conjuncts.join(" AND ")
    };
    let expression = CompiledExpr::compile(&source)?;

    let precision = field_precision(&fields);
    let time_trigger = match period {
        Some(period) => precision.min(Duration::from_secs(period)),
        None => precision,
    };

    Ok(Rule::new(command_name, expression, vec![action], time_trigger))
}

/// Window of the finest non-star clock field.
fn field_precision(fields: &[&str]) -> Duration {
    let seconds = if fields[0] != "*" {
        1
    } else if fields[1] != "*" {
        60
    } else if fields[2] != "*" {
        3600
    } else if fields[3] != "*" || fields[4] != "*" || fields[5] != "*" {
        86_400
    } else {
        1
    };
    Duration::from_secs(seconds)
}

/// Build the conjunct for one field, or `None` for `*`.
fn field_conjunct(
    spec: &str,
    field_name: &'static str,
    member: &str,
) -> Result<Option<String>, CronError> {
    if spec == "*" {
        return Ok(None);
    }
    let mut alternatives = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(CronError::BadField {
                field: field_name,
                detail: spec.to_string(),
            });
        }
        alternatives.push(part_condition(part, field_name, member)?);
    }
    let joined = alternatives.join(" OR ");
    if alternatives.len() > 1 {
        Ok(Some(format!("({joined})")))
    } else {
        Ok(Some(joined))
    }
}

fn part_condition(
    part: &str,
    field_name: &'static str,
    member: &str,
) -> Result<String, CronError> {
    if let Some((base, step)) = part.split_once('/') {
        let base = if base == "*" {
            0
        } else {
            field_value(base, field_name)?
        };
        let step: i64 = step.parse().map_err(|_| CronError::BadField {
            field: field_name,
            detail: part.to_string(),
        })?;
        if step <= 0 {
            return Err(CronError::BadField {
                field: field_name,
                detail: part.to_string(),
            });
        }
        if base == 0 {
            return Ok(format!("{member} % {step} = 0"));
        }
        return Ok(format!(
            "({member} >= {base} AND ({member} - {base}) % {step} = 0)"
        ));
    }
    if let Some((from, to)) = part.split_once('-') {
        let from = field_value(from, field_name)?;
        let to = field_value(to, field_name)?;
        return Ok(format!("({member} >= {from} AND {member} <= {to})"));
    }
    let value = field_value(part, field_name)?;
    Ok(format!("{member} = {value}"))
}

fn field_value(text: &str, field_name: &'static str) -> Result<i64, CronError> {
    if field_name == "dayOfWeek" {
        if let Ok(value) = text.parse::<i64>() {
            return Ok(value);
        }
        return day_number(text).ok_or_else(|| CronError::UnknownDay(text.to_string()));
    }
    text.parse::<i64>().map_err(|_| CronError::BadField {
        field: field_name,
        detail: text.to_string(),
    })
}

/// Long or 3-letter English day names, Sunday = 0.
fn day_number(name: &str) -> Option<i64> {
    match name.to_ascii_lowercase().as_str() {
        "sunday" | "sun" => Some(0),
        "monday" | "mon" => Some(1),
        "tuesday" | "tue" => Some(2),
        "wednesday" | "wed" => Some(3),
        "thursday" | "thu" => Some(4),
        "friday" | "fri" => Some(5),
        "saturday" | "sat" => Some(6),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> HashMap<String, Execution> {
        HashMap::from([
            ("doBeep".to_string(), Execution::new("sim", "beep")),
            ("poll".to_string(), Execution::new("gps", "poll")),
        ])
    }

    #[test]
    fn second_zero_schedule() {
        let rule = parse_schedule("0 * * * * * * * doBeep", &commands()).unwrap();
        assert_eq!(rule.id, "doBeep");
        assert_eq!(rule.time_trigger, Duration::from_secs(1));
        assert_eq!(rule.expression.source(), "utc.second = 0");
    }

    #[test]
    fn extra_expr_slot_may_be_omitted() {
        let with = parse_schedule("0 * * * * * * * doBeep", &commands()).unwrap();
        let without = parse_schedule("0 * * * * * * doBeep", &commands()).unwrap();
        assert_eq!(with.expression.source(), without.expression.source());
        assert_eq!(with.time_trigger, without.time_trigger);
    }

    #[test]
    fn ranges_steps_and_lists() {
        let rule = parse_schedule("*/15 10-20 8,12 * * * * * poll", &commands()).unwrap();
        assert_eq!(
            rule.expression.source(),
            "utc.second % 15 = 0 AND (utc.minute >= 10 AND utc.minute <= 20) \
             AND (utc.hour = 8 OR utc.hour = 12)"
        );
        assert_eq!(rule.time_trigger, Duration::from_secs(1));
    }

    #[test]
    fn day_names_resolve() {
        let rule = parse_schedule("* 0 * Mon,friday * * * * poll", &commands()).unwrap();
        assert!(rule
            .expression
            .source()
            .contains("(utc.dayofweek = 1 OR utc.dayofweek = 5)"));
        assert_eq!(rule.time_trigger, Duration::from_secs(60));

        let err = parse_schedule("* * * Noday * * * * poll", &commands()).unwrap_err();
        assert!(matches!(err, CronError::UnknownDay(_)));
    }

    #[test]
    fn period_caps_the_trigger() {
        let rule = parse_schedule("* 30 * * * * 10 * poll", &commands()).unwrap();
        assert_eq!(rule.time_trigger, Duration::from_secs(10));
    }

    #[test]
    fn extra_expression_is_conjoined() {
        let rule = parse_schedule("0 * * * * * * gps_fix=1 poll", &commands()).unwrap();
        assert_eq!(rule.expression.source(), "utc.second = 0 AND gps_fix=1");
    }

    #[test]
    fn unknown_command_fails() {
        let err = parse_schedule("0 * * * * * * * nothing", &commands()).unwrap_err();
        assert!(matches!(err, CronError::UnknownCommand(_)));
    }

    #[test]
    fn parse_is_idempotent() {
        let line = "*/5 1-3 * Sat * * 30 gps_fix=1 poll";
        let first = parse_schedule(line, &commands()).unwrap();
        let second = parse_schedule(line, &commands()).unwrap();
        assert_eq!(first.expression.normal_form(), second.expression.normal_form());
        assert_eq!(first.time_trigger, second.time_trigger);
        // The normal form itself is parse-stable.
        let reparsed = CompiledExpr::compile(&first.expression.normal_form()).unwrap();
        assert_eq!(reparsed.normal_form(), first.expression.normal_form());
    }
}
