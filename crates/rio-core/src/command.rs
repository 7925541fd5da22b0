//! Typed command grammar and prepared invocations.
//!
//! Plugins declare [`Command`]s with typed parameters. Incoming parameter
//! maps are validated and coerced in one central parse step; handler code
//! downstream only ever sees well-typed [`Value`]s.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::{Value, ValueMap};

/// Errors raised while parsing parameters against a command declaration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    /// A required parameter was not supplied.
    #[error("missing required parameter: {0}")]
    ParameterMissing(String),

    /// A supplied parameter could not be coerced to its declared type.
    #[error("parameter {name} is not a valid {expected}")]
    ParameterType { name: String, expected: String },

    /// A parameter value is outside its declared domain.
    #[error("parameter {name} must be one of {domain:?}")]
    ParameterDomain { name: String, domain: Vec<String> },

    /// No command with this name is declared for the target.
    #[error("unknown command {target}.{name}")]
    UnknownCommand { target: String, name: String },
}

/// Declared type of a command parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Bool,
    String,
    Real,
    /// A nested name-to-value mapping.
    Parameters,
    /// Collects every unrecognised named parameter into a sub-mapping.
    Star,
    Array(Box<ParamType>),
}

impl ParamType {
    /// Parse a type name from its declaration form, e.g. `array(int)`.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        if let Some(inner) = name
            .strip_prefix("array(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return Self::parse(inner).map(|t| Self::Array(Box::new(t)));
        }
        match name {
            "int" => Some(Self::Int),
            "bool" => Some(Self::Bool),
            "string" => Some(Self::String),
            "real" => Some(Self::Real),
            "parameters" => Some(Self::Parameters),
            "*" => Some(Self::Star),
            _ => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Self::Int => "int".to_string(),
            Self::Bool => "bool".to_string(),
            Self::String => "string".to_string(),
            Self::Real => "real".to_string(),
            Self::Parameters => "parameters".to_string(),
            Self::Star => "*".to_string(),
            Self::Array(inner) => format!("array({})", inner.type_name()),
        }
    }
}

impl Serialize for ParamType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.type_name())
    }
}

impl<'de> Deserialize<'de> for ParamType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown parameter type: {name}")))
    }
}

/// One declared parameter of a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(rename = "Type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    /// Allowed string values, when constrained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
}

impl ParameterDefinition {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            domain: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_domain(mut self, domain: Vec<String>) -> Self {
        self.domain = Some(domain);
        self
    }
}

/// A command declared by a plugin (or by the agent itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Command {
    /// Plugin type this command belongs to, or `RIO` for system commands.
    pub target: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

impl Command {
    pub fn new(target: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterDefinition) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Registry key for the command table: `<type>+<name>`.
    pub fn key(&self) -> String {
        format!("{}+{}", self.target, self.name)
    }

    /// Validate and coerce `supplied` against the declared parameters.
    ///
    /// Missing required parameters fail with [`CommandError::ParameterMissing`].
    /// A `*`-typed parameter collects every name no other declaration
    /// recognises into a sub-mapping under its own name.
    pub fn parse(&self, supplied: &ValueMap) -> Result<ValueMap, CommandError> {
        let mut parsed = ValueMap::new();
        let mut star: Option<&ParameterDefinition> = None;

        for def in &self.parameters {
            if def.param_type == ParamType::Star {
                star = Some(def);
                continue;
            }
            match supplied.get(&def.name) {
                Some(value) => {
                    let coerced = coerce(value, &def.param_type).ok_or_else(|| {
                        CommandError::ParameterType {
                            name: def.name.clone(),
                            expected: def.param_type.type_name(),
                        }
                    })?;
                    if let Some(domain) = &def.domain {
                        let text = coerced.to_text();
                        if !domain.iter().any(|d| d == &text) {
                            return Err(CommandError::ParameterDomain {
                                name: def.name.clone(),
                                domain: domain.clone(),
                            });
                        }
                    }
                    parsed.insert(def.name.clone(), coerced);
                }
                None if def.required => {
                    return Err(CommandError::ParameterMissing(def.name.clone()));
                }
                None => {}
            }
        }

        if let Some(star_def) = star {
            let declared: Vec<&str> = self.parameters.iter().map(|d| d.name.as_str()).collect();
            let leftovers: ValueMap = supplied
                .iter()
                .filter(|(name, _)| !declared.contains(&name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            parsed.insert(star_def.name.clone(), Value::Map(leftovers));
        }

        Ok(parsed)
    }
}

/// Coerce one value to a declared parameter type.
///
/// Returns `None` when the value cannot be interpreted as that type.
fn coerce(value: &Value, ty: &ParamType) -> Option<Value> {
    match ty {
        ParamType::Int => value.as_int().map(Value::Int),
        ParamType::Real => value.as_float().map(Value::Float),
        ParamType::Bool => value.as_bool().map(Value::Bool),
        ParamType::String => Some(Value::Str(value.to_text())),
        ParamType::Parameters => value.as_map().cloned().map(Value::Map),
        ParamType::Star => None,
        ParamType::Array(elem) => {
            let items = match value {
                Value::Array(items) => items.clone(),
                Value::Str(text) => parse_array_text(text)?,
                single => vec![single.clone()],
            };
            Some(Value::Array(
                items.iter().map(|item| coerce_element(item, elem)).collect(),
            ))
        }
    }
}

/// Array elements coerce leniently: numerics that fail to parse become
/// zero, booleans default to false, strings are preserved as-is.
fn coerce_element(value: &Value, ty: &ParamType) -> Value {
    match ty {
        ParamType::Int => Value::Int(value.as_int().unwrap_or(0)),
        ParamType::Real => Value::Float(value.as_float().unwrap_or(0.0)),
        ParamType::Bool => Value::Bool(value.as_bool().unwrap_or(false)),
        _ => coerce(value, ty).unwrap_or_else(|| value.clone()),
    }
}

/// Accepts a JSON array, or a `[a, b]` / `(a, b)` comma list.
fn parse_array_text(text: &str) -> Option<Vec<Value>> {
    let trimmed = text.trim();
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
        return Some(items);
    }
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .or_else(|| {
            trimmed
                .strip_prefix('(')
                .and_then(|rest| rest.strip_suffix(')'))
        })?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    Some(
        inner
            .split(',')
            .map(|part| Value::Str(part.trim().to_string()))
            .collect(),
    )
}

/// A prepared command invocation: immutable once built, cloned by value
/// whenever a rule or schedule dispatches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Execution {
    pub target: String,
    pub command: String,
    #[serde(default)]
    pub parameters: ValueMap,
}

impl Execution {
    pub fn new(target: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            command: command.into(),
            parameters: ValueMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Clone this execution and merge `extra` over its parameters.
    ///
    /// Used when a rule fires: the triggering event's variables are layered
    /// over the preset parameters without mutating the preset.
    pub fn merged_with(&self, extra: &ValueMap) -> Self {
        let mut clone = self.clone();
        for (name, value) in extra {
            clone.parameters.insert(name.clone(), value.clone());
        }
        clone
    }

    /// Short human rendering, `target.command`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.target, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xs_command() -> Command {
        Command::new("sensor", "calibrate")
            .with_parameter(
                ParameterDefinition::new("xs", ParamType::Array(Box::new(ParamType::Int)))
                    .required(),
            )
            .with_parameter(ParameterDefinition::new("fast", ParamType::Bool))
            .with_parameter(ParameterDefinition::new("rest", ParamType::Star))
    }

    #[test]
    fn array_int_lenient_elements() {
        let cmd = xs_command();
        let mut supplied = ValueMap::new();
        supplied.insert("xs".into(), Value::Str("[1, 2, abc]".into()));
        let parsed = cmd.parse(&supplied).unwrap();
        assert_eq!(
            parsed.get("xs"),
            Some(&Value::Array(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(0)
            ]))
        );
    }

    #[test]
    fn bool_accepts_yes() {
        let cmd = xs_command();
        let mut supplied = ValueMap::new();
        supplied.insert("xs".into(), Value::Array(vec![]));
        supplied.insert("fast".into(), Value::Str("YES".into()));
        let parsed = cmd.parse(&supplied).unwrap();
        assert_eq!(parsed.get("fast"), Some(&Value::Bool(true)));
    }

    #[test]
    fn missing_required_parameter_fails() {
        let cmd = xs_command();
        let err = cmd.parse(&ValueMap::new()).unwrap_err();
        assert_eq!(err, CommandError::ParameterMissing("xs".into()));
    }

    #[test]
    fn star_collects_leftovers() {
        let cmd = xs_command();
        let mut supplied = ValueMap::new();
        supplied.insert("xs".into(), Value::Array(vec![]));
        supplied.insert("extra".into(), Value::Int(7));
        supplied.insert("note".into(), Value::Str("hi".into()));
        let parsed = cmd.parse(&supplied).unwrap();
        let rest = parsed.get("rest").and_then(Value::as_map).unwrap();
        assert_eq!(rest.get("extra"), Some(&Value::Int(7)));
        assert_eq!(rest.get("note"), Some(&Value::Str("hi".into())));
        assert!(!rest.contains_key("xs"));
    }

    #[test]
    fn paren_list_and_type_names_round_trip() {
        assert_eq!(
            parse_array_text("(a, b)"),
            Some(vec![Value::Str("a".into()), Value::Str("b".into())])
        );
        let ty = ParamType::parse("array(real)").unwrap();
        assert_eq!(ty.type_name(), "array(real)");
    }

    #[test]
    fn domain_is_enforced() {
        let cmd = Command::new("RIO", "list").with_parameter(
            ParameterDefinition::new("what", ParamType::String)
                .with_domain(vec!["features".into(), "tasks".into(), "drivers".into()]),
        );
        let mut supplied = ValueMap::new();
        supplied.insert("what".into(), Value::Str("nothing".into()));
        assert!(matches!(
            cmd.parse(&supplied),
            Err(CommandError::ParameterDomain { .. })
        ));
    }
}
