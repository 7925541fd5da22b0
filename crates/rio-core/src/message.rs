//! Management message model.
//!
//! Messages travel as JSON objects `{Type, Source, Id?, Parameters}` over
//! the management topic and the admin socket. The type vocabulary is closed;
//! unparseable input degrades to an `error` message instead of being dropped
//! so the sender always gets a structured reply.

use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueMap};

/// Closed vocabulary of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Status,
    Update,
    Schedule,
    Config,
    Enable,
    Disable,
    Start,
    Stop,
    List,
    Help,
    Exec,
    Shutdown,
    Ruleset,
    Name,
    Telemetry,
    Test,
    Retry,
    History,
    Response,
    Error,
}

impl MessageType {
    /// Resolve an admin verb to a message type.
    pub fn from_verb(verb: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(verb.to_ascii_lowercase())).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Update => "update",
            Self::Schedule => "schedule",
            Self::Config => "config",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::List => "list",
            Self::Help => "help",
            Self::Exec => "exec",
            Self::Shutdown => "shutdown",
            Self::Ruleset => "ruleset",
            Self::Name => "name",
            Self::Telemetry => "telemetry",
            Self::Test => "test",
            Self::Retry => "retry",
            Self::History => "history",
            Self::Response => "response",
            Self::Error => "error",
        }
    }
}

/// A management message, inbound or outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    #[serde(rename = "Type")]
    pub message_type: MessageType,
    pub source: String,
    /// Correlates a response with its request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub parameters: ValueMap,
    #[serde(skip, default = "default_valid")]
    pub is_valid: bool,
}

fn default_valid() -> bool {
    true
}

impl Message {
    pub fn new(message_type: MessageType, source: impl Into<String>) -> Self {
        Self {
            message_type,
            source: source.into(),
            id: None,
            parameters: ValueMap::new(),
            is_valid: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Parse wire JSON. Failures yield an invalid `error` message carrying
    /// the original text and the parse error, per the error-handling
    /// contract; the caller replies instead of dropping the input.
    pub fn parse(text: &str, fallback_source: &str) -> Self {
        match serde_json::from_str::<Message>(text) {
            Ok(message) => message,
            Err(err) => {
                let mut message = Message::new(MessageType::Error, fallback_source);
                message.is_valid = false;
                message
                    .parameters
                    .insert("text".into(), Value::Str(text.to_string()));
                message
                    .parameters
                    .insert("error".into(), Value::Str(err.to_string()));
                message
            }
        }
    }

    /// Build the response shell for this request: `source` is the local id
    /// and the request id is echoed for correlation.
    pub fn response_from(&self, local_id: &str) -> Message {
        let mut response = Message::new(MessageType::Response, local_id);
        response.id = self.id.clone();
        response
    }

    /// The `target` parameter as a list, whether it arrived as a string or
    /// an array of strings.
    pub fn targets(&self) -> Vec<String> {
        match self.parameters.get("target") {
            Some(Value::Str(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items.iter().map(Value::to_text).collect(),
            _ => Vec::new(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let json = r#"{"Type":"exec","Source":"ops","Id":"17","Parameters":{"target":"gps","action":"poll"}}"#;
        let message = Message::parse(json, "dev");
        assert!(message.is_valid);
        assert_eq!(message.message_type, MessageType::Exec);
        assert_eq!(message.source, "ops");
        assert_eq!(message.id.as_deref(), Some("17"));
        assert_eq!(message.targets(), vec!["gps".to_string()]);
    }

    #[test]
    fn parse_failure_becomes_error_message() {
        let message = Message::parse("{not json", "dev");
        assert!(!message.is_valid);
        assert_eq!(message.message_type, MessageType::Error);
        assert_eq!(
            message.parameters.get("text"),
            Some(&Value::Str("{not json".into()))
        );
        assert!(message.parameters.contains_key("error"));
    }

    #[test]
    fn array_targets() {
        let json = r#"{"Type":"stop","Source":"ops","Parameters":{"target":["gps","mail"]}}"#;
        let message = Message::parse(json, "dev");
        assert_eq!(message.targets(), vec!["gps".to_string(), "mail".to_string()]);
    }

    #[test]
    fn response_carries_local_source_and_request_id() {
        let request = Message::new(MessageType::Status, "ops").with_id("9");
        let response = request.response_from("D01");
        assert_eq!(response.source, "D01");
        assert_eq!(response.id.as_deref(), Some("9"));
        assert!(response.is_valid);
    }

    #[test]
    fn verb_resolution() {
        assert_eq!(MessageType::from_verb("STATUS"), Some(MessageType::Status));
        assert_eq!(MessageType::from_verb("bogus"), None);
    }
}
