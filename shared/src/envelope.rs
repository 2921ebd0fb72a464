//! Command and response envelopes
//!
//! A command node is written by the controller under `commands/<push-key>`;
//! the agent answers with one self-contained response node under
//! `responses/<push-key>`.

use crate::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Failure taxonomy for the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Command node without a usable name
    MalformedCommand,
    /// No capability handler registered under the name
    UnknownCommand,
    /// Handler reported failure or panicked
    HandlerFailure,
    /// Command subscription dropped by the transport
    TransportCancelled,
    /// Response could not be written
    PublishFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedCommand => "MalformedCommand",
            ErrorKind::UnknownCommand => "UnknownCommand",
            ErrorKind::HandlerFailure => "HandlerFailure",
            ErrorKind::TransportCancelled => "TransportCancelled",
            ErrorKind::PublishFailure => "PublishFailure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one capability handler
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok(Value),
    Err { kind: ErrorKind, message: String },
}

impl Outcome {
    pub fn ok(payload: impl Into<Value>) -> Self {
        Outcome::Ok(payload.into())
    }

    pub fn err(kind: ErrorKind, message: impl Into<String>) -> Self {
        Outcome::Err {
            kind,
            message: message.into(),
        }
    }

    /// Handler-level failure
    pub fn failure(message: impl Into<String>) -> Self {
        Self::err(ErrorKind::HandlerFailure, message)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }
}

/// Why a command node could not be turned into a [`Command`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedCommand {
    #[error("command node is not an object")]
    NotAnObject,

    #[error("command name is missing or empty")]
    MissingName,
}

/// A command taken from the command channel
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Store-assigned push key of the command node
    pub id: String,
    pub name: String,
    pub params: Value,
}

impl Command {
    /// Parse a command node.
    ///
    /// The name is read from `name`, falling back to `command` as older
    /// controllers write it. `params` may be structured or a JSON-encoded
    /// string.
    pub fn from_node(id: &str, node: &Value) -> Result<Self, MalformedCommand> {
        let fields = node.as_object().ok_or(MalformedCommand::NotAnObject)?;

        let name = raw_name(node)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(MalformedCommand::MissingName)?;

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            params: parse_params(fields.get("params")),
        })
    }
}

/// The name field of a command node, if it is a string
pub fn raw_name(node: &Value) -> Option<&str> {
    node.get("name")
        .or_else(|| node.get("command"))
        .and_then(Value::as_str)
}

fn parse_params(raw: Option<&Value>) -> Value {
    match raw {
        None => Value::Null,
        Some(Value::String(text)) if text.trim().is_empty() => Value::Null,
        Some(Value::String(text)) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
        Some(value) => value.clone(),
    }
}

/// Response node appended to the response log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: u64,
}

impl Response {
    /// Build the response for a dispatched command
    pub fn from_outcome(command: &Command, outcome: Outcome) -> Self {
        let (success, result, error, message) = match outcome {
            Outcome::Ok(payload) => (true, Some(payload), None, None),
            Outcome::Err { kind, message } => (false, None, Some(kind), Some(message)),
        };
        Self {
            command: command.name.clone(),
            command_id: Some(command.id.clone()),
            success,
            result,
            error,
            message,
            timestamp: now_ms(),
        }
    }

    /// Build the response for a command node that could not be parsed
    pub fn malformed(command_id: &str, node: &Value, reason: &MalformedCommand) -> Self {
        Self {
            command: raw_name(node).unwrap_or_default().to_string(),
            command_id: Some(command_id.to_string()),
            success: false,
            result: None,
            error: Some(ErrorKind::MalformedCommand),
            message: Some(reason.to_string()),
            timestamp: now_ms(),
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_structured_command() {
        let node = json!({"name": "vibrateDevice", "params": {"duration": 500}});
        let cmd = Command::from_node("k1", &node).unwrap();
        assert_eq!(cmd.id, "k1");
        assert_eq!(cmd.name, "vibrateDevice");
        assert_eq!(cmd.params, json!({"duration": 500}));
    }

    #[test]
    fn test_parse_legacy_string_params() {
        let node = json!({"command": "vibrateDevice", "params": "{\"duration\":250}"});
        let cmd = Command::from_node("k1", &node).unwrap();
        assert_eq!(cmd.name, "vibrateDevice");
        assert_eq!(cmd.params, json!({"duration": 250}));

        let node = json!({"name": "visit", "params": "not json"});
        let cmd = Command::from_node("k2", &node).unwrap();
        assert_eq!(cmd.params, json!("not json"));
    }

    #[test]
    fn test_missing_params_is_null() {
        let cmd = Command::from_node("k", &json!({"name": "getSystemInfo"})).unwrap();
        assert_eq!(cmd.params, Value::Null);
    }

    #[test]
    fn test_malformed_commands() {
        assert_eq!(
            Command::from_node("k", &json!({"params": {}})),
            Err(MalformedCommand::MissingName)
        );
        assert_eq!(
            Command::from_node("k", &json!({"name": "  "})),
            Err(MalformedCommand::MissingName)
        );
        assert_eq!(
            Command::from_node("k", &json!({"name": 7})),
            Err(MalformedCommand::MissingName)
        );
        assert_eq!(
            Command::from_node("k", &json!("vibrateDevice")),
            Err(MalformedCommand::NotAnObject)
        );
    }

    #[test]
    fn test_success_response_shape() {
        let cmd = Command::from_node("k1", &json!({"name": "vibrateDevice"})).unwrap();
        let response = Response::from_outcome(&cmd, Outcome::ok(json!({"duration": 500})));
        let value = response.to_value().unwrap();

        assert_eq!(value["command"], "vibrateDevice");
        assert_eq!(value["commandId"], "k1");
        assert_eq!(value["success"], true);
        assert_eq!(value["result"], json!({"duration": 500}));
        assert!(value.get("error").is_none());
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_error_response_shape() {
        let cmd = Command::from_node("k2", &json!({"name": "bogus"})).unwrap();
        let outcome = Outcome::err(ErrorKind::UnknownCommand, "bogus");
        let response = Response::from_outcome(&cmd, outcome);
        let value = response.to_value().unwrap();

        assert_eq!(value["command"], "bogus");
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "UnknownCommand");
        assert!(value.get("result").is_none());

        let back: Response = serde_json::from_value(value).unwrap();
        assert_eq!(back.error, Some(ErrorKind::UnknownCommand));
    }

    #[test]
    fn test_malformed_response_is_tagged_with_node_id() {
        let node = json!({"params": {"x": 1}});
        let response = Response::malformed("raw-key", &node, &MalformedCommand::MissingName);
        assert_eq!(response.command, "");
        assert_eq!(response.command_id.as_deref(), Some("raw-key"));
        assert_eq!(response.error, Some(ErrorKind::MalformedCommand));
        assert!(!response.success);
    }
}
