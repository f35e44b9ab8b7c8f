//! Outbound messages sent from the agent to the controller

use crate::ProtocolError;
use bytes::Bytes;
use rmpv::Value;
use serde::Serialize;

/// A message written to the controller connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Reply to a `ping` envelope
    Pong {
        /// Timestamp copied from the ping
        ts: i64,
    },

    /// Terminal result of a command
    #[serde(rename_all = "camelCase")]
    CommandResult {
        /// Id of the command this result belongs to
        command_id: String,
        /// Whether the command succeeded
        ok: bool,
        /// Human readable outcome
        message: String,
    },

    /// Non-terminal progress of a long command
    #[serde(rename_all = "camelCase")]
    CommandProgress {
        /// Id of the command
        command_id: String,
        /// Whether the step succeeded
        ok: bool,
        /// Progress description
        message: String,
    },

    /// Console session output, exit or error
    #[serde(rename_all = "camelCase")]
    ConsoleOutput {
        /// Session id
        session_id: String,
        /// Raw terminal output
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Bytes>,
        /// Exit code, set once the shell has exited
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// Session level error
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Event emitted by a loaded module
    #[serde(rename_all = "camelCase")]
    PluginEvent {
        /// Module id
        plugin_id: String,
        /// Event name
        event: String,
        /// Event payload as produced by the module
        payload: Value,
    },
}

impl Outbound {
    /// Create a command result
    pub fn command_result(command_id: impl Into<String>, ok: bool, message: impl Into<String>) -> Self {
        Outbound::CommandResult {
            command_id: command_id.into(),
            ok,
            message: message.into(),
        }
    }

    /// Create a progress update
    pub fn command_progress(command_id: impl Into<String>, message: impl Into<String>) -> Self {
        Outbound::CommandProgress {
            command_id: command_id.into(),
            ok: true,
            message: message.into(),
        }
    }

    /// Terminal output for a session
    pub fn console_data(session_id: impl Into<String>, data: Bytes) -> Self {
        Outbound::ConsoleOutput {
            session_id: session_id.into(),
            data: Some(data),
            exit_code: None,
            error: None,
        }
    }

    /// Shell exit for a session
    pub fn console_exit(session_id: impl Into<String>, exit_code: i32) -> Self {
        Outbound::ConsoleOutput {
            session_id: session_id.into(),
            data: None,
            exit_code: Some(exit_code),
            error: None,
        }
    }

    /// Session error event
    pub fn console_error(session_id: impl Into<String>, error: impl Into<String>) -> Self {
        Outbound::ConsoleOutput {
            session_id: session_id.into(),
            data: None,
            exit_code: None,
            error: Some(error.into()),
        }
    }

    /// Serialize as a msgpack map with string keys
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Fields;
    use crate::test_utils::decode_value;

    #[test]
    fn test_command_result_uses_camel_case_keys() {
        let encoded = Outbound::command_result("c1", false, "boom").encode().unwrap();
        let value = decode_value(&encoded);
        let fields = Fields::new(&value);
        assert_eq!(fields.str("type"), "command_result");
        assert_eq!(fields.str("commandId"), "c1");
        assert!(!fields.bool("ok"));
        assert_eq!(fields.str("message"), "boom");
    }

    #[test]
    fn test_console_output_omits_unset_fields() {
        let encoded = Outbound::console_data("s1", Bytes::from_static(b"hi\r\n")).encode().unwrap();
        let value = decode_value(&encoded);
        let fields = Fields::new(&value);
        assert_eq!(fields.str("type"), "console_output");
        assert_eq!(fields.str("sessionId"), "s1");
        assert!(matches!(fields.get("data"), Some(Value::Binary(b)) if b == b"hi\r\n"));
        assert!(!fields.contains("exitCode"));
        assert!(!fields.contains("error"));

        let exit = decode_value(&Outbound::console_exit("s1", -1).encode().unwrap());
        let fields = Fields::new(&exit);
        assert_eq!(fields.int("exitCode"), -1);
        assert!(!fields.contains("data"));
    }

    #[test]
    fn test_plugin_event_passes_payload_through() {
        let payload = Value::Map(vec![(Value::from("message"), Value::from("hello"))]);
        let message = Outbound::PluginEvent {
            plugin_id: "m1".to_string(),
            event: "echo".to_string(),
            payload: payload.clone(),
        };
        let value = decode_value(&message.encode().unwrap());
        let fields = Fields::new(&value);
        assert_eq!(fields.str("pluginId"), "m1");
        assert_eq!(fields.str("event"), "echo");
        assert_eq!(fields.value("payload"), payload);
    }

    #[test]
    fn test_pong_keeps_timestamp() {
        let value = decode_value(&Outbound::Pong { ts: 1_700_000_000_000 }.encode().unwrap());
        let fields = Fields::new(&value);
        assert_eq!(fields.str("type"), "pong");
        assert_eq!(fields.int("ts"), 1_700_000_000_000);
    }
}
