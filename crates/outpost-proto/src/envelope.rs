//! Inbound envelopes decoded from loosely-typed msgpack maps
//!
//! The controller is untrusted input. Every field is pulled out through
//! [`Fields`], whose accessors never fail: a missing or mistyped field yields
//! a default value instead.

use crate::ProtocolError;
pub use rmpv::Value;

/// Total accessors over a msgpack map
#[derive(Debug, Clone, Copy)]
pub struct Fields<'a> {
    entries: &'a [(Value, Value)],
}

impl<'a> Fields<'a> {
    /// View a value as a map; non-map values behave as an empty map
    pub fn new(value: &'a Value) -> Self {
        match value {
            Value::Map(entries) => Self { entries },
            _ => Self { entries: &[] },
        }
    }

    /// Look up a raw value by string key
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Whether the key is present (with any value)
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// String field, `""` when missing or not a string
    pub fn str(&self, key: &str) -> String {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_default()
    }

    /// Integer field; floats are truncated, anything else is `0`
    pub fn int(&self, key: &str) -> i64 {
        match self.get(key) {
            Some(Value::Integer(n)) => n
                .as_i64()
                .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
                .unwrap_or(0),
            Some(Value::F64(f)) => *f as i64,
            Some(Value::F32(f)) => *f as i64,
            _ => 0,
        }
    }

    /// Boolean field, `false` when missing
    pub fn bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Byte field accepting `bin`, `str` or an array of byte-sized integers
    pub fn bytes(&self, key: &str) -> Vec<u8> {
        match self.get(key) {
            Some(Value::Binary(b)) => b.clone(),
            Some(Value::String(s)) => s.as_bytes().to_vec(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect::<Option<Vec<u8>>>()
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Cloned raw value, nil when missing
    pub fn value(&self, key: &str) -> Value {
        self.get(key).cloned().unwrap_or(Value::Nil)
    }

    /// Nested map accessor
    pub fn map(&self, key: &str) -> Fields<'a> {
        match self.get(key) {
            Some(value) => Fields::new(value),
            None => Fields { entries: &[] },
        }
    }

    /// String list; non-string items are skipped
    pub fn str_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// One decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Liveness check, answered with `pong`
    Ping {
        /// Controller timestamp echoed back
        ts: i64,
    },
    /// A unit of work selected by `commandType`
    Command {
        /// Caller-chosen command id
        id: String,
        /// Raw command type string
        command_type: String,
        /// Type-specific payload
        payload: Value,
    },
    /// Abort a registered command
    CommandAbort {
        /// Id of the command to cancel
        command_id: String,
    },
    /// Event for a loaded module
    PluginEvent {
        /// Target module id
        plugin_id: String,
        /// Event name
        event: String,
        /// Event payload
        payload: Value,
    },
    /// Open a console session
    ConsoleStart {
        /// Session id
        session_id: String,
        /// Requested columns
        cols: i64,
        /// Requested rows
        rows: i64,
    },
    /// Input for a console session
    ConsoleWrite {
        /// Session id
        session_id: String,
        /// Raw input bytes
        data: Vec<u8>,
    },
    /// Resize a console session
    ConsoleResize {
        /// Session id
        session_id: String,
        /// New columns
        cols: i64,
        /// New rows
        rows: i64,
    },
    /// Close a console session
    ConsoleStop {
        /// Session id
        session_id: String,
    },
    /// Any other `type`
    Unknown {
        /// The unrecognised discriminator
        kind: String,
    },
}

impl Envelope {
    /// Decode an envelope from a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = payload;
        let value = rmpv::decode::read_value(&mut reader)?;
        Self::from_value(value)
    }

    /// Build an envelope from an already decoded value
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        if !value.is_map() {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "expected map, got {}",
                value_kind(&value)
            )));
        }

        let fields = Fields::new(&value);
        let kind = fields.str("type");
        let envelope = match kind.as_str() {
            "ping" => Envelope::Ping { ts: fields.int("ts") },
            "command" => {
                let mut id = fields.str("id");
                if id.is_empty() {
                    id = fields.str("commandId");
                }
                Envelope::Command {
                    id,
                    command_type: fields.str("commandType"),
                    payload: fields.value("payload"),
                }
            }
            "command_abort" => Envelope::CommandAbort {
                command_id: fields.str("commandId"),
            },
            "plugin_event" => Envelope::PluginEvent {
                plugin_id: fields.str("pluginId"),
                event: fields.str("event"),
                payload: fields.value("payload"),
            },
            "console_start" => Envelope::ConsoleStart {
                session_id: fields.str("sessionId"),
                cols: fields.int("cols"),
                rows: fields.int("rows"),
            },
            "console_write" => Envelope::ConsoleWrite {
                session_id: fields.str("sessionId"),
                data: fields.bytes("data"),
            },
            "console_resize" => Envelope::ConsoleResize {
                session_id: fields.str("sessionId"),
                cols: fields.int("cols"),
                rows: fields.int("rows"),
            },
            "console_stop" => Envelope::ConsoleStop {
                session_id: fields.str("sessionId"),
            },
            _ => Envelope::Unknown { kind },
        };
        Ok(envelope)
    }

    /// The wire discriminator of this envelope
    pub fn kind(&self) -> &str {
        match self {
            Envelope::Ping { .. } => "ping",
            Envelope::Command { .. } => "command",
            Envelope::CommandAbort { .. } => "command_abort",
            Envelope::PluginEvent { .. } => "plugin_event",
            Envelope::ConsoleStart { .. } => "console_start",
            Envelope::ConsoleWrite { .. } => "console_write",
            Envelope::ConsoleResize { .. } => "console_resize",
            Envelope::ConsoleStop { .. } => "console_stop",
            Envelope::Unknown { kind } => kind,
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "bool",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(..) => "ext",
    }
}
