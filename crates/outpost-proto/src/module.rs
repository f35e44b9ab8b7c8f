//! Wire types exchanged with sandboxed modules

use crate::envelope::Fields;
use crate::ProtocolError;
use bytes::Bytes;
use rmpv::Value;
use serde::Serialize;

/// UI asset filenames shipped with a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleAssets {
    /// Entry HTML file
    #[serde(skip_serializing_if = "String::is_empty")]
    pub html: String,
    /// Stylesheet
    #[serde(skip_serializing_if = "String::is_empty")]
    pub css: String,
    /// Script
    #[serde(skip_serializing_if = "String::is_empty")]
    pub js: String,
}

/// Declared identity and layout of a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleManifest {
    /// Module id, unique within the module host
    pub id: String,
    /// Display name, defaults to the id
    pub name: String,
    /// Module version
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Free-form description
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Binary filename inside the bundle
    #[serde(skip_serializing_if = "String::is_empty")]
    pub binary: String,
    /// Entry point name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub entry: String,
    /// UI assets
    pub assets: ModuleAssets,
}

impl ModuleManifest {
    /// Manifest with only an id
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ..Default::default()
        }
    }

    /// Extract a manifest from a loosely-typed map
    pub fn from_fields(fields: Fields<'_>) -> Result<Self, ProtocolError> {
        let id = fields.str("id");
        if id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("manifest id is required".to_string()));
        }

        let mut name = fields.str("name");
        if name.is_empty() {
            name = id.clone();
        }

        let assets = fields.map("assets");
        Ok(Self {
            id,
            name,
            version: fields.str("version"),
            description: fields.str("description"),
            binary: fields.str("binary"),
            entry: fields.str("entry"),
            assets: ModuleAssets {
                html: assets.str("html"),
                css: assets.str("css"),
                js: assets.str("js"),
            },
        })
    }
}

/// Static metadata about the agent handed to modules on `init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    /// Agent client id
    pub client_id: String,
    /// Operating system name
    pub os: String,
    /// CPU architecture
    pub arch: String,
    /// Agent version
    pub version: String,
}

impl HostInfo {
    /// Host info for the running platform
    pub fn current(client_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: version.into(),
        }
    }
}

#[derive(Serialize)]
struct InitPayload<'a> {
    manifest: &'a ModuleManifest,
    host: &'a HostInfo,
}

/// One record of the host/module protocol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleMessage {
    /// Record type: `init`, `event` or `log`
    #[serde(rename = "type")]
    pub kind: String,
    /// Event name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Type specific payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModuleMessage {
    /// Bare record of the given type
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            event: None,
            payload: None,
            error: None,
        }
    }

    /// `init` record carrying the manifest and host metadata
    pub fn init(manifest: &ModuleManifest, host: &HostInfo) -> Result<Self, ProtocolError> {
        // Named encoding keeps structs as maps so guests can look fields up by key
        let bytes = rmp_serde::to_vec_named(&InitPayload { manifest, host })?;
        let payload = rmpv::decode::read_value(&mut bytes.as_slice())?;
        Ok(Self {
            payload: Some(payload),
            ..Self::new("init")
        })
    }

    /// `event` record
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: Some(event.into()),
            payload: Some(payload),
            ..Self::new("event")
        }
    }

    /// Interpret a decoded record; fields are extracted with defaults
    pub fn from_value(value: &Value) -> Self {
        let fields = Fields::new(value);
        let event = fields.str("event");
        let error = fields.str("error");
        Self {
            kind: fields.str("type"),
            event: (!event.is_empty()).then_some(event),
            payload: fields.get("payload").cloned(),
            error: (!error.is_empty()).then_some(error),
        }
    }

    /// Serialize as one self-delimiting msgpack record
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }
}
