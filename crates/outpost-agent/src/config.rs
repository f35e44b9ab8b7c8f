//! Agent configuration

use outpost_proto::{HostInfo, MAX_FRAME_SIZE};
use outpost_wasm::WasmConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Runtime configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity reported to modules
    pub client_id: String,
    /// Agent version reported to modules
    pub version: String,
    /// Shell argv for console sessions; platform default when `None`
    pub console_shell: Option<Vec<String>>,
    /// Default timeout for `exec` commands
    pub exec_timeout: Option<Duration>,
    /// Largest accepted controller frame
    pub max_frame_size: usize,
    /// Sandbox limits for loaded modules
    pub wasm: WasmConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            console_shell: None,
            exec_timeout: None,
            max_frame_size: MAX_FRAME_SIZE,
            wasm: WasmConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Read overrides from `OUTPOST_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(client_id) = lookup("OUTPOST_CLIENT_ID").filter(|v| !v.trim().is_empty()) {
            config.client_id = client_id.trim().to_string();
        }
        if let Some(shell) = lookup("OUTPOST_SHELL") {
            let argv: Vec<String> = shell.split_whitespace().map(str::to_owned).collect();
            if !argv.is_empty() {
                config.console_shell = Some(argv);
            }
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "OUTPOST_EXEC_TIMEOUT_SECS") {
            config.exec_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(size) = parse_var::<usize>(&lookup, "OUTPOST_MAX_FRAME_SIZE") {
            config.max_frame_size = size;
        }
        if let Some(bytes) = parse_var::<u64>(&lookup, "OUTPOST_MODULE_MAX_MEMORY") {
            config.wasm.max_memory = bytes;
        }

        config
    }

    /// Static metadata handed to modules on `init`
    pub fn host_info(&self) -> HostInfo {
        HostInfo::current(&self.client_id, &self.version)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(%key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}
