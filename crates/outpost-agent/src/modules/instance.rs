//! One loaded module and its sandbox

use crate::error::{AgentError, Result};
use crate::lifecycle::Lifecycle;
use crate::task::payload_message;
use outpost_proto::{ModuleManifest, ModuleMessage};
use outpost_wasm::{HostInput, WasmError, WasmInstance, WasmRuntime};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A module instantiated inside its own sandbox runtime
pub(crate) struct ModuleInstance {
    id: String,
    manifest: ModuleManifest,
    runtime: WasmRuntime,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
    // Held for the whole encode-and-send so records never interleave
    input: Mutex<Option<HostInput>>,
    parked: Mutex<Option<WasmInstance>>,
}

impl ModuleInstance {
    pub(crate) fn new(manifest: ModuleManifest, runtime: WasmRuntime, input: HostInput) -> Self {
        Self {
            id: manifest.id.clone(),
            manifest,
            runtime,
            cancel: CancellationToken::new(),
            lifecycle: Lifecycle::new(),
            input: Mutex::new(Some(input)),
            parked: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    /// Token cancelled when the instance closes
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Write one record to the module's input
    pub(crate) fn send(&self, message: &ModuleMessage) -> Result<()> {
        let record = message.encode()?;
        let input = self.input.lock().unwrap_or_else(|e| e.into_inner());
        let input = input
            .as_ref()
            .ok_or_else(|| AgentError::Sandbox(format!("module {} is closed", self.id)))?;
        input
            .send(record)
            .map_err(|e| AgentError::Sandbox(format!("failed to write to module {}: {}", self.id, e)))
    }

    /// Run the entry point on a dedicated thread
    pub(crate) fn start_entry(&self, instance: WasmInstance) -> Result<()> {
        let id = self.id.clone();
        std::thread::Builder::new()
            .name(format!("module-{}", id))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(move || instance.run()));
                match outcome {
                    Ok(Ok(())) => info!(module = %id, "module entry point returned"),
                    Ok(Err(WasmError::Interrupted)) => debug!(module = %id, "module interrupted"),
                    Ok(Err(e)) => warn!(module = %id, "module entry point failed: {}", e),
                    Err(payload) => {
                        error!(module = %id, "module thread panicked: {}", payload_message(payload.as_ref()))
                    }
                }
            })
            .map(|_| ())
            .map_err(|e| AgentError::Process(format!("failed to start module {}: {}", self.id, e)))
    }

    /// Keep a sandbox without an entry point alive until close
    pub(crate) fn park(&self, instance: WasmInstance) {
        *self.parked.lock().unwrap_or_else(|e| e.into_inner()) = Some(instance);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Tear the sandbox down; later calls are no-ops
    pub(crate) fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        debug!(module = %self.id, "closing module");
        self.cancel.cancel();
        // Dropping the input gives the guest EOF on stdin
        self.input.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.runtime.interrupt();
        self.parked.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.lifecycle.finish_close();
    }
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        self.close();
    }
}
