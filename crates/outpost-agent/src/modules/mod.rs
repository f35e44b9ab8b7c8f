//! Sandboxed module host
//!
//! Owns every loaded module and every upload in progress. Modules talk to the
//! host over their stdio using back-to-back msgpack records: the host writes
//! `init` and `event` records to stdin and reads `log` and `event` records
//! from stdout. Module events are forwarded to the controller as
//! `plugin_event` messages.

mod bundle;
mod instance;

pub use bundle::{PendingBundle, MAX_BUNDLE_CHUNKS};

use crate::error::{AgentError, Result};
use crate::task::spawn_supervised;
use bytes::Bytes;
use instance::ModuleInstance;
use outpost_proto::{
    HostInfo, ModuleManifest, ModuleMessage, Outbound, RecordDecoder, TransportWriter, Value,
};
use outpost_wasm::{
    input_pipe, output_pipe, GuestStdio, HostOutput, WasmConfig, WasmError, WasmRuntime,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STDERR_CHUNK_SIZE: usize = 4096;

/// Registry of loaded modules and pending uploads
#[derive(Clone)]
pub struct ModuleHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    writer: Arc<dyn TransportWriter>,
    host_info: HostInfo,
    config: WasmConfig,
    modules: RwLock<HashMap<String, Arc<ModuleInstance>>>,
    pending: StdMutex<HashMap<String, PendingBundle>>,
}

impl ModuleHost {
    /// Host forwarding module events to `writer`
    pub fn new(writer: Arc<dyn TransportWriter>, host_info: HostInfo, config: WasmConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                writer,
                host_info,
                config,
                modules: RwLock::new(HashMap::new()),
                pending: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Begin a chunked upload, replacing any upload for the same id
    pub fn start_bundle(&self, manifest: ModuleManifest, total_size: i64, total_chunks: i64) -> Result<()> {
        let bundle = PendingBundle::new(manifest, total_size, total_chunks)?;
        let id = bundle.manifest().id.clone();
        debug!(module = %id, chunks = bundle.total_chunks(), "bundle upload started");
        if self.pending().insert(id.clone(), bundle).is_some() {
            debug!(module = %id, "discarded previous pending bundle");
        }
        Ok(())
    }

    /// Store one chunk; returns `(received, total)` chunk counts
    pub fn add_chunk(&self, module_id: &str, index: i64, data: Bytes) -> Result<(usize, usize)> {
        let mut pending = self.pending();
        let bundle = pending
            .get_mut(module_id)
            .ok_or_else(|| AgentError::BundleNotStarted(module_id.to_string()))?;
        if !bundle.add_chunk(index, data)? {
            debug!(module = %module_id, index, "duplicate chunk ignored");
        }
        Ok((bundle.received(), bundle.total_chunks()))
    }

    /// Assemble a complete upload and load it, returning the module hash
    ///
    /// An incomplete bundle stays pending so missing chunks can still be sent.
    /// A complete bundle is consumed before loading: if the load fails the
    /// upload must be restarted with a fresh `plugin_load_init`.
    pub async fn finalize_bundle(&self, module_id: &str) -> Result<String> {
        let (manifest, binary) = {
            let mut pending = self.pending();
            let bundle = pending
                .get(module_id)
                .ok_or_else(|| AgentError::BundleNotStarted(module_id.to_string()))?;
            let binary = bundle.assemble()?;
            let manifest = bundle.manifest().clone();
            pending.remove(module_id);
            (manifest, binary)
        };
        self.load(manifest, binary).await
    }

    /// Whether an upload is pending for the id
    pub fn has_pending_bundle(&self, module_id: &str) -> bool {
        self.pending().contains_key(module_id)
    }

    /// Instantiate a module and hand it its `init` record
    ///
    /// A module already loaded under the same id is closed first. Nothing is
    /// registered if instantiation or `init` delivery fails. Returns the
    /// SHA-256 of the module binary.
    pub async fn load(&self, manifest: ModuleManifest, binary: Vec<u8>) -> Result<String> {
        if binary.is_empty() {
            return Err(AgentError::EmptyPayload);
        }
        if manifest.id.is_empty() {
            return Err(AgentError::MissingId);
        }
        let id = manifest.id.clone();

        let previous = self.inner.modules.write().await.remove(&id);
        if let Some(previous) = previous {
            info!(module = %id, "replacing loaded module");
            previous.close();
        }

        let runtime = WasmRuntime::with_config(self.inner.config.clone())?;
        let (host_input, stdin) = input_pipe();
        let (stdout, host_stdout) = output_pipe();
        let (stderr, host_stderr) = output_pipe();

        let sandbox = runtime.clone();
        let (hash, wasm) = tokio::task::spawn_blocking(move || {
            let module = sandbox.load_module(&binary)?;
            let wasm = sandbox.instantiate(&module, GuestStdio { stdin, stdout, stderr })?;
            Ok::<_, WasmError>((module.hash().to_string(), wasm))
        })
        .await
        .map_err(|e| AgentError::Panic(format!("module instantiation task failed: {}", e)))??;

        let instance = Arc::new(ModuleInstance::new(manifest, runtime, host_input));
        self.start_event_loop(&instance, host_stdout);
        start_stderr_drain(instance.id().to_string(), instance.cancel_token(), host_stderr);

        if wasm.has_entry_point() {
            if let Err(e) = instance.start_entry(wasm) {
                instance.close();
                return Err(e);
            }
        } else {
            debug!(module = %id, "module has no entry point, keeping sandbox parked");
            instance.park(wasm);
        }

        let init = ModuleMessage::init(instance.manifest(), &self.inner.host_info)
            .map_err(AgentError::from)
            .and_then(|init| instance.send(&init));
        if let Err(e) = init {
            instance.close();
            return Err(AgentError::Sandbox(format!("init failed for module {}: {}", id, e)));
        }

        let displaced = self
            .inner
            .modules
            .write()
            .await
            .insert(id.clone(), Arc::clone(&instance));
        if let Some(displaced) = displaced {
            displaced.close();
        }
        info!(
            module = %id,
            version = %instance.manifest().version,
            sha256 = %hash,
            "module loaded"
        );
        Ok(hash)
    }

    /// Deliver a controller event to a module; unknown ids are ignored
    pub async fn dispatch(&self, module_id: &str, event: &str, payload: Value) -> Result<()> {
        let instance = self.inner.modules.read().await.get(module_id).cloned();
        match instance {
            Some(instance) => instance.send(&ModuleMessage::event(event, payload)),
            None => {
                debug!(module = %module_id, event = %event, "event for unloaded module dropped");
                Ok(())
            }
        }
    }

    /// Close and remove one module; unknown ids are ignored
    pub async fn unload(&self, module_id: &str) {
        let removed = self.inner.modules.write().await.remove(module_id);
        if let Some(instance) = removed {
            info!(module = %module_id, "module unloaded");
            instance.close();
        }
    }

    /// Close every module and drop pending uploads
    pub async fn close(&self) {
        let instances: Vec<_> = self.inner.modules.write().await.drain().map(|(_, m)| m).collect();
        for instance in instances {
            instance.close();
        }
        self.pending().clear();
    }

    /// Whether a module is loaded under the id
    pub async fn is_loaded(&self, module_id: &str) -> bool {
        self.inner
            .modules
            .read()
            .await
            .get(module_id)
            .is_some_and(|m| m.is_active())
    }

    /// Number of loaded modules
    pub async fn loaded_count(&self) -> usize {
        self.inner.modules.read().await.len()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingBundle>> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_event_loop(&self, instance: &Arc<ModuleInstance>, mut stdout: HostOutput) {
        let inner = Arc::clone(&self.inner);
        let module_id = instance.id().to_string();
        let cancel = instance.cancel_token();

        spawn_supervised(format!("module-events-{}", module_id), async move {
            let mut decoder = RecordDecoder::new();
            loop {
                let record = tokio::select! {
                    _ = cancel.cancelled() => break,
                    record = decoder.read_record(&mut stdout) => record,
                };
                match record {
                    Ok(Some(value)) => inner.handle_record(&module_id, &value).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(module = %module_id, "module output stream failed: {}", e);
                        break;
                    }
                }
            }
            debug!(module = %module_id, "module event loop finished");
        });
    }
}

impl HostInner {
    async fn handle_record(&self, module_id: &str, value: &Value) {
        let message = ModuleMessage::from_value(value);
        match message.kind.as_str() {
            "log" => {
                let text = match &message.payload {
                    Some(Value::String(s)) => s.as_str().unwrap_or_default().to_string(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                info!(module = %module_id, "{}", text);
            }
            "event" => {
                let Some(event) = message.event else {
                    debug!(module = %module_id, "module event without a name dropped");
                    return;
                };
                let outbound = Outbound::PluginEvent {
                    plugin_id: module_id.to_string(),
                    event,
                    payload: message.payload.unwrap_or(Value::Nil),
                };
                if let Err(e) = self.writer.send(&outbound).await {
                    warn!(module = %module_id, "failed to forward module event: {}", e);
                }
            }
            other => debug!(module = %module_id, kind = %other, "ignoring module record"),
        }
    }
}

fn start_stderr_drain(module_id: String, cancel: CancellationToken, mut stderr: HostOutput) {
    spawn_supervised(format!("module-stderr-{}", module_id), async move {
        let mut buf = vec![0u8; STDERR_CHUNK_SIZE];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = stderr.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => warn!(module = %module_id, "{}", String::from_utf8_lossy(&buf[..n]).trim_end()),
                Err(e) => {
                    debug!(module = %module_id, "module stderr closed: {}", e);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_proto::test_utils::{map, RecordingWriter};
    use outpost_proto::Fields;
    use outpost_wasm::test_utils::test_modules::{echo_wasm, minimal_wasm, INVALID_MAGIC_WASM};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn host() -> (ModuleHost, Arc<RecordingWriter>) {
        let writer = Arc::new(RecordingWriter::new());
        let host = ModuleHost::new(
            writer.clone(),
            HostInfo::current("client-1", "0.1.0"),
            WasmConfig::default(),
        );
        (host, writer)
    }

    fn is_event(message: &Value, module: &str, event: &str) -> bool {
        let fields = Fields::new(message);
        fields.str("type") == "plugin_event" && fields.str("pluginId") == module && fields.str("event") == event
    }

    #[tokio::test]
    async fn test_event_round_trip() {
        let (host, writer) = host();
        host.load(ModuleManifest::new("m1"), echo_wasm().to_vec()).await.unwrap();
        assert!(host.is_loaded("m1").await);

        host.dispatch("m1", "greet", map(vec![("name", Value::from("outpost"))]))
            .await
            .unwrap();

        let forwarded = writer
            .wait_for(WAIT, |m| is_event(m, "m1", "greet"))
            .await
            .expect("forwarded event");
        assert_eq!(Fields::new(&forwarded).map("payload").str("name"), "outpost");

        // The echoed init record is not forwarded
        assert_eq!(writer.messages().len(), 1);
        host.close().await;
    }

    #[tokio::test]
    async fn test_init_payload_reaches_module_as_keyed_map() {
        let (host, writer) = host();
        let manifest = ModuleManifest::new("m1");
        host.load(manifest.clone(), echo_wasm().to_vec()).await.unwrap();

        // The echo module reflects records; wrap the init payload in an event so it comes back
        let init = ModuleMessage::init(&manifest, &HostInfo::current("client-1", "0.1.0")).unwrap();
        let instance = host.inner.modules.read().await.get("m1").cloned().unwrap();
        instance
            .send(&ModuleMessage::event("init", init.payload.unwrap()))
            .unwrap();

        let echoed = writer
            .wait_for(WAIT, |m| is_event(m, "m1", "init"))
            .await
            .expect("echoed init payload");
        let payload = Fields::new(&echoed).map("payload");
        assert_eq!(payload.map("manifest").str("id"), "m1");
        assert_eq!(payload.map("manifest").str("name"), "m1");
        assert_eq!(payload.map("host").str("clientId"), "client-1");
        assert_eq!(payload.map("host").str("version"), "0.1.0");
        host.close().await;
    }

    #[tokio::test]
    async fn test_load_reports_module_hash() {
        let (host, _writer) = host();
        let hash = host.load(ModuleManifest::new("m1"), echo_wasm().to_vec()).await.unwrap();

        let expected = WasmRuntime::new().unwrap().load_module(echo_wasm()).unwrap();
        assert_eq!(hash, expected.hash());
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        host.close().await;
    }

    #[tokio::test]
    async fn test_log_and_unnamed_events_are_dropped() {
        let (host, writer) = host();
        host.load(ModuleManifest::new("m1"), echo_wasm().to_vec()).await.unwrap();

        let instance = host.inner.modules.read().await.get("m1").cloned().unwrap();
        let mut log = ModuleMessage::new("log");
        log.payload = Some(Value::from("hello from module"));
        instance.send(&log).unwrap();
        instance.send(&ModuleMessage::new("event")).unwrap();
        host.dispatch("m1", "last", Value::Nil).await.unwrap();

        assert!(writer.wait_for(WAIT, |m| is_event(m, "m1", "last")).await.is_some());
        assert_eq!(writer.messages_of("plugin_event").len(), 1);
        host.close().await;
    }

    #[tokio::test]
    async fn test_load_twice_replaces_instance() {
        let (host, _writer) = host();
        host.load(ModuleManifest::new("m1"), echo_wasm().to_vec()).await.unwrap();
        let first = host.inner.modules.read().await.get("m1").cloned().unwrap();
        let first_cancel = first.cancel_token();

        host.load(ModuleManifest::new("m1"), echo_wasm().to_vec()).await.unwrap();
        assert!(first_cancel.is_cancelled());
        assert!(!first.is_active());
        assert_eq!(host.loaded_count().await, 1);
        assert!(host.is_loaded("m1").await);
        host.close().await;
        assert_eq!(host.loaded_count().await, 0);
    }

    #[tokio::test]
    async fn test_unload_and_unknown_ids() {
        let (host, writer) = host();
        host.load(ModuleManifest::new("m1"), echo_wasm().to_vec()).await.unwrap();

        host.unload("m1").await;
        host.unload("m1").await;
        assert!(!host.is_loaded("m1").await);

        host.dispatch("m1", "late", Value::Nil).await.unwrap();
        host.dispatch("never", "event", Value::Nil).await.unwrap();
        assert!(writer.messages_of("plugin_event").is_empty());
    }

    #[tokio::test]
    async fn test_load_rejections() {
        let (host, _writer) = host();
        assert!(matches!(
            host.load(ModuleManifest::new("m1"), Vec::new()).await,
            Err(AgentError::EmptyPayload)
        ));
        assert!(matches!(
            host.load(ModuleManifest::new(""), echo_wasm().to_vec()).await,
            Err(AgentError::MissingId)
        ));
        assert!(matches!(
            host.load(ModuleManifest::new("bad"), INVALID_MAGIC_WASM.to_vec()).await,
            Err(AgentError::Sandbox(_))
        ));
        assert_eq!(host.loaded_count().await, 0);
    }

    #[tokio::test]
    async fn test_module_without_entry_point_stays_loaded() {
        let (host, _writer) = host();
        host.load(ModuleManifest::new("idle"), minimal_wasm().to_vec()).await.unwrap();
        assert!(host.is_loaded("idle").await);
        host.dispatch("idle", "noop", Value::Nil).await.unwrap();
        host.unload("idle").await;
        assert!(!host.is_loaded("idle").await);
    }

    #[tokio::test]
    async fn test_chunked_upload_loads_module() {
        let (host, writer) = host();
        let binary = echo_wasm();
        let chunks: Vec<&[u8]> = binary.chunks(binary.len() / 3 + 1).collect();

        host.start_bundle(ModuleManifest::new("m1"), binary.len() as i64, chunks.len() as i64)
            .unwrap();
        for (index, chunk) in chunks.iter().enumerate().rev() {
            host.add_chunk("m1", index as i64, Bytes::copy_from_slice(chunk)).unwrap();
        }
        let (received, total) = host.add_chunk("m1", 0, Bytes::copy_from_slice(chunks[0])).unwrap();
        assert_eq!((received, total), (chunks.len(), chunks.len()));

        let hash = host.finalize_bundle("m1").await.unwrap();
        assert_eq!(hash.len(), 64);
        assert!(!host.has_pending_bundle("m1"));

        host.dispatch("m1", "ready", Value::Boolean(true)).await.unwrap();
        assert!(writer.wait_for(WAIT, |m| is_event(m, "m1", "ready")).await.is_some());
        host.close().await;
    }

    #[tokio::test]
    async fn test_bundle_errors() {
        let (host, _writer) = host();
        assert!(matches!(
            host.add_chunk("m1", 0, Bytes::from_static(b"AB")),
            Err(AgentError::BundleNotStarted(_))
        ));
        assert!(matches!(
            host.finalize_bundle("m1").await,
            Err(AgentError::BundleNotStarted(_))
        ));

        assert!(host.start_bundle(ModuleManifest::new("m1"), 4, 0).is_err());
        assert!(!host.has_pending_bundle("m1"));

        host.start_bundle(ModuleManifest::new("m1"), 4, 2).unwrap();
        host.add_chunk("m1", 0, Bytes::from_static(b"AB")).unwrap();
        assert!(matches!(
            host.finalize_bundle("m1").await,
            Err(AgentError::BundleIncomplete { received: 1, total: 2 })
        ));
        assert!(host.has_pending_bundle("m1"));
    }

    #[tokio::test]
    async fn test_failed_load_consumes_complete_bundle() {
        let (host, _writer) = host();
        let chunks: Vec<&[u8]> = INVALID_MAGIC_WASM.chunks(4).collect();
        host.start_bundle(
            ModuleManifest::new("bad"),
            INVALID_MAGIC_WASM.len() as i64,
            chunks.len() as i64,
        )
        .unwrap();
        for (index, chunk) in chunks.iter().enumerate() {
            host.add_chunk("bad", index as i64, Bytes::copy_from_slice(chunk)).unwrap();
        }

        assert!(matches!(host.finalize_bundle("bad").await, Err(AgentError::Sandbox(_))));
        assert!(!host.has_pending_bundle("bad"));
        assert!(!host.is_loaded("bad").await);
        assert!(matches!(
            host.finalize_bundle("bad").await,
            Err(AgentError::BundleNotStarted(_))
        ));
    }
}
