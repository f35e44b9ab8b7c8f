//! Routes decoded envelopes to the command handlers, console hub and module host

use crate::cancel::CancelRegistry;
use crate::command::{CommandContext, CommandHandler, CommandType};
use crate::config::AgentConfig;
use crate::console::{default_shell, ConsoleHub};
use crate::handlers::{ExecHandler, PingHandler, PluginCommandHandler};
use crate::modules::ModuleHost;
use crate::task::{panic_message, spawn_supervised};
use outpost_proto::{Envelope, Outbound, TransportWriter, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Single entry point for every inbound envelope
///
/// Dispatching never fails: bad input, handler errors and handler panics are
/// all reported to the controller or logged, and the next envelope is served.
pub struct Dispatcher {
    writer: Arc<dyn TransportWriter>,
    registry: Arc<CancelRegistry>,
    console: ConsoleHub,
    modules: ModuleHost,
    handlers: RwLock<HashMap<CommandType, Arc<dyn CommandHandler>>>,
}

impl Dispatcher {
    /// Dispatcher with the built-in handlers registered
    pub fn new(writer: Arc<dyn TransportWriter>, config: &AgentConfig) -> Self {
        let shell = config.console_shell.clone().unwrap_or_else(default_shell);
        let console = ConsoleHub::new(Arc::clone(&writer), shell);
        let modules = ModuleHost::new(Arc::clone(&writer), config.host_info(), config.wasm.clone());

        let mut handlers: HashMap<CommandType, Arc<dyn CommandHandler>> = HashMap::new();
        handlers.insert(CommandType::Ping, Arc::new(PingHandler));
        handlers.insert(CommandType::Exec, Arc::new(ExecHandler::new(config.exec_timeout)));
        let plugins: Arc<dyn CommandHandler> = Arc::new(PluginCommandHandler::new(modules.clone()));
        for kind in [
            CommandType::PluginLoad,
            CommandType::PluginLoadInit,
            CommandType::PluginLoadChunk,
            CommandType::PluginLoadFinish,
            CommandType::PluginUnload,
            CommandType::PluginEvent,
        ] {
            handlers.insert(kind, Arc::clone(&plugins));
        }

        Self {
            writer,
            registry: Arc::new(CancelRegistry::new()),
            console,
            modules,
            handlers: RwLock::new(handlers),
        }
    }

    /// Register or replace the handler for a command type
    pub async fn register_handler(&self, kind: CommandType, handler: Arc<dyn CommandHandler>) {
        debug!(command_type = %kind, "registered command handler");
        self.handlers.write().await.insert(kind, handler);
    }

    /// Handle one envelope
    pub async fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Ping { ts } => self.emit(Outbound::Pong { ts }).await,
            Envelope::Command {
                id,
                command_type,
                payload,
            } => self.dispatch_command(id, command_type, payload).await,
            Envelope::CommandAbort { command_id } => {
                if self.registry.cancel(&command_id) {
                    info!(command = %command_id, "command aborted");
                } else {
                    debug!(command = %command_id, "abort for command that is not abortable");
                }
            }
            Envelope::PluginEvent {
                plugin_id,
                event,
                payload,
            } => {
                if plugin_id.is_empty() || event.is_empty() {
                    warn!(module = %plugin_id, "plugin event without module id or event name dropped");
                    return;
                }
                if let Err(e) = self.modules.dispatch(&plugin_id, &event, payload).await {
                    warn!(module = %plugin_id, "failed to deliver event {}: {}", event, e);
                }
            }
            Envelope::ConsoleStart {
                session_id,
                cols,
                rows,
            } => {
                if let Err(e) = self.console.start(&session_id, cols, rows).await {
                    warn!(session = %session_id, "console start failed: {}", e);
                }
            }
            Envelope::ConsoleWrite { session_id, data } => {
                if let Err(e) = self.console.write(&session_id, data).await {
                    self.emit(Outbound::console_error(&session_id, e.to_string())).await;
                }
            }
            Envelope::ConsoleResize {
                session_id,
                cols,
                rows,
            } => {
                if let Err(e) = self.console.resize(&session_id, cols, rows).await {
                    self.emit(Outbound::console_error(&session_id, e.to_string())).await;
                }
            }
            Envelope::ConsoleStop { session_id } => self.console.stop(&session_id).await,
            Envelope::Unknown { kind } => debug!(kind = %kind, "ignoring unknown envelope type"),
        }
    }

    async fn dispatch_command(&self, id: String, command_type: String, payload: Value) {
        let Some(kind) = CommandType::parse(&command_type) else {
            warn!(command = %id, command_type = %command_type, "unknown command type");
            let message = format!("unknown command type: {}", command_type);
            self.emit(Outbound::command_result(id, false, message)).await;
            return;
        };

        let handler = self.handlers.read().await.get(&kind).cloned();
        let Some(handler) = handler else {
            let message = format!("unsupported command type: {}", kind);
            self.emit(Outbound::command_result(id, false, message)).await;
            return;
        };

        debug!(command = %id, command_type = %kind, "dispatching command");
        let ctx = CommandContext::new(
            id.clone(),
            kind,
            payload,
            Arc::clone(&self.writer),
            Arc::clone(&self.registry),
        );
        let task = tokio::spawn(async move { handler.handle(ctx).await });

        let writer = Arc::clone(&self.writer);
        let report = async move {
            let failure = match task.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("{:#}", e),
                Err(e) if e.is_panic() => format!("command panicked: {}", panic_message(e)),
                Err(e) => e.to_string(),
            };
            warn!(command = %id, "command failed: {}", failure);
            if let Err(e) = writer.send(&Outbound::command_result(&id, false, failure)).await {
                warn!(command = %id, "failed to report command failure: {}", e);
            }
        };

        if kind.runs_detached() {
            spawn_supervised(format!("command-{}", kind), report);
        } else {
            report.await;
        }
    }

    /// Cancel abortable commands and close every session and module
    pub async fn shutdown(&self) {
        info!("shutting down dispatcher");
        self.registry.cancel_all();
        self.console.close_all().await;
        self.modules.close().await;
    }

    /// Registry of abortable commands
    pub fn registry(&self) -> &Arc<CancelRegistry> {
        &self.registry
    }

    /// Console session hub
    pub fn console(&self) -> &ConsoleHub {
        &self.console
    }

    /// Module host
    pub fn modules(&self) -> &ModuleHost {
        &self.modules
    }

    async fn emit(&self, message: Outbound) {
        if let Err(e) = self.writer.send(&message).await {
            warn!("failed to send {:?}: {}", message, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use outpost_proto::test_utils::{map, RecordingWriter};
    use outpost_proto::Fields;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    struct PanickingHandler;

    #[async_trait]
    impl CommandHandler for PanickingHandler {
        async fn handle(&self, _ctx: CommandContext) -> anyhow::Result<()> {
            panic!("screen capture exploded");
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl CommandHandler for FailingHandler {
        async fn handle(&self, _ctx: CommandContext) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk full").context("listing failed"))
        }
    }

    struct WaitForAbort;

    #[async_trait]
    impl CommandHandler for WaitForAbort {
        async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
            let abort = ctx.abortable();
            ctx.progress("waiting").await;
            abort.cancelled().await;
            ctx.complete(false, "command aborted").await;
            Ok(())
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<RecordingWriter>) {
        let writer = Arc::new(RecordingWriter::new());
        let dispatcher = Dispatcher::new(writer.clone(), &AgentConfig::default());
        (dispatcher, writer)
    }

    fn command(id: &str, kind: &str) -> Envelope {
        Envelope::Command {
            id: id.to_string(),
            command_type: kind.to_string(),
            payload: Value::Nil,
        }
    }

    fn result_for(messages: &[Value], id: &str) -> Option<(bool, String)> {
        messages
            .iter()
            .map(Fields::new)
            .find(|f| f.str("type") == "command_result" && f.str("commandId") == id)
            .map(|f| (f.bool("ok"), f.str("message")))
    }

    #[tokio::test]
    async fn test_ping_envelope() {
        let (dispatcher, writer) = dispatcher();
        dispatcher.dispatch(Envelope::Ping { ts: 1_700_000_000 }).await;

        let messages = writer.messages_of("pong");
        assert_eq!(messages.len(), 1);
        assert_eq!(Fields::new(&messages[0]).int("ts"), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_ping_command_is_ordered() {
        let (dispatcher, writer) = dispatcher();
        dispatcher.dispatch(command("c1", "ping")).await;
        assert_eq!(result_for(&writer.messages(), "c1"), Some((true, "pong".to_string())));
    }

    #[tokio::test]
    async fn test_unknown_and_unsupported_command_types() {
        let (dispatcher, writer) = dispatcher();
        dispatcher.dispatch(command("c1", "format_disk")).await;
        dispatcher.dispatch(command("c2", "screenshot")).await;

        let messages = writer.messages();
        assert_eq!(
            result_for(&messages, "c1"),
            Some((false, "unknown command type: format_disk".to_string()))
        );
        assert_eq!(
            result_for(&messages, "c2"),
            Some((false, "unsupported command type: screenshot".to_string()))
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_result() {
        let (dispatcher, writer) = dispatcher();
        dispatcher
            .register_handler(CommandType::Screenshot, Arc::new(PanickingHandler))
            .await;

        dispatcher.dispatch(command("c1", "screenshot")).await;
        let result = writer
            .wait_for(WAIT, |m| Fields::new(m).str("commandId") == "c1")
            .await
            .expect("failure result");
        let fields = Fields::new(&result);
        assert!(!fields.bool("ok"));
        assert!(fields.str("message").contains("screen capture exploded"));

        // Later envelopes are still served
        dispatcher.dispatch(Envelope::Ping { ts: 7 }).await;
        assert_eq!(writer.messages_of("pong").len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_reports_chain() {
        let (dispatcher, writer) = dispatcher();
        dispatcher
            .register_handler(CommandType::FileList, Arc::new(FailingHandler))
            .await;

        dispatcher.dispatch(command("c1", "file_list")).await;
        let result = writer
            .wait_for(WAIT, |m| Fields::new(m).str("commandId") == "c1")
            .await
            .expect("failure result");
        assert_eq!(Fields::new(&result).str("message"), "listing failed: disk full");
    }

    #[tokio::test]
    async fn test_abort_registered_command() {
        let (dispatcher, writer) = dispatcher();
        dispatcher
            .register_handler(CommandType::ScriptExec, Arc::new(WaitForAbort))
            .await;

        dispatcher.dispatch(command("c1", "script_exec")).await;
        assert!(writer.wait_until(WAIT, |m| !m.is_empty()).await);
        assert!(dispatcher.registry().is_registered("c1"));

        dispatcher
            .dispatch(Envelope::CommandAbort {
                command_id: "c1".to_string(),
            })
            .await;
        assert!(writer
            .wait_until(WAIT, |m| result_for(m, "c1").is_some())
            .await);
        assert_eq!(
            result_for(&writer.messages(), "c1"),
            Some((false, "command aborted".to_string()))
        );
    }

    #[tokio::test]
    async fn test_abort_unknown_command_is_silent() {
        let (dispatcher, writer) = dispatcher();
        dispatcher
            .dispatch(Envelope::CommandAbort {
                command_id: "c1".to_string(),
            })
            .await;
        assert!(writer.messages().is_empty());

        dispatcher.dispatch(Envelope::Ping { ts: 1 }).await;
        assert_eq!(writer.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_plugin_event_is_dropped() {
        let (dispatcher, writer) = dispatcher();
        dispatcher
            .dispatch(Envelope::PluginEvent {
                plugin_id: String::new(),
                event: "refresh".to_string(),
                payload: Value::Nil,
            })
            .await;
        dispatcher
            .dispatch(Envelope::PluginEvent {
                plugin_id: "m1".to_string(),
                event: "refresh".to_string(),
                payload: map(vec![]),
            })
            .await;
        dispatcher
            .dispatch(Envelope::Unknown {
                kind: "telemetry".to_string(),
            })
            .await;
        assert!(writer.messages().is_empty());
    }

    #[tokio::test]
    async fn test_console_errors_for_unknown_session() {
        let (dispatcher, writer) = dispatcher();
        dispatcher
            .dispatch(Envelope::ConsoleWrite {
                session_id: "missing".to_string(),
                data: b"ls\n".to_vec(),
            })
            .await;
        dispatcher
            .dispatch(Envelope::ConsoleResize {
                session_id: "missing".to_string(),
                cols: 80,
                rows: 24,
            })
            .await;
        dispatcher
            .dispatch(Envelope::ConsoleStop {
                session_id: "missing".to_string(),
            })
            .await;

        let errors = writer.messages_of("console_output");
        assert_eq!(errors.len(), 2);
        for error in &errors {
            let fields = Fields::new(error);
            assert_eq!(fields.str("sessionId"), "missing");
            assert!(fields.str("error").contains("session not found"));
        }
    }
}
