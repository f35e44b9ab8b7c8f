//! Built-in command handlers

use crate::command::{CommandContext, CommandHandler, CommandType};
use crate::error::AgentError;
use crate::modules::ModuleHost;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use outpost_proto::ModuleManifest;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Answers `ping` commands
pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, ctx: CommandContext) -> Result<()> {
        ctx.complete(true, "pong").await;
        Ok(())
    }
}

/// Runs a command line through the platform shell
pub struct ExecHandler {
    default_timeout: Option<Duration>,
}

impl ExecHandler {
    /// Handler applying `default_timeout` when the payload sets none
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }
}

fn shell_command(command_line: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl CommandHandler for ExecHandler {
    async fn handle(&self, ctx: CommandContext) -> Result<()> {
        let payload = ctx.payload();
        let command_line = payload.str("command");
        if command_line.trim().is_empty() {
            ctx.complete(false, "command is required").await;
            return Ok(());
        }

        let timeout = match payload.int("timeoutSecs") {
            secs if secs > 0 => Some(Duration::from_secs(secs as u64)),
            _ => self.default_timeout,
        };

        let mut cmd = shell_command(&command_line);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let cwd = payload.str("cwd");
        if !cwd.is_empty() {
            cmd.current_dir(&cwd);
        }

        let abort = ctx.abortable();
        let child = cmd.spawn().context("failed to spawn command")?;
        let pid = child.id().unwrap_or_default();
        debug!(command = %ctx.command_id(), pid, "exec started");
        ctx.progress(format!("started pid {}", pid)).await;

        // Dropping the child on abort or timeout kills it
        tokio::select! {
            _ = abort.cancelled() => {
                info!(command = %ctx.command_id(), pid, "exec aborted");
                ctx.complete(false, "command aborted").await;
            }
            _ = sleep_or_forever(timeout) => {
                let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
                ctx.complete(false, format!("command timed out after {}s", secs)).await;
            }
            output = child.wait_with_output() => {
                let output = output.context("failed to wait for command")?;
                let code = output.status.code().unwrap_or(-1);
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let text = text.trim();
                let message = if text.is_empty() {
                    format!("exit code {}", code)
                } else {
                    text.to_string()
                };
                ctx.complete(output.status.success(), message).await;
            }
        }
        Ok(())
    }
}

/// Handles every `plugin_*` command against the module host
pub struct PluginCommandHandler {
    host: ModuleHost,
}

impl PluginCommandHandler {
    /// Handler driving `host`
    pub fn new(host: ModuleHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl CommandHandler for PluginCommandHandler {
    async fn handle(&self, ctx: CommandContext) -> Result<()> {
        let payload = ctx.payload();
        match ctx.command_type() {
            CommandType::PluginLoad => {
                let manifest = ModuleManifest::from_fields(payload.map("manifest"))
                    .map_err(|_| AgentError::MissingId)?;
                let id = manifest.id.clone();
                self.host.load(manifest, payload.bytes("data")).await?;
                ctx.complete(true, format!("plugin {} loaded", id)).await;
            }
            CommandType::PluginLoadInit => {
                let manifest = ModuleManifest::from_fields(payload.map("manifest"))
                    .map_err(|_| AgentError::InvalidBundle("manifest id is required".to_string()))?;
                let id = manifest.id.clone();
                self.host
                    .start_bundle(manifest, payload.int("totalSize"), payload.int("totalChunks"))?;
                ctx.complete(true, format!("plugin {} upload started", id)).await;
            }
            CommandType::PluginLoadChunk => {
                let id = payload.str("pluginId");
                let data = Bytes::from(payload.bytes("data"));
                let (received, total) = self.host.add_chunk(&id, payload.int("index"), data)?;
                ctx.complete(true, format!("{}/{}", received, total)).await;
            }
            CommandType::PluginLoadFinish => {
                let id = payload.str("pluginId");
                ctx.progress(format!("loading plugin {}", id)).await;
                self.host.finalize_bundle(&id).await?;
                ctx.complete(true, format!("plugin {} loaded", id)).await;
            }
            CommandType::PluginUnload => {
                let id = payload.str("pluginId");
                self.host.unload(&id).await;
                ctx.complete(true, format!("plugin {} unloaded", id)).await;
            }
            CommandType::PluginEvent => {
                let id = payload.str("pluginId");
                let event = payload.str("event");
                if id.is_empty() || event.is_empty() {
                    ctx.complete(false, "pluginId and event are required").await;
                    return Ok(());
                }
                self.host.dispatch(&id, &event, payload.value("payload")).await?;
                ctx.complete(true, "event delivered").await;
            }
            other => anyhow::bail!("plugin handler cannot run {}", other),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelRegistry;
    use outpost_proto::test_utils::{map, RecordingWriter};
    use outpost_proto::{Fields, HostInfo, Value};
    use outpost_wasm::WasmConfig;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(10);

    fn context(
        writer: &Arc<RecordingWriter>,
        registry: &Arc<CancelRegistry>,
        kind: CommandType,
        payload: Value,
    ) -> CommandContext {
        CommandContext::new("c1".to_string(), kind, payload, writer.clone(), registry.clone())
    }

    fn last_result(writer: &RecordingWriter) -> (bool, String) {
        let results = writer.messages_of("command_result");
        let last = results.last().expect("command result");
        let fields = Fields::new(last);
        (fields.bool("ok"), fields.str("message"))
    }

    #[tokio::test]
    async fn test_ping() {
        let writer = Arc::new(RecordingWriter::new());
        let registry = Arc::new(CancelRegistry::new());
        PingHandler
            .handle(context(&writer, &registry, CommandType::Ping, Value::Nil))
            .await
            .unwrap();
        assert_eq!(last_result(&writer), (true, "pong".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_reports_output_and_status() {
        let writer = Arc::new(RecordingWriter::new());
        let registry = Arc::new(CancelRegistry::new());
        let handler = ExecHandler::new(None);

        let payload = map(vec![("command", Value::from("echo hello"))]);
        handler
            .handle(context(&writer, &registry, CommandType::Exec, payload))
            .await
            .unwrap();
        assert_eq!(last_result(&writer), (true, "hello".to_string()));
        assert_eq!(writer.messages_of("command_progress").len(), 1);

        let payload = map(vec![("command", Value::from("exit 3"))]);
        handler
            .handle(context(&writer, &registry, CommandType::Exec, payload))
            .await
            .unwrap();
        assert_eq!(last_result(&writer), (false, "exit code 3".to_string()));
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(RecordingWriter::new());
        let registry = Arc::new(CancelRegistry::new());

        let payload = map(vec![
            ("command", Value::from("pwd")),
            ("cwd", Value::from(dir.path().to_string_lossy().into_owned())),
        ]);
        ExecHandler::new(None)
            .handle(context(&writer, &registry, CommandType::Exec, payload))
            .await
            .unwrap();
        let (ok, message) = last_result(&writer);
        assert!(ok);
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(&message).canonicalize().unwrap(), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_abort() {
        let writer = Arc::new(RecordingWriter::new());
        let registry = Arc::new(CancelRegistry::new());
        let payload = map(vec![("command", Value::from("sleep 30"))]);
        let ctx = context(&writer, &registry, CommandType::Exec, payload);

        let task = tokio::spawn(async move { ExecHandler::new(None).handle(ctx).await });
        assert!(writer.wait_until(WAIT, |m| !m.is_empty()).await);
        assert!(registry.cancel("c1"));

        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(last_result(&writer), (false, "command aborted".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_timeout() {
        let writer = Arc::new(RecordingWriter::new());
        let registry = Arc::new(CancelRegistry::new());
        let payload = map(vec![
            ("command", Value::from("sleep 30")),
            ("timeoutSecs", Value::from(1)),
        ]);
        ExecHandler::new(Some(Duration::from_secs(60)))
            .handle(context(&writer, &registry, CommandType::Exec, payload))
            .await
            .unwrap();
        assert_eq!(
            last_result(&writer),
            (false, "command timed out after 1s".to_string())
        );
    }

    #[tokio::test]
    async fn test_exec_requires_command() {
        let writer = Arc::new(RecordingWriter::new());
        let registry = Arc::new(CancelRegistry::new());
        ExecHandler::new(None)
            .handle(context(&writer, &registry, CommandType::Exec, Value::Nil))
            .await
            .unwrap();
        assert_eq!(last_result(&writer), (false, "command is required".to_string()));
    }

    #[tokio::test]
    async fn test_plugin_commands() {
        let writer = Arc::new(RecordingWriter::new());
        let registry = Arc::new(CancelRegistry::new());
        let host = ModuleHost::new(
            writer.clone(),
            HostInfo::current("client-1", "0.1.0"),
            WasmConfig::default(),
        );
        let handler = PluginCommandHandler::new(host.clone());

        let init = map(vec![
            ("manifest", map(vec![("id", Value::from("m1"))])),
            ("totalSize", Value::from(4)),
            ("totalChunks", Value::from(2)),
        ]);
        handler
            .handle(context(&writer, &registry, CommandType::PluginLoadInit, init))
            .await
            .unwrap();
        assert!(host.has_pending_bundle("m1"));

        let chunk = map(vec![
            ("pluginId", Value::from("m1")),
            ("index", Value::from(1)),
            ("data", Value::Binary(b"CD".to_vec())),
        ]);
        handler
            .handle(context(&writer, &registry, CommandType::PluginLoadChunk, chunk))
            .await
            .unwrap();
        assert_eq!(last_result(&writer), (true, "1/2".to_string()));

        // Finishing early is an error and keeps the upload pending
        let finish = map(vec![("pluginId", Value::from("m1"))]);
        let error = handler
            .handle(context(&writer, &registry, CommandType::PluginLoadFinish, finish))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("bundle incomplete"));
        assert!(host.has_pending_bundle("m1"));

        let event = map(vec![("pluginId", Value::from("m1"))]);
        handler
            .handle(context(&writer, &registry, CommandType::PluginEvent, event))
            .await
            .unwrap();
        assert_eq!(
            last_result(&writer),
            (false, "pluginId and event are required".to_string())
        );

        let unload = map(vec![("pluginId", Value::from("m1"))]);
        handler
            .handle(context(&writer, &registry, CommandType::PluginUnload, unload))
            .await
            .unwrap();
        assert!(last_result(&writer).0);
    }
}
