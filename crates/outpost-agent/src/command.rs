//! Command types and the handler seam

use crate::cancel::{AbortHandle, CancelRegistry};
use async_trait::async_trait;
use outpost_proto::{Fields, Outbound, TransportWriter, Value};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

macro_rules! command_types {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// The closed set of command subtypes the agent recognises
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandType {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )*
        }

        impl CommandType {
            /// Every recognised command type
            pub const ALL: &'static [CommandType] = &[$(CommandType::$variant),*];

            /// Parse a wire name; `None` for unrecognised names
            pub fn parse(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(CommandType::$variant),)*
                    _ => None,
                }
            }

            /// Wire name of this command type
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(CommandType::$variant => $name,)*
                }
            }
        }
    };
}

command_types! {
    Ping => "ping",
    Exec => "exec",
    ScriptExec => "script_exec",
    FileList => "file_list",
    FileRead => "file_read",
    FileWrite => "file_write",
    FileDownload => "file_download",
    FileUpload => "file_upload",
    FileDelete => "file_delete",
    FileMkdir => "file_mkdir",
    FileCopy => "file_copy",
    FileMove => "file_move",
    FileChmod => "file_chmod",
    FileZip => "file_zip",
    FileSearch => "file_search",
    ProcessList => "process_list",
    ProcessKill => "process_kill",
    Screenshot => "screenshot",
    DesktopStart => "desktop_start",
    DesktopStop => "desktop_stop",
    PluginLoad => "plugin_load",
    PluginLoadInit => "plugin_load_init",
    PluginLoadChunk => "plugin_load_chunk",
    PluginLoadFinish => "plugin_load_finish",
    PluginUnload => "plugin_unload",
    PluginEvent => "plugin_event",
}

impl CommandType {
    /// Whether the dispatcher may run this command without waiting for it
    ///
    /// Module commands and `ping` keep their arrival order.
    pub fn runs_detached(&self) -> bool {
        !matches!(
            self,
            CommandType::Ping
                | CommandType::PluginLoad
                | CommandType::PluginLoadInit
                | CommandType::PluginLoadChunk
                | CommandType::PluginLoadFinish
                | CommandType::PluginUnload
                | CommandType::PluginEvent
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler for one or more command types
///
/// A handler reports through its [`CommandContext`]. Returning `Err` makes
/// the dispatcher send a failed result carrying the error text.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute a command
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()>;
}

/// Everything a handler needs to execute and report on one command
pub struct CommandContext {
    command_id: String,
    command_type: CommandType,
    payload: Value,
    writer: Arc<dyn TransportWriter>,
    registry: Arc<CancelRegistry>,
}

impl CommandContext {
    pub(crate) fn new(
        command_id: String,
        command_type: CommandType,
        payload: Value,
        writer: Arc<dyn TransportWriter>,
        registry: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            command_id,
            command_type,
            payload,
            writer,
            registry,
        }
    }

    /// Command id chosen by the controller
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// The command's type
    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    /// Typed view over the payload
    pub fn payload(&self) -> Fields<'_> {
        Fields::new(&self.payload)
    }

    /// Make the command abortable until the returned handle is dropped
    pub fn abortable(&self) -> AbortHandle {
        self.registry.register(self.command_id.clone())
    }

    /// Report progress
    pub async fn progress(&self, message: impl Into<String>) {
        self.send(Outbound::command_progress(&self.command_id, message)).await;
    }

    /// Report the terminal result
    pub async fn complete(&self, ok: bool, message: impl Into<String>) {
        self.send(Outbound::command_result(&self.command_id, ok, message)).await;
    }

    async fn send(&self, message: Outbound) {
        if let Err(e) = self.writer.send(&message).await {
            warn!(command = %self.command_id, "failed to report command status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_proto::test_utils::{map, RecordingWriter};

    #[test]
    fn test_parse_round_trip() {
        for kind in CommandType::ALL {
            assert_eq!(CommandType::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(CommandType::parse("format_disk"), None);
        assert_eq!(CommandType::parse(""), None);
    }

    #[test]
    fn test_ordering_classes() {
        assert!(!CommandType::Ping.runs_detached());
        assert!(!CommandType::PluginLoadChunk.runs_detached());
        assert!(CommandType::Exec.runs_detached());
        assert!(CommandType::Screenshot.runs_detached());
    }

    #[tokio::test]
    async fn test_context_reports() {
        let writer = Arc::new(RecordingWriter::new());
        let registry = Arc::new(CancelRegistry::new());
        let ctx = CommandContext::new(
            "c1".to_string(),
            CommandType::Exec,
            map(vec![("command", Value::from("true"))]),
            writer.clone(),
            registry.clone(),
        );

        assert_eq!(ctx.payload().str("command"), "true");
        {
            let _abort = ctx.abortable();
            assert!(registry.is_registered("c1"));
        }
        assert!(registry.is_empty());

        ctx.progress("started").await;
        ctx.complete(true, "done").await;

        let messages = writer.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(Fields::new(&messages[0]).str("type"), "command_progress");
        let result = Fields::new(&messages[1]);
        assert_eq!(result.str("commandId"), "c1");
        assert!(result.bool("ok"));
        assert_eq!(result.str("message"), "done");
    }
}
