//! # Outpost Agent
//!
//! Remotely controlled endpoint agent. One controller connection carries
//! commands, interactive console sessions and sandboxed module traffic; all
//! output funnels back through a single framed writer.

#![warn(missing_docs)]

/// Agent main loop and frame processing
pub mod agent;

/// Abortable command registry
pub mod cancel;

/// Command types and the handler trait
pub mod command;

/// Runtime configuration
pub mod config;

/// PTY-backed console sessions
pub mod console;

/// Envelope routing
pub mod dispatcher;

/// Agent error types
pub mod error;

/// Built-in command handlers
pub mod handlers;

/// Close-once lifecycle guard
pub mod lifecycle;

/// Sandboxed module host
pub mod modules;

/// Task spawning with a panic boundary
pub mod task;

pub use agent::AgentLoop;
pub use cancel::{AbortHandle, CancelRegistry};
pub use command::{CommandContext, CommandHandler, CommandType};
pub use config::AgentConfig;
pub use console::ConsoleHub;
pub use dispatcher::Dispatcher;
pub use error::{AgentError, ErrorKind};
pub use modules::ModuleHost;
