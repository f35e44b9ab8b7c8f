//! Agent error types

use outpost_proto::ProtocolError;
use outpost_wasm::WasmError;
use thiserror::Error;

/// Coarse error classes reported back to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown session, module or command id
    NotFound,
    /// Rejected at the boundary, nothing applied
    InvalidInput,
    /// Finalize attempted before every chunk arrived
    BundleIncomplete,
    /// Module could not be instantiated or initialized
    SandboxFailure,
    /// A shell or module entry point could not be started
    ProcessFailure,
    /// A handler or loop panicked
    Panic,
    /// The controller connection failed
    Transport,
}

/// Errors raised by the agent core
#[derive(Debug, Error)]
pub enum AgentError {
    /// No console session under this id
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// No pending bundle under this id
    #[error("bundle not started: {0}")]
    BundleNotStarted(String),

    /// Bad start-bundle parameters
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    /// Negative chunk index
    #[error("invalid chunk index: {0}")]
    InvalidChunk(i64),

    /// Fewer chunks than declared
    #[error("bundle incomplete: {received}/{total} chunks received")]
    BundleIncomplete {
        /// Distinct chunks received
        received: usize,
        /// Declared chunk count
        total: usize,
    },

    /// A chunk index in range was never received
    #[error("bundle incomplete: missing chunk {0}")]
    MissingChunk(usize),

    /// Module payload was empty
    #[error("module payload is empty")]
    EmptyPayload,

    /// Manifest without an id
    #[error("manifest id is required")]
    MissingId,

    /// Other malformed input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Sandbox setup or message delivery failed
    #[error("sandbox failure: {0}")]
    Sandbox(String),

    /// Child process or thread could not be started
    #[error("process failure: {0}")]
    Process(String),

    /// A task panicked
    #[error("panic: {0}")]
    Panic(String),

    /// Protocol or transport failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl AgentError {
    /// Taxonomy class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::SessionNotFound(_) | AgentError::BundleNotStarted(_) => ErrorKind::NotFound,
            AgentError::InvalidBundle(_)
            | AgentError::InvalidChunk(_)
            | AgentError::EmptyPayload
            | AgentError::MissingId
            | AgentError::InvalidInput(_) => ErrorKind::InvalidInput,
            AgentError::BundleIncomplete { .. } | AgentError::MissingChunk(_) => {
                ErrorKind::BundleIncomplete
            }
            AgentError::Sandbox(_) => ErrorKind::SandboxFailure,
            AgentError::Process(_) => ErrorKind::ProcessFailure,
            AgentError::Panic(_) => ErrorKind::Panic,
            AgentError::Protocol(_) => ErrorKind::Transport,
        }
    }
}

impl From<WasmError> for AgentError {
    fn from(error: WasmError) -> Self {
        AgentError::Sandbox(error.to_string())
    }
}

/// Result alias for agent operations
pub type Result<T, E = AgentError> = std::result::Result<T, E>;
