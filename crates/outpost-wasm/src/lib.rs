//! # Outpost WASM Sandbox
//!
//! Loads untrusted extension modules into wasmtime with WASI stdio wired to
//! in-process pipes, so the host can talk to each guest over a byte-stream
//! protocol while the guest runs on its own thread.

#![warn(missing_docs)]

/// WASM module loading and validation
pub mod module;

/// WASM execution runtime
pub mod runtime;

/// Channel-backed stdio pipes
pub mod pipe;

/// WASM-specific error types
pub mod error;

/// Test utilities for WASM modules
pub mod test_utils;

pub use error::WasmError;
pub use module::{ModuleMetadata, WasmImport, WasmModule, ENTRY_POINT, MAX_MODULE_SIZE};
pub use pipe::{input_pipe, output_pipe, GuestInput, GuestOutput, HostInput, HostOutput};
pub use runtime::{GuestStdio, WasmConfig, WasmContext, WasmInstance, WasmRuntime};
