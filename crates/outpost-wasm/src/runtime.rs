//! Sandboxed WASM execution with WASI stdio wired to host pipes

use crate::error::WasmError;
use crate::module::{WasmModule, ENTRY_POINT};
use crate::pipe::{GuestInput, GuestOutput};
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasi_common::I32Exit;
use wasmtime::{Engine, Linker, Store, StoreLimits, StoreLimitsBuilder, Trap, TypedFunc};
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder};

/// Per-store state: WASI context and resource limits
pub struct WasmContext {
    wasi: WasiCtx,
    limits: StoreLimits,
}

impl std::fmt::Debug for WasmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmContext").finish_non_exhaustive()
    }
}

/// Configuration for WASM execution
#[derive(Debug, Clone)]
pub struct WasmConfig {
    /// Maximum linear memory per instance in bytes (default: 64MB)
    pub max_memory: u64,
    /// Maximum fuel; `None` leaves long-running modules unmetered
    pub max_fuel: Option<u64>,
    /// Maximum native stack used by guest code
    pub max_wasm_stack: usize,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024,
            max_fuel: None,
            max_wasm_stack: 1024 * 1024,
        }
    }
}

/// Guest ends of the three stdio pipes
#[derive(Debug)]
pub struct GuestStdio {
    /// Guest stdin
    pub stdin: GuestInput,
    /// Guest stdout
    pub stdout: GuestOutput,
    /// Guest stderr
    pub stderr: GuestOutput,
}

/// WASM runtime owning one wasmtime engine
///
/// Each loaded module gets its own runtime so that interrupting one guest
/// never disturbs another.
#[derive(Clone)]
pub struct WasmRuntime {
    engine: Engine,
    config: WasmConfig,
}

impl std::fmt::Debug for WasmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WasmRuntime {
    /// Create a new WASM runtime with default configuration
    pub fn new() -> Result<Self, WasmError> {
        Self::with_config(WasmConfig::default())
    }

    /// Create a new WASM runtime with custom configuration
    pub fn with_config(config: WasmConfig) -> Result<Self, WasmError> {
        let mut wasmtime_config = wasmtime::Config::new();
        wasmtime_config.max_wasm_stack(config.max_wasm_stack);
        wasmtime_config.epoch_interruption(true);
        if config.max_fuel.is_some() {
            wasmtime_config.consume_fuel(true);
        }

        let engine = Engine::new(&wasmtime_config)?;
        Ok(Self { engine, config })
    }

    /// Validate and compile module bytes for this runtime's engine
    pub fn load_module(&self, bytes: &[u8]) -> Result<WasmModule, WasmError> {
        WasmModule::compile(&self.engine, bytes)
    }

    /// Instantiate a module with its stdio connected to the given pipes
    ///
    /// The guest gets no preopened directories, no environment and no
    /// network. The entry point is resolved but not started.
    pub fn instantiate(&self, module: &WasmModule, stdio: GuestStdio) -> Result<WasmInstance, WasmError> {
        let mut builder = WasiCtxBuilder::new();
        builder
            .stdin(Box::new(ReadPipe::new(stdio.stdin)))
            .stdout(Box::new(WritePipe::new(stdio.stdout)))
            .stderr(Box::new(WritePipe::new(stdio.stderr)));
        let wasi = builder.build();

        let limits = StoreLimitsBuilder::new()
            .memory_size(usize::try_from(self.config.max_memory).unwrap_or(usize::MAX))
            .build();

        let mut store = Store::new(&self.engine, WasmContext { wasi, limits });
        store.limiter(|ctx| &mut ctx.limits);
        store.set_epoch_deadline(1);
        if let Some(fuel) = self.config.max_fuel {
            store.add_fuel(fuel)?;
        }

        let mut linker = Linker::new(&self.engine);
        wasmtime_wasi::add_to_linker(&mut linker, |ctx: &mut WasmContext| &mut ctx.wasi)?;

        let instance = linker
            .instantiate(&mut store, module.module())
            .map_err(|e| WasmError::Instantiation(e.to_string()))?;

        let entry = if module.has_entry_point() {
            Some(instance.get_typed_func::<(), ()>(&mut store, ENTRY_POINT)?)
        } else {
            None
        };

        Ok(WasmInstance { store, entry })
    }

    /// Ask every running guest of this runtime to trap at its next check
    pub fn interrupt(&self) {
        self.engine.increment_epoch();
    }

    /// Get the runtime configuration
    pub fn config(&self) -> &WasmConfig {
        &self.config
    }
}

/// An instantiated guest ready to run its entry point
pub struct WasmInstance {
    store: Store<WasmContext>,
    entry: Option<TypedFunc<(), ()>>,
}

impl std::fmt::Debug for WasmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmInstance")
            .field("has_entry_point", &self.entry.is_some())
            .finish()
    }
}

impl WasmInstance {
    /// Whether the guest exports `_start`
    pub fn has_entry_point(&self) -> bool {
        self.entry.is_some()
    }

    /// Run the entry point to completion on the current thread
    ///
    /// Blocks for as long as the guest runs. `proc_exit(0)` is a clean
    /// return.
    pub fn run(mut self) -> Result<(), WasmError> {
        let Some(entry) = self.entry else {
            return Ok(());
        };

        match entry.call(&mut self.store, ()) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<I32Exit>() {
                    return match exit.0 {
                        0 => Ok(()),
                        code => Err(WasmError::Execution(format!("guest exited with status {}", code))),
                    };
                }
                if matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
                    return Err(WasmError::Interrupted);
                }
                Err(WasmError::Execution(format!("{:#}", e)))
            }
        }
    }
}
