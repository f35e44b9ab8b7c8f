//! WASM module validation and metadata

use crate::error::WasmError;
use sha2::{Digest, Sha256};
use wasmtime::{Engine, Module};

/// Import namespaces the sandbox can satisfy
const WASI_NAMESPACES: &[&str] = &["wasi_snapshot_preview1", "wasi_unstable"];

/// Entry point started after instantiation
pub const ENTRY_POINT: &str = "_start";

/// Largest accepted module payload
pub const MAX_MODULE_SIZE: usize = 64 * 1024 * 1024;

/// Metadata extracted from a compiled module
#[derive(Debug, Clone)]
pub struct ModuleMetadata {
    /// SHA256 hash of the module bytes
    pub hash: String,
    /// Size of the module in bytes
    pub size: usize,
    /// Exported names
    pub exports: Vec<String>,
    /// Imports as `module::name`
    pub imports: Vec<WasmImport>,
    /// Whether the module imports WASI
    pub is_wasi: bool,
}

/// Information about a WASM import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmImport {
    /// Module name (e.g., "wasi_snapshot_preview1")
    pub module: String,
    /// Function name
    pub name: String,
}

/// A validated module compiled for one engine
#[derive(Clone)]
pub struct WasmModule {
    module: Module,
    metadata: ModuleMetadata,
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule")
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl WasmModule {
    /// Validate and compile module bytes
    pub fn compile(engine: &Engine, bytes: &[u8]) -> Result<Self, WasmError> {
        Self::validate_basic_format(bytes)?;

        let module =
            Module::from_binary(engine, bytes).map_err(|e| WasmError::ModuleLoad(e.to_string()))?;
        let metadata = Self::extract_metadata(&module, bytes);
        Self::validate_imports(&metadata)?;

        Ok(Self { module, metadata })
    }

    /// Compiled wasmtime module
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Extracted metadata
    pub fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    /// Get the module hash
    pub fn hash(&self) -> &str {
        &self.metadata.hash
    }

    /// Check if the module is WASI-compatible
    pub fn is_wasi(&self) -> bool {
        self.metadata.is_wasi
    }

    /// Whether `_start` is exported
    pub fn has_entry_point(&self) -> bool {
        self.metadata.exports.iter().any(|e| e == ENTRY_POINT)
    }

    fn extract_metadata(module: &Module, bytes: &[u8]) -> ModuleMetadata {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = format!("{:x}", hasher.finalize());

        let exports = module.exports().map(|e| e.name().to_string()).collect();
        let imports: Vec<WasmImport> = module
            .imports()
            .map(|i| WasmImport {
                module: i.module().to_string(),
                name: i.name().to_string(),
            })
            .collect();
        let is_wasi = imports.iter().any(|i| i.module.starts_with("wasi_"));

        ModuleMetadata {
            hash,
            size: bytes.len(),
            exports,
            imports,
            is_wasi,
        }
    }

    fn validate_basic_format(bytes: &[u8]) -> Result<(), WasmError> {
        if bytes.len() < 8 {
            return Err(WasmError::InvalidFormat(
                "WASM module too small (minimum 8 bytes)".to_string(),
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(WasmError::InvalidFormat("Invalid WASM magic number".to_string()));
        }

        if bytes.len() > MAX_MODULE_SIZE {
            return Err(WasmError::ModuleValidation(format!(
                "Module too large: {} bytes (max: {} bytes)",
                bytes.len(),
                MAX_MODULE_SIZE
            )));
        }

        Ok(())
    }

    fn validate_imports(metadata: &ModuleMetadata) -> Result<(), WasmError> {
        for import in &metadata.imports {
            if !WASI_NAMESPACES.contains(&import.module.as_str()) {
                return Err(WasmError::ModuleValidation(format!(
                    "unresolvable import {}::{}",
                    import.module, import.name
                )));
            }
            if import.name.starts_with("sock_") {
                return Err(WasmError::UnsupportedCapability(
                    "WASI networking is not supported".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_modules::{
        echo_wasm, minimal_wasm, simple_function_wasm, INVALID_MAGIC_WASM,
    };

    fn compile(bytes: &[u8]) -> Result<WasmModule, WasmError> {
        WasmModule::compile(&Engine::default(), bytes)
    }

    #[test]
    fn test_minimal_wasm_module() {
        let module = compile(minimal_wasm()).unwrap();
        assert_eq!(module.metadata().size, minimal_wasm().len());
        assert!(!module.is_wasi());
        assert!(!module.has_entry_point());
        assert!(module.metadata().imports.is_empty());
    }

    #[test]
    fn test_echo_module_detection() {
        let module = compile(echo_wasm()).unwrap();
        assert!(module.is_wasi());
        assert!(module.has_entry_point());
        assert!(module
            .metadata()
            .imports
            .iter()
            .any(|imp| imp.module == "wasi_snapshot_preview1" && imp.name == "fd_read"));
    }

    #[test]
    fn test_invalid_wasm_magic() {
        let result = compile(INVALID_MAGIC_WASM);
        assert!(matches!(result, Err(WasmError::InvalidFormat(_))));
    }

    #[test]
    fn test_empty_bytes() {
        assert!(matches!(compile(&[]), Err(WasmError::InvalidFormat(_))));
    }

    #[test]
    fn test_garbage_after_header() {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        bytes.extend([0xff; 16]);
        assert!(matches!(compile(&bytes), Err(WasmError::ModuleLoad(_))));
    }

    #[test]
    fn test_module_too_large() {
        let mut large_bytes = vec![0x00, 0x61, 0x73, 0x6d];
        large_bytes.extend(vec![0x01, 0x00, 0x00, 0x00]);
        large_bytes.extend(vec![0x00; 65 * 1024 * 1024]);
        assert!(matches!(compile(&large_bytes), Err(WasmError::ModuleValidation(_))));
    }

    #[test]
    fn test_foreign_imports_are_rejected() {
        let bytes = wat::parse_str(
            r#"(module (import "env" "host_call" (func)))"#,
        )
        .unwrap();
        assert!(matches!(compile(&bytes), Err(WasmError::ModuleValidation(_))));
    }

    #[test]
    fn test_socket_imports_are_rejected() {
        let bytes = wat::parse_str(
            r#"(module
                (import "wasi_snapshot_preview1" "sock_accept"
                  (func (param i32 i32 i32) (result i32))))"#,
        )
        .unwrap();
        assert!(matches!(compile(&bytes), Err(WasmError::UnsupportedCapability(_))));
    }

    #[test]
    fn test_hash_calculation() {
        let module1 = compile(minimal_wasm()).unwrap();
        let module2 = compile(simple_function_wasm()).unwrap();
        assert_ne!(module1.hash(), module2.hash());

        let module1_copy = compile(minimal_wasm()).unwrap();
        assert_eq!(module1.hash(), module1_copy.hash());
    }
}
