//! Test utilities for WASM module testing

pub mod test_modules {
    use std::sync::OnceLock;

    fn generate_minimal_wasm() -> Vec<u8> {
        wat::parse_str("(module)").unwrap()
    }

    fn generate_simple_function_wasm() -> Vec<u8> {
        wat::parse_str(
            r#"
            (module
              (func $add (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add)
              (export "add" (func $add)))
        "#,
        )
        .unwrap()
    }

    // Copies stdin to stdout until EOF. Speaks the module record protocol
    // by reflecting every host record back unchanged.
    fn generate_echo_wasm() -> Vec<u8> {
        wat::parse_str(
            r#"
            (module
              (import "wasi_snapshot_preview1" "fd_read"
                (func $fd_read (param i32 i32 i32 i32) (result i32)))
              (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
              (memory 1)
              (export "memory" (memory 0))
              (func $_start
                (loop $next
                  ;; read iovec at 0: buffer at 64, 4096 bytes
                  (i32.store (i32.const 0) (i32.const 64))
                  (i32.store (i32.const 4) (i32.const 4096))
                  (if (i32.ne
                        (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 16))
                        (i32.const 0))
                    (then (return)))
                  (if (i32.eqz (i32.load (i32.const 16)))
                    (then (return)))
                  ;; write iovec at 32 covering the bytes just read
                  (i32.store (i32.const 32) (i32.const 64))
                  (i32.store (i32.const 36) (i32.load (i32.const 16)))
                  (drop (call $fd_write (i32.const 1) (i32.const 32) (i32.const 1) (i32.const 48)))
                  (br $next)))
              (export "_start" (func $_start)))
        "#,
        )
        .unwrap()
    }

    fn generate_stderr_hello_wasm() -> Vec<u8> {
        wat::parse_str(
            r#"
            (module
              (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
              (memory 1)
              (export "memory" (memory 0))
              (data (i32.const 64) "hello from stderr\n")
              (func $_start
                (i32.store (i32.const 0) (i32.const 64))
                (i32.store (i32.const 4) (i32.const 18))
                (drop (call $fd_write (i32.const 2) (i32.const 0) (i32.const 1) (i32.const 16))))
              (export "_start" (func $_start)))
        "#,
        )
        .unwrap()
    }

    fn generate_exit_code_wasm() -> Vec<u8> {
        wat::parse_str(
            r#"
            (module
              (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
              (memory 1)
              (export "memory" (memory 0))
              (func $_start (call $proc_exit (i32.const 3)))
              (export "_start" (func $_start)))
        "#,
        )
        .unwrap()
    }

    fn generate_spin_wasm() -> Vec<u8> {
        wat::parse_str(
            r#"
            (module
              (func $_start (loop $forever (br $forever)))
              (export "_start" (func $_start)))
        "#,
        )
        .unwrap()
    }

    static MINIMAL_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static SIMPLE_FUNCTION_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static ECHO_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static STDERR_HELLO_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static EXIT_CODE_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static SPIN_WASM: OnceLock<Vec<u8>> = OnceLock::new();

    /// A minimal valid WASM module that does nothing
    pub fn minimal_wasm() -> &'static [u8] {
        MINIMAL_WASM.get_or_init(generate_minimal_wasm)
    }

    /// A WASM module with a simple function export
    pub fn simple_function_wasm() -> &'static [u8] {
        SIMPLE_FUNCTION_WASM.get_or_init(generate_simple_function_wasm)
    }

    /// A WASI guest that copies stdin to stdout until EOF
    pub fn echo_wasm() -> &'static [u8] {
        ECHO_WASM.get_or_init(generate_echo_wasm)
    }

    /// A WASI guest that writes one line to stderr and returns
    pub fn stderr_hello_wasm() -> &'static [u8] {
        STDERR_HELLO_WASM.get_or_init(generate_stderr_hello_wasm)
    }

    /// A WASI guest that calls `proc_exit(3)`
    pub fn exit_code_wasm() -> &'static [u8] {
        EXIT_CODE_WASM.get_or_init(generate_exit_code_wasm)
    }

    /// A guest whose entry point never returns
    pub fn spin_wasm() -> &'static [u8] {
        SPIN_WASM.get_or_init(generate_spin_wasm)
    }

    /// Invalid WASM with wrong magic number
    pub const INVALID_MAGIC_WASM: &[u8] = &[
        0xFF, 0xFF, 0xFF, 0xFF, // wrong magic
        0x01, 0x00, 0x00, 0x00, // version
    ];
}
