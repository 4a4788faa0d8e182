// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! WebAssembly module compilation and memory descriptors.
//!
//! Modules downloaded on behalf of a session are validated and compiled
//! once, host-side, and handed to sandboxes as opaque handles carrying the
//! module ID and export names. Memories are descriptors over a shared byte
//! buffer sized in 64 KiB pages; the buffer itself is allocated by the
//! session so every sandbox mounts the same backing.

pub mod error;

use std::sync::OnceLock;

use wasmtime::{Config, Engine, Module};

pub use error::{WasmError, WasmResult};

/// WebAssembly page size in bytes.
pub const WASM_PAGE_SIZE: usize = 65536;

/// Maximum allowed size for WASM binaries (16 MB)
const MAX_WASM_SIZE: usize = 16 * 1024 * 1024;

/// A compiled module plus the export names sandboxes see on its handle.
#[derive(Clone)]
pub struct CompiledModule {
    pub module: Module,
    pub exports: Vec<String>,
}

/// Size and sharing parameters for a WASM linear memory, as requested by
/// the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WasmMemoryDescriptor {
    /// Initial size in pages.
    pub initial: u32,
    /// Optional growth ceiling in pages.
    pub maximum: Option<u32>,
    /// Whether the memory is visible to every sandbox in the session.
    pub shared: bool,
}

impl WasmMemoryDescriptor {
    /// Byte length of the initial allocation.
    pub fn byte_length(&self) -> usize {
        self.initial as usize * WASM_PAGE_SIZE
    }

    /// Applies the sharing rule: a shared memory must declare a maximum.
    ///
    /// Returns the descriptor to actually allocate and whether a requested
    /// shared memory was downgraded to unshared. Callers log the downgrade;
    /// the allocation still succeeds.
    pub fn normalized(self) -> (Self, bool) {
        if self.shared && self.maximum.is_none() {
            (Self { shared: false, ..self }, true)
        } else {
            (self, false)
        }
    }

    /// Checks internal consistency of the requested sizes.
    pub fn validate(&self) -> WasmResult<()> {
        if let Some(maximum) = self.maximum {
            if maximum < self.initial {
                return Err(WasmError::InvalidDescriptor(format!(
                    "maximum ({} pages) is below initial ({} pages)",
                    maximum, self.initial
                )));
            }
        }
        Ok(())
    }
}

/// Returns the process-wide compilation engine.
///
/// Compiled modules are only usable with the engine that produced them, so
/// every compilation in the process shares this one.
pub fn engine() -> &'static Engine {
    static ENGINE: OnceLock<Engine> = OnceLock::new();
    ENGINE.get_or_init(|| {
        let mut config = Config::new();
        // Clients compile modules that expect shared memories.
        config.wasm_threads(true);
        Engine::new(&config).unwrap_or_default()
    })
}

/// Validates and compiles a downloaded WASM binary.
///
/// Validation runs before compilation so malformed input fails with a
/// parse diagnostic instead of an engine-internal one.
pub fn compile_module(bytes: &[u8]) -> WasmResult<CompiledModule> {
    if bytes.len() > MAX_WASM_SIZE {
        return Err(WasmError::ValidationError(format!(
            "WASM file too large: {} bytes (max: {} bytes)",
            bytes.len(),
            MAX_WASM_SIZE
        )));
    }

    wasmparser::validate(bytes).map_err(|e| WasmError::ValidationError(e.to_string()))?;

    let module =
        Module::new(engine(), bytes).map_err(|e| WasmError::CompileError(e.to_string()))?;

    let exports = module
        .exports()
        .map(|export| export.name().to_owned())
        .collect();

    Ok(CompiledModule { module, exports })
}
