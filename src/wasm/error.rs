// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Errors raised while compiling or describing WebAssembly resources.
#[derive(Error, Debug)]
pub enum WasmError {
    /// The binary failed structural validation before compilation.
    #[error("WASM validation error: {0}")]
    ValidationError(String),

    /// The validated binary failed to compile.
    ///
    /// Carries the rendered engine error; `wasmtime`'s error type does not
    /// implement `std::error::Error` and cannot be held by source.
    #[error("WASM compilation error: {0}")]
    CompileError(String),

    /// A memory descriptor was internally inconsistent.
    #[error("Invalid WASM memory descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Result type alias for WASM operations.
pub type WasmResult<T> = Result<T, WasmError>;
