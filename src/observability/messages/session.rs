// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for session lifecycle and resource events.
//!
//! This module contains message types for logging events related to:
//! * Connection/session open and close
//! * Shared buffer, WASM module, and WASM memory creation
//! * Worker registration and removal

use std::fmt::{Display, Formatter};

/// A client connection was accepted and a session created.
///
/// # Log Level
/// `info!` - Important operational event
pub struct SessionOpened<'a> {
    pub session_id: &'a str,
}

impl Display for SessionOpened<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Connection established: {}", self.session_id)
    }
}

/// The transport closed and the session is tearing down.
///
/// # Log Level
/// `info!` - Important operational event
pub struct SessionClosed<'a> {
    pub session_id: &'a str,
    pub workers: usize,
}

impl Display for SessionClosed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Connection closed: {} ({} workers torn down)",
            self.session_id, self.workers
        )
    }
}

/// A shared buffer was allocated.
pub struct BufferCreated<'a> {
    pub buffer_id: &'a str,
    pub size: usize,
}

impl Display for BufferCreated<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Created buffer {} ({} bytes)", self.buffer_id, self.size)
    }
}

/// WASM module compilation failed.
///
/// The module ID is left unset; later lookups surface as not-found.
///
/// # Log Level
/// `error!` - Failure requiring attention
pub struct WasmModuleCompileFailed<'a> {
    pub module_id: &'a str,
    pub url: &'a str,
    pub error: &'a dyn std::error::Error,
}

impl Display for WasmModuleCompileFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Cannot compile wasm file {} from {}: {}",
            self.module_id, self.url, self.error
        )
    }
}

/// A shared WASM memory was requested but the backing cannot be shared.
///
/// # Log Level
/// `warn!` - Configuration problem, the call still succeeds
pub struct WasmMemoryNotShared<'a> {
    pub memory_id: &'a str,
}

impl Display for WasmMemoryNotShared<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Requested a shared WebAssembly memory {} but the backing cannot be shared; \
             falling back to an unshared allocation",
            self.memory_id
        )
    }
}

/// A worker was removed from the session map after closing.
pub struct WorkerRemoved<'a> {
    pub worker_id: &'a str,
}

impl Display for WorkerRemoved<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Worker {} has been deleted", self.worker_id)
    }
}
