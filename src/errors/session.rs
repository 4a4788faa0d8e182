// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Error types for session-level resource management.

use thiserror::Error;

/// Errors raised by [`crate::session::Session`] operations.
///
/// The `NotFound` variant is the canonical "not-found condition": every
/// lookup of an unknown buffer/module/memory/worker ID raises it with the
/// offending ID in the message, and callers are expected to catch and may
/// retry.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A resource lookup failed because the ID has no live entry.
    #[error("No such {kind} {id}")]
    NotFound {
        /// The resource kind ("buffer", "wasm module", "wasm memory", "worker").
        kind: &'static str,
        /// The ID that was looked up.
        id: String,
    },

    /// The session is shutting down and no longer accepts work.
    #[error("Session {0} is closed")]
    Closed(String),

    /// A message could not be delivered to a sandbox within the retry ceiling.
    #[error("Delivery to worker {id} timed out after {attempts} attempts")]
    DeliveryTimeout { id: String, attempts: u32 },

    /// Shared memory allocation failed.
    #[error("Failed to allocate shared buffer {id}: {reason}")]
    AllocationFailed { id: String, reason: String },

    /// A sandbox operation failed beneath a session operation.
    #[error(transparent)]
    Sandbox(#[from] super::SandboxError),
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
