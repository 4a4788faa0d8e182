// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Error types for sandbox construction and the host/sandbox bridge.

use thiserror::Error;

/// Errors raised while constructing or driving an execution sandbox.
///
/// Guest-script exceptions thrown *inside* a callback are caught at the
/// host/sandbox boundary and logged; they never surface through this type.
/// These variants cover the host side of the bridge only.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The sandbox thread could not be spawned or wired up.
    #[error("Failed to start sandbox {id}: {reason}")]
    StartupFailed { id: String, reason: String },

    /// Guest script compilation or initial execution raised.
    ///
    /// Surfaced by readiness waits, never propagated to the client; the
    /// sandbox stays absent and later lookups report not-found.
    #[error("Script execution failed in sandbox {id}: {reason}")]
    ScriptFailed { id: String, reason: String },

    /// The sandbox command channel is gone (already shut down).
    #[error("Sandbox {0} is no longer running")]
    Gone(String),

    /// The onmessage-ready gate never opened within the bounded wait.
    #[error("Sandbox {0} never registered a message handler")]
    HandlerTimeout(String),
}
