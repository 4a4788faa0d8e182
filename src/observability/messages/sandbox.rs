// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for sandbox lifecycle and bridge events.

use std::fmt::{Display, Formatter};

/// A sandbox finished initial script execution and reached Ready.
///
/// # Log Level
/// `debug!` - Diagnostic detail
pub struct SandboxReady<'a> {
    pub worker_id: &'a str,
}

impl Display for SandboxReady<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Sandbox {} is ready", self.worker_id)
    }
}

/// Guest script compilation or initial execution raised.
///
/// Construction failures are logged only; the client has no channel for
/// receiving them today.
///
/// # Log Level
/// `error!` - Failure requiring attention
pub struct ScriptExecutionFailed<'a> {
    pub worker_id: &'a str,
    pub error: &'a str,
}

impl Display for ScriptExecutionFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Script execution failed in sandbox {}: {}",
            self.worker_id, self.error
        )
    }
}

/// A guest callback threw; the error was caught at the bridge boundary.
///
/// # Log Level
/// `error!` - Failure requiring attention
pub struct CallbackFailed<'a> {
    pub worker_id: &'a str,
    pub callback: &'a str,
    pub error: &'a str,
}

impl Display for CallbackFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Error in {} for sandbox {}: {}",
            self.callback, self.worker_id, self.error
        )
    }
}

/// A message could not be delivered within the retry ceiling and was dropped.
///
/// # Log Level
/// `error!` - Failure requiring attention
pub struct DeliveryFailed<'a> {
    pub worker_id: &'a str,
    pub attempts: u32,
}

impl Display for DeliveryFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Dropped message for worker {} after {} delivery attempts",
            self.worker_id, self.attempts
        )
    }
}

/// Output from a guest `log`/`console.log` call.
///
/// One-way, host-side only; no guest-observable effect.
pub struct GuestLog<'a> {
    pub worker_id: &'a str,
    pub line: &'a str,
}

impl Display for GuestLog<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "[sandbox {}] {}", self.worker_id, self.line)
    }
}
