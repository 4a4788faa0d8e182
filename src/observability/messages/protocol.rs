// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for wire protocol dispatch events.

use std::fmt::{Display, Formatter};

/// An inbound envelope could not be decoded and was dropped.
///
/// # Log Level
/// `warn!` - Recoverable protocol problem
pub struct EnvelopeRejected<'a> {
    pub error: &'a dyn std::error::Error,
}

impl Display for EnvelopeRejected<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Rejected inbound envelope: {}", self.error)
    }
}

/// A readiness reply was sent to the client.
///
/// # Log Level
/// `debug!` - Diagnostic detail
pub struct ReadySent<'a> {
    pub what: &'a str,
    pub id: &'a str,
}

impl Display for ReadySent<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Sent {} ready message with ID {}", self.what, self.id)
    }
}

/// A PostMessage target was missing or not ready; delivery is being retried.
///
/// # Log Level
/// `warn!` - Expected during out-of-order readiness, noisy if persistent
pub struct DeliveryRetrying<'a> {
    pub worker_id: &'a str,
    pub attempt: u32,
    pub total: u32,
}

impl Display for DeliveryRetrying<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Worker {} not ready, retrying delivery {}/{}",
            self.worker_id, self.attempt, self.total
        )
    }
}
