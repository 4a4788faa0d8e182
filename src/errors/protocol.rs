// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Errors raised while encoding or decoding wire envelopes.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The envelope was not valid JSON or did not match the schema.
    #[error("Malformed message envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A `$bytes` marker carried invalid base64 data.
    #[error("Invalid byte region encoding: {0}")]
    InvalidBytes(#[from] base64::DecodeError),

    /// A required field was missing from the message data.
    #[error("Missing field '{0}' in message data")]
    MissingField(&'static str),
}
