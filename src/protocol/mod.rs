// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Wire protocol envelope and state catalogue.
//!
//! Every message on the persistent connection is a JSON envelope
//! `{state, data, code}`. `state` selects the operation, `data` carries a
//! JSON-compatible payload, and `code` is reserved and round-tripped
//! untouched. Dispatch over the catalogue lives in
//! [`crate::session::dispatch`].
//!
//! Two payload conventions are shared with the client-side manager and must
//! stay bidirectional:
//! * a 36-character UUID-shaped string may name a server-side resource and
//!   is substituted with the live reference on receipt;
//! * `{"$bytes": "<base64>"}` marks a transferable byte region and becomes
//!   an `ArrayBuffer` inside the sandbox.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;

/// Key used to mark a transferable byte region inside a JSON payload.
pub const BYTES_MARKER: &str = "$bytes";

/// Length of a version-4 UUID string; strings of this length are candidate
/// resource IDs during substitution.
pub const RESOURCE_ID_LEN: usize = 36;

/// The protocol state catalogue.
///
/// Mirrors the client catalogue one-to-one; the snake_case strings are the
/// wire representation. `DownloadScript` and `CreateLockThread` are
/// reserved and currently ignored by dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    AcquireLockWithSync,
    BufferReady,
    ConnectionReady,
    CreateBuffer,
    CreateWasmModule,
    CreateLockThread,
    CreateWasmMemory,
    CreateWorker,
    DownloadScript,
    GetLockWithSync,
    Message,
    WasmModuleReady,
    WasmMemoryReady,
    WorkerReady,
    PostMessage,
}

/// The wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub state: ConnectionState,
    #[serde(default)]
    pub data: Value,
    /// Reserved; unused today.
    #[serde(default)]
    pub code: Value,
}

/// Encodes an envelope for the wire.
pub fn encode(state: ConnectionState, data: Value, code: Value) -> Result<String, ProtocolError> {
    let envelope = Envelope { state, data, code };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decodes a wire message into an envelope.
///
/// Unknown states and malformed JSON both surface as
/// [`ProtocolError::Malformed`]; dispatch logs and drops such messages.
pub fn decode(raw: &str) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_str(raw)?)
}

/// Wraps raw bytes in a `$bytes` payload marker.
pub fn bytes_marker(bytes: &[u8]) -> Value {
    serde_json::json!({ BYTES_MARKER: BASE64.encode(bytes) })
}

/// Extracts the byte region from a `$bytes` marker, if `value` is one.
pub fn marker_bytes(value: &Value) -> Option<Result<Vec<u8>, ProtocolError>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let encoded = obj.get(BYTES_MARKER)?.as_str()?;
    Some(BASE64.decode(encoded).map_err(ProtocolError::from))
}

/// Returns true when `s` has the shape of a resource ID candidate.
pub fn looks_like_resource_id(s: &str) -> bool {
    s.len() == RESOURCE_ID_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let data = serde_json::json!({ "id": "abc", "size": 64 });
        let raw = encode(ConnectionState::CreateBuffer, data.clone(), Value::Null).unwrap();
        let envelope = decode(&raw).unwrap();

        assert_eq!(envelope.state, ConnectionState::CreateBuffer);
        assert_eq!(envelope.data, data);
        assert!(envelope.code.is_null());
    }

    #[test]
    fn test_states_use_snake_case_on_the_wire() {
        let raw = encode(
            ConnectionState::CreateWasmModule,
            Value::Null,
            Value::Null,
        )
        .unwrap();
        assert!(raw.contains("\"create_wasm_module\""));

        let envelope = decode(r#"{"state":"post_message","data":{},"code":null}"#).unwrap();
        assert_eq!(envelope.state, ConnectionState::PostMessage);
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let result = decode(r#"{"state":"launch_missiles","data":null,"code":null}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_data_and_code_default_to_null() {
        let envelope = decode(r#"{"state":"message"}"#).unwrap();
        assert!(envelope.data.is_null());
        assert!(envelope.code.is_null());
    }

    #[test]
    fn test_bytes_marker_round_trip() {
        let bytes = vec![0u8, 1, 2, 254, 255];
        let marker = bytes_marker(&bytes);
        let decoded = marker_bytes(&marker).unwrap().unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn test_marker_bytes_ignores_plain_objects() {
        let value = serde_json::json!({ "$bytes": "AAE=", "extra": 1 });
        assert!(marker_bytes(&value).is_none());

        let value = serde_json::json!({ "data": "AAE=" });
        assert!(marker_bytes(&value).is_none());
    }
}
