// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Isolated script execution sandboxes.
//!
//! Each sandbox is one OS thread owning a private `boa_engine` context. The
//! thread evaluates the guest shim, mounts shared resources, runs the
//! client script, and then serves commands from its channel until shut
//! down. Nothing JavaScript-typed ever leaves the thread; the host talks
//! to a sandbox through [`SandboxCommand`] values and hears back through
//! [`SandboxEvent`] values and the capability seams in [`capabilities`].
//!
//! Shared memory crosses threads as [`SharedArrayBuffer`] handles, which
//! are backed by one atomic allocation per buffer. Two sandboxes mounting
//! the same handle observe each other's writes, and guest `Atomics` calls
//! order them.

pub mod capabilities;
mod offworker;
mod runtime;
pub mod shim;

use boa_engine::builtins::array_buffer::SharedArrayBuffer;
use boa_engine::object::builtins::JsSharedArrayBuffer;
use boa_engine::Context;
use serde_json::Value;

use crate::wasm::WasmMemoryDescriptor;

pub use offworker::{OffWorker, OffWorkerOptions};

/// Key marking a live resource reference inside a payload.
///
/// Payloads travel between threads as JSON; a live resource is carried
/// out-of-band and this marker names where to splice it back in.
pub const RESOURCE_MARKER: &str = "$resource";

/// A resource that can be mounted into a sandbox context.
#[derive(Clone)]
pub enum LiveResource {
    /// A shared byte buffer. Mounts as a `SharedArrayBuffer`.
    Buffer(SharedArrayBuffer),
    /// A WASM linear memory: a descriptor plus its shared backing. Mounts
    /// as `{buffer, initial, maximum, shared}`.
    Memory {
        descriptor: WasmMemoryDescriptor,
        buffer: SharedArrayBuffer,
    },
    /// A compiled WASM module. Mounts as an opaque `{id, exports}` handle.
    Module { exports: Vec<String> },
}

/// Work sent into a sandbox thread.
///
/// The channel doubles as the delivery queue: commands sent while the
/// initial script is still executing are served once it finishes.
pub enum SandboxCommand {
    /// Dispatch a message event to the sandbox's own handlers.
    Deliver {
        payload: Value,
        resources: Vec<(String, LiveResource)>,
    },
    /// Dispatch a message event to the handle a parent holds for one of
    /// its nested workers.
    NestedMessage {
        worker_id: String,
        payload: Value,
        resources: Vec<(String, LiveResource)>,
    },
    /// Fire an expired guest timer.
    RunTimer { timer_id: u64 },
    /// Tear the sandbox down.
    Shutdown,
}

/// Notifications a sandbox emits toward its session.
#[derive(Debug)]
pub enum SandboxEvent {
    /// The guest called `postMessage` toward the client.
    PostMessage { worker_id: String, payload: Value },
    /// The guest called `close()`. The session keeps the sandbox
    /// addressable through a grace period before sending `Shutdown`.
    Closed { worker_id: String },
}

/// Routing for a nested sandbox's outbound messages: they go to the
/// parent's command channel instead of the session bus.
#[derive(Clone)]
pub struct ParentLink {
    /// The nested worker's own ID, used by the parent to find the handle.
    pub child_id: String,
    pub parent_tx: std::sync::mpsc::Sender<SandboxCommand>,
}

/// Allocates a shared byte buffer of `len` bytes, zero-filled.
///
/// Allocation needs an engine context, so a throwaway one is created here;
/// the buffer outlives it. Call from a blocking-friendly thread.
pub fn alloc_shared(len: usize) -> Result<SharedArrayBuffer, String> {
    let mut context = Context::default();
    let buffer =
        JsSharedArrayBuffer::new(len, &mut context).map_err(|e| e.to_string())?;
    Ok(buffer.inner().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::{js_string, JsValue, Source};

    fn eval_with_buffer(buffer: &SharedArrayBuffer, script: &str) -> JsValue {
        let mut context = Context::default();
        let handle = JsSharedArrayBuffer::from_buffer(buffer.clone(), &mut context);
        context
            .global_object()
            .set(js_string!("sab"), handle, false, &mut context)
            .unwrap();
        context.eval(Source::from_bytes(script)).unwrap()
    }

    #[test]
    fn test_alloc_shared_is_zeroed_and_sized() {
        let buffer = alloc_shared(64).unwrap();
        let length = eval_with_buffer(&buffer, "new Uint8Array(sab).length");
        assert_eq!(length, JsValue::from(64));

        let sum = eval_with_buffer(
            &buffer,
            "var v = new Uint8Array(sab); var s = 0; \
             for (var i = 0; i < v.length; i++) s += v[i]; s",
        );
        assert_eq!(sum, JsValue::from(0));
    }

    #[test]
    fn test_shared_buffer_handles_alias_one_allocation() {
        let buffer = alloc_shared(8).unwrap();

        // Written through one context, visible through another.
        eval_with_buffer(&buffer, "new Uint8Array(sab)[3] = 42");
        let seen = eval_with_buffer(&buffer.clone(), "new Uint8Array(sab)[3]");
        assert_eq!(seen, JsValue::from(42));
    }
}
