// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! A server that runs browser-style Workers on behalf of remote clients.
//!
//! Clients hold lightweight proxies and speak a JSON envelope protocol
//! over a persistent WebSocket; the server runs each worker's script in
//! its own sandboxed JavaScript engine, multiplexing all of one client's
//! workers, shared buffers, WASM modules, and memories through a single
//! [`session::Session`].

pub mod errors;      // error handling
pub mod fetch;       // script and binary downloads
pub mod observability;
pub mod preprocessor; // onmessage-assignment rewriting
pub mod protocol;    // wire envelope and state catalogue
pub mod sandbox;     // per-worker script engines
pub mod server;      // WebSocket transport
pub mod session;     // per-connection resource maps and dispatch
pub mod wasm;        // module compilation and memory descriptors
