// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Observability module for structured logging and tracing.
//!
//! Centralized message types for diagnostic and operational logging.
//! Message types follow a struct-based pattern with a `Display`
//! implementation so log call sites stay free of magic strings:
//!
//! ```rust
//! use offworker::observability::messages::session::SessionOpened;
//!
//! let msg = SessionOpened { session_id: "abc" };
//! tracing::info!("{}", msg);
//! ```
//!
//! Messages are organized by subsystem:
//! * `messages::session` - session lifecycle and resource events
//! * `messages::sandbox` - sandbox lifecycle and bridge events
//! * `messages::protocol` - wire dispatch events

pub mod messages;
