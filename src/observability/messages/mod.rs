// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Structured message types organized by subsystem.

pub mod protocol;
pub mod sandbox;
pub mod session;
