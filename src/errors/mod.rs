// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod protocol;
mod sandbox;
mod session;

pub use protocol::ProtocolError;
pub use sandbox::SandboxError;
pub use session::{SessionError, SessionResult};
