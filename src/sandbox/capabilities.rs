// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The host capabilities a sandbox is constructed with.
//!
//! Every effect a guest script can cause outside its own context goes
//! through one of these seams, so tests can substitute any of them and a
//! sandbox holds no direct reference to its session. The session is
//! reachable only through a `Weak` spawner handle; a sandbox that outlives
//! its session simply loses the ability to create nested workers.

use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::errors::SessionResult;
use crate::fetch::Fetcher;
use crate::observability::messages::sandbox::GuestLog;
use crate::sandbox::{ParentLink, SandboxCommand};

/// One-shot delayed execution for guest `setTimeout`.
pub trait Timer: Send + Sync {
    fn schedule(&self, delay: Duration, fire: Box<dyn FnOnce() + Send>);
}

/// Production timer: one short-lived thread per scheduled callback.
///
/// Guest timers are rare and coarse; a timer wheel would be wasted here.
pub struct ThreadTimer;

impl Timer for ThreadTimer {
    fn schedule(&self, delay: Duration, fire: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            fire();
        });
    }
}

/// Destination for guest `log`/`console.log` output.
pub trait LogSink: Send + Sync {
    fn log(&self, worker_id: &str, line: &str);
}

/// Production sink: guest output goes to the host log at info level.
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, worker_id: &str, line: &str) {
        tracing::info!("{}", GuestLog { worker_id, line });
    }
}

/// Creation and teardown of nested workers, implemented by the session.
///
/// A nested worker is a full sandbox registered with the session like any
/// other; the returned sender is the parent's private handle to it.
pub trait NestedSpawner: Send + Sync {
    fn create_nested(
        &self,
        worker_id: &str,
        script: &str,
        parent: ParentLink,
        url: Option<String>,
    ) -> SessionResult<mpsc::Sender<SandboxCommand>>;

    /// Tears a nested worker down immediately, without a grace period.
    fn terminate_nested(&self, worker_id: &str);
}

/// The capability bundle handed to each sandbox at spawn.
pub struct SandboxCapabilities {
    pub fetcher: Arc<dyn Fetcher>,
    pub timer: Arc<dyn Timer>,
    pub log: Arc<dyn LogSink>,
    pub spawner: Weak<dyn NestedSpawner>,
}

impl Clone for SandboxCapabilities {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            timer: Arc::clone(&self.timer),
            log: Arc::clone(&self.log),
            spawner: Weak::clone(&self.spawner),
        }
    }
}
