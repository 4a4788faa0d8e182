// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The host-side handle to a sandbox thread.

use std::sync::mpsc;
use std::time::Duration;

use boa_engine::builtins::array_buffer::SharedArrayBuffer;
use serde_json::Value;
use tokio::sync::{mpsc::UnboundedSender, watch};

use crate::errors::SandboxError;
use crate::sandbox::capabilities::SandboxCapabilities;
use crate::sandbox::runtime::{self, SandboxSpec};
use crate::sandbox::{LiveResource, ParentLink, SandboxCommand, SandboxEvent};

/// Spawn parameters beyond the script itself.
#[derive(Default)]
pub struct OffWorkerOptions {
    /// The URL the script came from; relative fetches resolve against it.
    pub url: Option<String>,
    /// Buffers mounted as globals, by name, before the script runs.
    pub shared_memory: Vec<(String, SharedArrayBuffer)>,
    /// Present for nested workers. Routes outbound messages to the parent
    /// and suppresses the source rewrite.
    pub parent: Option<ParentLink>,
}

/// A running sandbox, owned by the session that spawned it.
///
/// Dropping the handle does not stop the thread; send
/// [`SandboxCommand::Shutdown`] (or call [`OffWorker::terminate`]) for
/// that. Commands sent before the initial script finishes queue in the
/// channel and are served in order once it does.
pub struct OffWorker {
    id: String,
    tx: mpsc::Sender<SandboxCommand>,
    ready: watch::Receiver<bool>,
    handler_ready: watch::Receiver<bool>,
}

impl OffWorker {
    /// Spawns the sandbox thread and returns immediately.
    ///
    /// Script execution happens on the new thread; readiness is observable
    /// through [`OffWorker::wait_ready`]. A script that throws during
    /// construction is logged and reported on `events` as `Closed`.
    pub fn spawn(
        id: &str,
        script: &str,
        options: OffWorkerOptions,
        capabilities: SandboxCapabilities,
        events: UnboundedSender<SandboxEvent>,
    ) -> Result<Self, SandboxError> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (handler_tx, handler_rx) = watch::channel(false);

        let spec = SandboxSpec {
            id: id.to_owned(),
            script: script.to_owned(),
            options,
            capabilities,
            events,
            self_tx: tx.clone(),
            commands: rx,
            ready: ready_tx,
            handler_ready: handler_tx,
        };

        std::thread::Builder::new()
            .name(format!("sandbox-{id}"))
            .spawn(move || runtime::run(spec))
            .map_err(|e| SandboxError::StartupFailed {
                id: id.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            id: id.to_owned(),
            tx,
            ready: ready_rx,
            handler_ready: handler_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A sender for the sandbox's command channel, used as the parent end
    /// of a [`ParentLink`].
    pub fn command_sender(&self) -> mpsc::Sender<SandboxCommand> {
        self.tx.clone()
    }

    /// Queues a message event for the sandbox's own handlers.
    pub fn deliver(
        &self,
        payload: Value,
        resources: Vec<(String, LiveResource)>,
    ) -> Result<(), SandboxError> {
        self.tx
            .send(SandboxCommand::Deliver { payload, resources })
            .map_err(|_| SandboxError::Gone(self.id.clone()))
    }

    /// Stops the sandbox thread after it drains already-queued commands.
    pub fn terminate(&self) {
        let _ = self.tx.send(SandboxCommand::Shutdown);
    }

    /// Waits until the initial script has finished executing.
    ///
    /// A sandbox whose thread exited without reaching Ready failed during
    /// construction; that surfaces as [`SandboxError::ScriptFailed`].
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), SandboxError> {
        match Self::wait_flag(self.ready.clone(), timeout).await {
            Some(true) => Ok(()),
            Some(false) => Err(SandboxError::ScriptFailed {
                id: self.id.clone(),
                reason: "sandbox exited before completing startup".to_owned(),
            }),
            None => Err(SandboxError::StartupFailed {
                id: self.id.clone(),
                reason: "sandbox did not become ready in time".to_owned(),
            }),
        }
    }

    /// Waits until the guest has registered at least one message handler.
    pub async fn wait_handler_registered(
        &self,
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        match Self::wait_flag(self.handler_ready.clone(), timeout).await {
            Some(true) => Ok(()),
            Some(false) => Err(SandboxError::Gone(self.id.clone())),
            None => Err(SandboxError::HandlerTimeout(self.id.clone())),
        }
    }

    /// `Some(flag)` when the watch resolved, `None` on timeout. A closed
    /// watch channel with the flag still false resolves to `Some(false)`.
    async fn wait_flag(mut rx: watch::Receiver<bool>, timeout: Duration) -> Option<bool> {
        tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow_and_update() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        })
        .await
        .ok()
    }
}
