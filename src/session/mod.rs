// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Per-connection session state.
//!
//! A session owns every resource a client creates over one socket: workers
//! (top-level and nested alike), shared buffers, WASM modules and
//! memories, and buffer locks. All maps die with the connection; nothing
//! is shared across sessions except the compilation engine.
//!
//! Sandboxes reach back into their session only through the
//! [`NestedSpawner`] seam, held weakly, so a sandbox thread that outlives
//! its connection cannot resurrect the session.

pub mod dispatch;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use boa_engine::builtins::array_buffer::SharedArrayBuffer;
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{SessionError, SessionResult};
use crate::fetch::{CachingFetcher, Fetcher};
use crate::observability::messages::session::{
    BufferCreated, SessionClosed, SessionOpened, WasmMemoryNotShared, WorkerRemoved,
};
use crate::protocol::{self, looks_like_resource_id, ConnectionState};
use crate::sandbox::capabilities::{
    LogSink, NestedSpawner, SandboxCapabilities, ThreadTimer, Timer, TracingLogSink,
};
use crate::sandbox::{
    alloc_shared, LiveResource, OffWorker, OffWorkerOptions, ParentLink, SandboxCommand,
    SandboxEvent, RESOURCE_MARKER,
};
use crate::wasm::{CompiledModule, WasmMemoryDescriptor};

/// How long a closed worker's sandbox keeps draining queued commands
/// before its thread is stopped.
pub const DISPOSE_GRACE: Duration = Duration::from_secs(3);

/// A handle to one client's session.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a session with production capabilities.
    pub fn new(outbound: UnboundedSender<String>) -> Self {
        Self::with_capabilities(
            outbound,
            Arc::new(CachingFetcher::new()),
            Arc::new(ThreadTimer),
            Arc::new(TracingLogSink),
        )
    }

    /// Creates a session with explicit capability implementations.
    pub fn with_capabilities(
        outbound: UnboundedSender<String>,
        fetcher: Arc<dyn Fetcher>,
        timer: Arc<dyn Timer>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded_channel();

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| SessionInner {
            id: uuid::Uuid::new_v4().to_string(),
            outbound,
            fetcher,
            timer,
            log,
            weak: weak.clone(),
            events_tx,
            workers: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            memories: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            worker_added: Notify::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        info!("{}", SessionOpened { session_id: &inner.id });

        tokio::spawn(run_events(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            events_rx,
        ));

        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Handles one raw message off the socket.
    pub async fn handle_message(&self, raw: &str) {
        dispatch::handle_message(&self.inner, raw).await;
    }

    /// Tears every worker down. Called when the transport closes.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Pumps sandbox events into the session for as long as it is alive.
///
/// Holds the session weakly; the strong references are the `Session`
/// handle and the per-worker grace tasks.
async fn run_events(
    session: Weak<SessionInner>,
    shutdown: CancellationToken,
    mut events: UnboundedReceiver<SandboxEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = session.upgrade() else {
            break;
        };
        match event {
            SandboxEvent::PostMessage { worker_id, payload } => {
                inner.forward_post_message(&worker_id, payload);
            }
            SandboxEvent::Closed { worker_id } => {
                inner.begin_worker_teardown(&worker_id);
            }
        }
    }
}

pub struct SessionInner {
    id: String,
    outbound: UnboundedSender<String>,
    fetcher: Arc<dyn Fetcher>,
    timer: Arc<dyn Timer>,
    log: Arc<dyn LogSink>,
    weak: Weak<SessionInner>,
    events_tx: UnboundedSender<SandboxEvent>,
    workers: Mutex<HashMap<String, OffWorker>>,
    buffers: Mutex<HashMap<String, SharedArrayBuffer>>,
    memories: Mutex<HashMap<String, (WasmMemoryDescriptor, SharedArrayBuffer)>>,
    modules: Mutex<HashMap<String, CompiledModule>>,
    /// Buffer locks currently held by the client, by buffer ID.
    locks: Mutex<HashMap<String, bool>>,
    /// Signalled whenever a worker lands in the map, to wake pending
    /// deliveries for not-yet-constructed workers.
    worker_added: Notify,
    closed: AtomicBool,
    /// Cancelled on close; stops the event pump.
    shutdown: CancellationToken,
}

impl SessionInner {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> SandboxCapabilities {
        SandboxCapabilities {
            fetcher: Arc::clone(&self.fetcher),
            timer: Arc::clone(&self.timer),
            log: Arc::clone(&self.log),
            spawner: self.weak.clone(),
        }
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SessionError::Closed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Spawns a top-level worker and registers it.
    pub fn create_worker(
        &self,
        id: &str,
        script: &str,
        url: Option<String>,
    ) -> SessionResult<()> {
        self.ensure_open()?;
        debug!("Create worker in url: {:?} with ID {}", url, id);

        let worker = OffWorker::spawn(
            id,
            script,
            OffWorkerOptions {
                url,
                ..Default::default()
            },
            self.capabilities(),
            self.events_tx.clone(),
        )?;

        self.workers.lock().unwrap().insert(id.to_owned(), worker);
        self.worker_added.notify_waiters();
        Ok(())
    }

    /// Allocates a shared buffer of `size` bytes. Blocking; dispatch runs
    /// it on a blocking thread.
    pub fn create_buffer(&self, id: &str, size: usize) -> SessionResult<()> {
        self.ensure_open()?;
        let buffer = alloc_shared(size).map_err(|reason| SessionError::AllocationFailed {
            id: id.to_owned(),
            reason,
        })?;
        debug!("{}", BufferCreated { buffer_id: id, size });
        self.buffers.lock().unwrap().insert(id.to_owned(), buffer);
        Ok(())
    }

    /// Registers an already-compiled module under `id`.
    pub fn insert_module(&self, id: &str, module: CompiledModule) {
        self.modules.lock().unwrap().insert(id.to_owned(), module);
    }

    /// Allocates a WASM linear memory. A shared request without a maximum
    /// is downgraded with a warning, matching the engine rule that shared
    /// memories must be bounded.
    pub fn create_wasm_memory(
        &self,
        id: &str,
        descriptor: WasmMemoryDescriptor,
    ) -> SessionResult<()> {
        self.ensure_open()?;

        let (normalized, downgraded) = descriptor.normalized();
        if downgraded {
            warn!("{}", WasmMemoryNotShared { memory_id: id });
        }

        let buffer = alloc_shared(normalized.byte_length()).map_err(|reason| {
            SessionError::AllocationFailed {
                id: id.to_owned(),
                reason,
            }
        })?;
        self.memories
            .lock()
            .unwrap()
            .insert(id.to_owned(), (normalized, buffer));
        Ok(())
    }

    /// Looks up a shared buffer by ID.
    pub fn buffer(&self, id: &str) -> SessionResult<SharedArrayBuffer> {
        self.buffers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                kind: "buffer",
                id: id.to_owned(),
            })
    }

    /// Looks up a compiled WASM module by ID.
    ///
    /// A module whose compilation failed was never inserted, so the
    /// not-found condition covers that case too.
    pub fn wasm_module(&self, id: &str) -> SessionResult<CompiledModule> {
        self.modules
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                kind: "wasm module",
                id: id.to_owned(),
            })
    }

    /// Looks up a WASM memory by ID.
    pub fn wasm_memory(
        &self,
        id: &str,
    ) -> SessionResult<(WasmMemoryDescriptor, SharedArrayBuffer)> {
        self.memories
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                kind: "wasm memory",
                id: id.to_owned(),
            })
    }

    /// Records that the client holds the lock for `buffer_id`.
    pub fn grant_lock(&self, buffer_id: &str) -> SessionResult<()> {
        self.buffer(buffer_id)?;
        self.locks
            .lock()
            .unwrap()
            .insert(buffer_id.to_owned(), true);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn has_worker(&self, id: &str) -> bool {
        self.workers.lock().unwrap().contains_key(id)
    }

    /// Replaces every resource-ID string in `payload` with a resource
    /// marker and returns the live resources to mount, mimicking what a
    /// browser does when a `SharedArrayBuffer` rides along a message.
    ///
    /// Only strings of resource-ID length are candidates, and only those
    /// present in one of the session maps are touched.
    pub fn substitute(&self, payload: &mut Value) -> Vec<(String, LiveResource)> {
        let mut resources = Vec::new();
        self.substitute_value(payload, &mut resources);
        resources
    }

    fn substitute_value(&self, value: &mut Value, out: &mut Vec<(String, LiveResource)>) {
        match value {
            Value::String(s) if looks_like_resource_id(s) => {
                let Some(resource) = self.lookup_resource(s) else {
                    return;
                };
                let id = s.clone();
                if !out.iter().any(|(existing, _)| *existing == id) {
                    out.push((id.clone(), resource));
                }
                *value = json!({ RESOURCE_MARKER: id });
            }
            Value::Object(map) => {
                for item in map.values_mut() {
                    self.substitute_value(item, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.substitute_value(item, out);
                }
            }
            _ => {}
        }
    }

    fn lookup_resource(&self, id: &str) -> Option<LiveResource> {
        if let Ok(buffer) = self.buffer(id) {
            return Some(LiveResource::Buffer(buffer));
        }
        if let Ok((descriptor, buffer)) = self.wasm_memory(id) {
            return Some(LiveResource::Memory { descriptor, buffer });
        }
        if let Ok(module) = self.wasm_module(id) {
            return Some(LiveResource::Module {
                exports: module.exports,
            });
        }
        None
    }

    /// Attempts one delivery. `NotFound` means the worker is not (yet) in
    /// the map; the retry loop in dispatch turns that into a bounded wait.
    pub fn try_deliver(
        &self,
        worker_id: &str,
        payload: Value,
        resources: Vec<(String, LiveResource)>,
    ) -> SessionResult<()> {
        let workers = self.workers.lock().unwrap();
        let worker = workers.get(worker_id).ok_or_else(|| SessionError::NotFound {
            kind: "worker",
            id: worker_id.to_owned(),
        })?;
        worker.deliver(payload, resources)?;
        Ok(())
    }

    /// Waits until a worker lands in the map or the timeout passes.
    pub async fn wait_for_worker(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.worker_added.notified()).await;
    }

    /// Sends an encoded envelope to the client.
    pub fn send(&self, state: ConnectionState, data: Value) {
        match protocol::encode(state, data, Value::Null) {
            Ok(encoded) => {
                if self.outbound.send(encoded).is_err() {
                    debug!("Outbound channel for session {} is closed", self.id);
                }
            }
            Err(e) => error!("Failed to encode outbound message: {}", e),
        }
    }

    /// Forwards a guest `postMessage` to the client.
    ///
    /// Resource markers collapse back to bare ID strings; the client keeps
    /// its own proxies and live references cannot cross the wire.
    fn forward_post_message(&self, worker_id: &str, mut payload: Value) {
        markers_to_ids(&mut payload);
        self.send(
            ConnectionState::PostMessage,
            json!({ "id": worker_id, "message": payload }),
        );
    }

    /// A worker closed itself: drop it from the map now so lookups fail,
    /// but keep the thread draining its queue for the grace period.
    fn begin_worker_teardown(&self, worker_id: &str) {
        let removed = self.workers.lock().unwrap().remove(worker_id);
        let Some(worker) = removed else {
            return;
        };
        debug!("{}", WorkerRemoved { worker_id });

        let timer = Arc::clone(&self.timer);
        timer.schedule(
            DISPOSE_GRACE,
            Box::new(move || {
                worker.terminate();
            }),
        );
    }

    /// Tears a worker down immediately, skipping the grace period.
    pub fn terminate_worker(&self, worker_id: &str) {
        if let Some(worker) = self.workers.lock().unwrap().remove(worker_id) {
            debug!("worker {} has been terminated", worker_id);
            worker.terminate();
        }
    }

    /// Tears the whole session down.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let workers: Vec<OffWorker> = {
            let mut map = self.workers.lock().unwrap();
            map.drain().map(|(_, worker)| worker).collect()
        };
        info!(
            "{}",
            SessionClosed {
                session_id: &self.id,
                workers: workers.len(),
            }
        );
        for worker in workers {
            worker.terminate();
        }
    }
}

impl NestedSpawner for SessionInner {
    fn create_nested(
        &self,
        worker_id: &str,
        script: &str,
        parent: ParentLink,
        url: Option<String>,
    ) -> SessionResult<std::sync::mpsc::Sender<SandboxCommand>> {
        self.ensure_open()?;
        debug!("Create nested worker {} in url: {:?}", worker_id, url);

        let worker = OffWorker::spawn(
            worker_id,
            script,
            OffWorkerOptions {
                url,
                parent: Some(parent),
                ..Default::default()
            },
            self.capabilities(),
            self.events_tx.clone(),
        )?;
        let tx = worker.command_sender();

        self.workers
            .lock()
            .unwrap()
            .insert(worker_id.to_owned(), worker);
        self.worker_added.notify_waiters();
        Ok(tx)
    }

    fn terminate_nested(&self, worker_id: &str) {
        self.terminate_worker(worker_id);
    }
}

/// Rewrites `{"$resource": id}` markers back to bare ID strings.
fn markers_to_ids(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let marker = if map.len() == 1 {
                match map.get(RESOURCE_MARKER) {
                    Some(Value::String(id)) => Some(id.clone()),
                    _ => None,
                }
            } else {
                None
            };
            if let Some(id) = marker {
                *value = Value::String(id);
                return;
            }
            for item in map.values_mut() {
                markers_to_ids(item);
            }
        }
        Value::Array(items) => {
            for item in items {
                markers_to_ids(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct MapFetcher {
        files: HashMap<String, String>,
    }

    impl MapFetcher {
        fn new(files: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                files: files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
        }
    }

    impl Fetcher for MapFetcher {
        fn fetch_bytes(&self, url: &str) -> Result<Arc<Vec<u8>>, FetchError> {
            match self.files.get(url) {
                Some(body) => Ok(Arc::new(body.clone().into_bytes())),
                None => Err(FetchError::Status {
                    url: url.to_owned(),
                    status: reqwest::StatusCode::NOT_FOUND,
                }),
            }
        }
    }

    fn test_session(files: &[(&str, &str)]) -> (Session, UnboundedReceiver<String>) {
        let (outbound, rx) = unbounded_channel();
        let session = Session::with_capabilities(
            outbound,
            MapFetcher::new(files),
            Arc::new(ThreadTimer),
            Arc::new(TracingLogSink),
        );
        (session, rx)
    }

    async fn next_envelope(rx: &mut UnboundedReceiver<String>) -> crate::protocol::Envelope {
        let raw = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for an outbound message")
            .expect("outbound channel closed");
        protocol::decode(&raw).unwrap()
    }

    async fn next_post_message(rx: &mut UnboundedReceiver<String>) -> (String, Value) {
        loop {
            let envelope = next_envelope(rx).await;
            if envelope.state == ConnectionState::PostMessage {
                let id = envelope.data["id"].as_str().unwrap().to_owned();
                return (id, envelope.data["message"].clone());
            }
        }
    }

    const BUFFER_ID: &str = "11111111-2222-3333-4444-555555555555";

    #[tokio::test]
    async fn test_substitute_replaces_known_ids_only() {
        let (session, _rx) = test_session(&[]);
        session.inner().create_buffer(BUFFER_ID, 16).unwrap();

        let mut payload = json!({
            "buf": BUFFER_ID,
            "other": "99999999-aaaa-bbbb-cccc-dddddddddddd",
            "nested": { "again": BUFFER_ID },
            "plain": "short string",
        });
        let resources = session.inner().substitute(&mut payload);

        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].0, BUFFER_ID);
        assert_eq!(payload["buf"], json!({ "$resource": BUFFER_ID }));
        assert_eq!(payload["nested"]["again"], json!({ "$resource": BUFFER_ID }));
        // Unknown IDs and short strings pass through untouched.
        assert_eq!(
            payload["other"],
            json!("99999999-aaaa-bbbb-cccc-dddddddddddd")
        );
        assert_eq!(payload["plain"], json!("short string"));
    }

    #[tokio::test]
    async fn test_try_deliver_unknown_worker_is_not_found() {
        let (session, _rx) = test_session(&[]);
        let result = session.inner().try_deliver("missing", json!("x"), vec![]);
        assert!(matches!(
            result,
            Err(SessionError::NotFound { kind: "worker", .. })
        ));
    }

    #[tokio::test]
    async fn test_resource_lookups_raise_not_found_naming_the_id() {
        let (session, _rx) = test_session(&[]);

        let missing = session.inner().buffer("nope").unwrap_err();
        assert!(matches!(
            missing,
            SessionError::NotFound { kind: "buffer", .. }
        ));
        assert!(missing.to_string().contains("nope"));

        assert!(matches!(
            session.inner().wasm_module("nope"),
            Err(SessionError::NotFound { kind: "wasm module", .. })
        ));
        assert!(matches!(
            session.inner().wasm_memory("nope"),
            Err(SessionError::NotFound { kind: "wasm memory", .. })
        ));

        // Once created, the same accessors resolve.
        session.inner().create_buffer(BUFFER_ID, 8).unwrap();
        session
            .inner()
            .create_wasm_memory(
                "99999999-aaaa-bbbb-cccc-dddddddddddd",
                WasmMemoryDescriptor {
                    initial: 1,
                    maximum: Some(2),
                    shared: true,
                },
            )
            .unwrap();
        assert!(session.inner().buffer(BUFFER_ID).is_ok());
        let (descriptor, _) = session
            .inner()
            .wasm_memory("99999999-aaaa-bbbb-cccc-dddddddddddd")
            .unwrap();
        assert_eq!(descriptor.initial, 1);
    }

    #[tokio::test]
    async fn test_grant_lock_requires_the_buffer() {
        let (session, _rx) = test_session(&[]);
        assert!(matches!(
            session.inner().grant_lock(BUFFER_ID),
            Err(SessionError::NotFound { kind: "buffer", .. })
        ));

        session.inner().create_buffer(BUFFER_ID, 8).unwrap();
        session.inner().grant_lock(BUFFER_ID).unwrap();
        assert_eq!(
            session.inner().locks.lock().unwrap().get(BUFFER_ID),
            Some(&true)
        );
    }

    #[tokio::test]
    async fn test_worker_post_message_reaches_the_wire() {
        let (session, mut rx) = test_session(&[]);
        session
            .inner()
            .create_worker("w1", r#"postMessage({ answer: 42 });"#, None)
            .unwrap();

        let (id, message) = next_post_message(&mut rx).await;
        assert_eq!(id, "w1");
        assert_eq!(message, json!({ "answer": 42 }));
        session.close();
    }

    #[tokio::test]
    async fn test_worker_close_removes_it_from_the_map() {
        let (session, _rx) = test_session(&[]);
        session.inner().create_worker("w1", "close();", None).unwrap();

        // The event pump runs asynchronously; poll for the removal.
        for _ in 0..200 {
            if !session.inner().has_worker("w1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!session.inner().has_worker("w1"));
        session.close();
    }

    #[tokio::test]
    async fn test_parent_close_does_not_close_the_nested_worker() {
        let (session, mut rx) = test_session(&[]);
        let script = r#"
            var w = new Worker("onmessage = function (e) { postMessage(e.data + 1); };", true);
            w.postMessage(1);
            w.onmessage = function (e) {
                postMessage("child says " + e.data);
                close();
            };
        "#;
        session.inner().create_worker("parent", script, None).unwrap();

        let (_, message) = next_post_message(&mut rx).await;
        assert_eq!(message, json!("child says 2"));

        for _ in 0..200 {
            if !session.inner().has_worker("parent") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!session.inner().has_worker("parent"));
        // The nested worker is still registered and running.
        assert_eq!(session.inner().worker_count(), 1);
        session.close();
    }

    #[tokio::test]
    async fn test_shared_buffer_atomics_across_two_workers() {
        let (session, mut rx) = test_session(&[]);
        session.inner().create_buffer(BUFFER_ID, 16).unwrap();

        let adder = r#"
            addEventListener("message", function (e) {
                var counts = new Int32Array(e.data.buf);
                for (var i = 0; i < 100; i++) {
                    Atomics.add(counts, 0, 1);
                }
                postMessage("added");
            });
        "#;
        let checker = r#"
            addEventListener("message", function (e) {
                var counts = new Int32Array(e.data.buf);
                postMessage(Atomics.load(counts, 0));
            });
        "#;
        session.inner().create_worker("adder", adder, None).unwrap();
        session.inner().create_worker("checker", checker, None).unwrap();

        let mut payload = json!({ "buf": BUFFER_ID });
        let resources = session.inner().substitute(&mut payload);
        session
            .inner()
            .try_deliver("adder", payload.clone(), resources.clone())
            .unwrap();

        let (id, message) = next_post_message(&mut rx).await;
        assert_eq!((id.as_str(), &message), ("adder", &json!("added")));

        session
            .inner()
            .try_deliver("checker", payload, resources)
            .unwrap();
        let (id, message) = next_post_message(&mut rx).await;
        assert_eq!((id.as_str(), &message), ("checker", &json!(100)));
        session.close();
    }

    #[tokio::test]
    async fn test_two_workers_sum_ranges_through_shared_memory() {
        let (session, mut rx) = test_session(&[]);
        session.inner().create_buffer(BUFFER_ID, 8).unwrap();

        let worker = |from: u32, to: u32| {
            format!(
                r#"
                addEventListener("message", function (e) {{
                    var cell = new Int32Array(e.data.buf);
                    for (var i = {from}; i <= {to}; i++) {{
                        Atomics.add(cell, 0, i);
                    }}
                    postMessage(Atomics.load(cell, 0));
                }});
                "#
            )
        };
        session
            .inner()
            .create_worker("low", &worker(1, 50), None)
            .unwrap();
        session
            .inner()
            .create_worker("high", &worker(51, 100), None)
            .unwrap();

        let mut payload = json!({ "buf": BUFFER_ID });
        let resources = session.inner().substitute(&mut payload);

        session
            .inner()
            .try_deliver("low", payload.clone(), resources.clone())
            .unwrap();
        let (_, first) = next_post_message(&mut rx).await;
        session
            .inner()
            .try_deliver("high", payload, resources)
            .unwrap();
        let (_, second) = next_post_message(&mut rx).await;

        // Sequential delivery: the second worker sees the first's total.
        assert_eq!(first, json!(1275));
        assert_eq!(second, json!(5050));
        session.close();
    }

    #[tokio::test]
    async fn test_hundred_workers_each_increment_the_counter_once() {
        let (session, mut rx) = test_session(&[]);
        session.inner().create_buffer(BUFFER_ID, 4).unwrap();

        let script = r#"
            addEventListener("message", function (e) {
                Atomics.add(new Int32Array(e.data.buf), 0, 1);
                postMessage("bumped");
            });
        "#;
        for i in 0..100 {
            session
                .inner()
                .create_worker(&format!("w{i}"), script, None)
                .unwrap();
        }

        let mut payload = json!({ "buf": BUFFER_ID });
        let resources = session.inner().substitute(&mut payload);
        for i in 0..100 {
            session
                .inner()
                .try_deliver(&format!("w{i}"), payload.clone(), resources.clone())
                .unwrap();
        }
        for _ in 0..100 {
            let (_, message) = next_post_message(&mut rx).await;
            assert_eq!(message, json!("bumped"));
        }

        session
            .inner()
            .create_worker(
                "checker",
                r#"
                addEventListener("message", function (e) {
                    postMessage(Atomics.load(new Int32Array(e.data.buf), 0));
                });
                "#,
                None,
            )
            .unwrap();
        session
            .inner()
            .try_deliver("checker", payload, resources)
            .unwrap();
        let (_, total) = next_post_message(&mut rx).await;
        assert_eq!(total, json!(100));
        session.close();
    }

    #[tokio::test]
    async fn test_close_terminates_every_worker() {
        let (session, _rx) = test_session(&[]);
        session
            .inner()
            .create_worker("w1", "postMessage(1);", None)
            .unwrap();
        session
            .inner()
            .create_worker("w2", "postMessage(2);", None)
            .unwrap();
        assert_eq!(session.inner().worker_count(), 2);

        session.close();
        assert_eq!(session.inner().worker_count(), 0);
        assert!(matches!(
            session.inner().create_worker("w3", "1;", None),
            Err(SessionError::Closed(_))
        ));
    }
}
