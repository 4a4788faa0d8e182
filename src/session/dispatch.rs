// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Maps inbound wire envelopes onto session operations.
//!
//! Two ordering rules from the client protocol shape this module:
//!
//! * Readiness replies for workers and WASM modules go out before the
//!   script or binary is even downloaded. The client pipelines follow-up
//!   messages against the ID it already holds, so replies cannot wait on
//!   slow fetches.
//! * A `post_message` may therefore arrive before its target worker
//!   exists. Delivery retries on a short interval, bounded by
//!   [`RETRY_LIMIT`], waking early whenever a worker registers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::errors::{ProtocolError, SessionError, SessionResult};
use crate::observability::messages::protocol::{DeliveryRetrying, EnvelopeRejected, ReadySent};
use crate::observability::messages::sandbox::DeliveryFailed;
use crate::observability::messages::session::WasmModuleCompileFailed;
use crate::protocol::{self, ConnectionState};
use crate::sandbox::LiveResource;
use crate::session::SessionInner;
use crate::wasm::{self, WasmMemoryDescriptor};

/// Pause between delivery attempts for a worker that is not in the map yet.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Delivery attempts before giving up, roughly six seconds in total.
pub const RETRY_LIMIT: u32 = 400;

const RETRY_LOG_EVERY: u32 = 40;

/// Decodes and dispatches one raw message off the socket.
///
/// Protocol and session failures are logged and swallowed; a bad message
/// never takes the connection down.
pub async fn handle_message(session: &Arc<SessionInner>, raw: &str) {
    let envelope = match protocol::decode(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("{}", EnvelopeRejected { error: &e });
            return;
        }
    };

    let state = envelope.state;
    if let Err(e) = dispatch(session, envelope).await {
        error!("Failed to handle {:?} message: {}", state, e);
    }
}

async fn dispatch(
    session: &Arc<SessionInner>,
    envelope: protocol::Envelope,
) -> anyhow::Result<()> {
    let data = envelope.data;
    match envelope.state {
        ConnectionState::Message => {
            debug!("Received message: {}", data);
        }

        ConnectionState::CreateBuffer => {
            let id = str_field(&data, "id")?.to_owned();
            let size = uint_field(&data, "size")? as usize;

            let allocating = Arc::clone(session);
            let buffer_id = id.clone();
            tokio::task::spawn_blocking(move || allocating.create_buffer(&buffer_id, size))
                .await??;

            session.send(ConnectionState::BufferReady, json!(id));
            debug!("{}", ReadySent { what: "buffer", id: &id });
        }

        ConnectionState::CreateWasmModule => {
            let url = str_field(&data, "url")?.to_owned();
            let id = str_field(&data, "moduleId")?.to_owned();

            // The client holds the ID already; reply before the download.
            session.send(ConnectionState::WasmModuleReady, json!(id));
            debug!("{}", ReadySent { what: "wasm module", id: &id });

            let compiling = Arc::clone(session);
            tokio::task::spawn_blocking(move || {
                let compiled = compiling
                    .fetcher
                    .fetch_bytes(&url)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
                    .and_then(|bytes| {
                        wasm::compile_module(&bytes)
                            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
                    });
                match compiled {
                    Ok(module) => compiling.insert_module(&id, module),
                    Err(e) => error!(
                        "{}",
                        WasmModuleCompileFailed {
                            module_id: &id,
                            url: &url,
                            error: e.as_ref(),
                        }
                    ),
                }
            });
        }

        ConnectionState::CreateWasmMemory => {
            let id = str_field(&data, "id")?.to_owned();
            let descriptor = memory_descriptor(&data)?;
            descriptor.validate()?;

            let allocating = Arc::clone(session);
            let memory_id = id.clone();
            tokio::task::spawn_blocking(move || {
                allocating.create_wasm_memory(&memory_id, descriptor)
            })
            .await??;

            session.send(ConnectionState::WasmMemoryReady, json!(id));
            debug!("{}", ReadySent { what: "wasm memory", id: &id });
        }

        ConnectionState::CreateWorker => {
            let url = str_field(&data, "url")?.to_owned();
            let id = str_field(&data, "id")?.to_owned();

            // The client starts posting as soon as it sees this; delivery
            // retries cover the window until the script is running.
            session.send(ConnectionState::WorkerReady, json!(id));
            debug!("{}", ReadySent { what: "worker", id: &id });

            let spawning = Arc::clone(session);
            tokio::spawn(async move {
                let fetcher = Arc::clone(&spawning.fetcher);
                let script_url = url.clone();
                let script = tokio::task::spawn_blocking(move || fetcher.fetch_text(&script_url))
                    .await;
                match script {
                    Ok(Ok(script)) => {
                        if let Err(e) = spawning.create_worker(&id, &script, Some(url)) {
                            error!("Failed to start worker {}: {}", id, e);
                        }
                    }
                    Ok(Err(e)) => error!("Cannot download worker script {} from {}: {}", id, url, e),
                    Err(e) => error!("Worker script download task failed: {}", e),
                }
            });
        }

        ConnectionState::PostMessage => {
            let worker_id = str_field(&data, "workerId")?.to_owned();
            let mut message = data.get("message").cloned().unwrap_or(Value::Null);
            let resources = session.substitute(&mut message);

            let delivering = Arc::clone(session);
            tokio::spawn(async move {
                match deliver_with_retry(&delivering, &worker_id, message, resources).await {
                    Ok(()) => {}
                    Err(SessionError::DeliveryTimeout { attempts, .. }) => {
                        error!(
                            "{}",
                            DeliveryFailed {
                                worker_id: &worker_id,
                                attempts,
                            }
                        );
                    }
                    Err(e) => {
                        error!("Failed to deliver message to worker {}: {}", worker_id, e);
                    }
                }
            });
        }

        ConnectionState::AcquireLockWithSync => {
            let buffer_id = data
                .as_str()
                .ok_or(ProtocolError::MissingField("data"))?
                .to_owned();
            session.grant_lock(&buffer_id)?;
            session.send(ConnectionState::GetLockWithSync, json!(buffer_id));
            debug!("Granted lock on buffer {}", buffer_id);
        }

        // Reserved client states and server-to-client states that echo back.
        other => {
            debug!("Ignoring {:?} message", other);
        }
    }
    Ok(())
}

/// Delivers to a worker, waiting out the window between the early
/// `worker_ready` reply and the worker actually landing in the map.
pub async fn deliver_with_retry(
    session: &SessionInner,
    worker_id: &str,
    payload: Value,
    resources: Vec<(String, LiveResource)>,
) -> SessionResult<()> {
    for attempt in 1..=RETRY_LIMIT {
        match session.try_deliver(worker_id, payload.clone(), resources.clone()) {
            Ok(()) => return Ok(()),
            Err(SessionError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        if attempt % RETRY_LOG_EVERY == 0 {
            warn!(
                "{}",
                DeliveryRetrying {
                    worker_id,
                    attempt,
                    total: RETRY_LIMIT,
                }
            );
        }
        session.wait_for_worker(RETRY_INTERVAL).await;
    }

    Err(SessionError::DeliveryTimeout {
        id: worker_id.to_owned(),
        attempts: RETRY_LIMIT,
    })
}

fn str_field<'a>(data: &'a Value, name: &'static str) -> Result<&'a str, ProtocolError> {
    data.get(name)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField(name))
}

fn uint_field(data: &Value, name: &'static str) -> Result<u64, ProtocolError> {
    data.get(name)
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField(name))
}

fn memory_descriptor(data: &Value) -> Result<WasmMemoryDescriptor, ProtocolError> {
    let descriptor = data
        .get("descriptor")
        .ok_or(ProtocolError::MissingField("descriptor"))?;
    Ok(WasmMemoryDescriptor {
        initial: uint_field(descriptor, "initial")? as u32,
        maximum: descriptor
            .get("maximum")
            .and_then(Value::as_u64)
            .map(|m| m as u32),
        shared: descriptor
            .get("shared")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, Fetcher};
    use crate::sandbox::capabilities::{ThreadTimer, TracingLogSink};
    use crate::session::Session;
    use std::collections::HashMap;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

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

    async fn next_envelope(rx: &mut UnboundedReceiver<String>) -> protocol::Envelope {
        let raw = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for an outbound message")
            .expect("outbound channel closed");
        protocol::decode(&raw).unwrap()
    }

    const BUFFER_ID: &str = "11111111-2222-3333-4444-555555555555";

    #[tokio::test]
    async fn test_create_buffer_replies_with_the_bare_id() {
        let (session, mut rx) = test_session(&[]);
        let raw = format!(
            r#"{{"state":"create_buffer","data":{{"id":"{BUFFER_ID}","size":64}},"code":null}}"#
        );
        session.handle_message(&raw).await;

        let envelope = next_envelope(&mut rx).await;
        assert_eq!(envelope.state, ConnectionState::BufferReady);
        assert_eq!(envelope.data, json!(BUFFER_ID));
    }

    #[tokio::test]
    async fn test_create_worker_ready_precedes_its_output() {
        let files = [("http://host/worker.js", r#"postMessage("hi");"#)];
        let (session, mut rx) = test_session(&files);
        let raw = r#"{"state":"create_worker","data":{"id":"w1","url":"http://host/worker.js"},"code":null}"#;
        session.handle_message(raw).await;

        let first = next_envelope(&mut rx).await;
        assert_eq!(first.state, ConnectionState::WorkerReady);
        assert_eq!(first.data, json!("w1"));

        let second = next_envelope(&mut rx).await;
        assert_eq!(second.state, ConnectionState::PostMessage);
        assert_eq!(second.data, json!({ "id": "w1", "message": "hi" }));
        session.close();
    }

    #[tokio::test]
    async fn test_post_message_waits_for_a_late_worker() {
        let files = [(
            "http://host/echo.js",
            r#"addEventListener("message", function (e) { postMessage(e.data * 2); });"#,
        )];
        let (session, mut rx) = test_session(&files);

        let post =
            r#"{"state":"post_message","data":{"workerId":"w1","message":21},"code":null}"#;
        session.handle_message(post).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let create = r#"{"state":"create_worker","data":{"id":"w1","url":"http://host/echo.js"},"code":null}"#;
        session.handle_message(create).await;

        let ready = next_envelope(&mut rx).await;
        assert_eq!(ready.state, ConnectionState::WorkerReady);

        let reply = next_envelope(&mut rx).await;
        assert_eq!(reply.state, ConnectionState::PostMessage);
        assert_eq!(reply.data, json!({ "id": "w1", "message": 42 }));
        session.close();
    }

    #[tokio::test]
    async fn test_delivery_gives_up_after_the_retry_ceiling() {
        let (session, _rx) = test_session(&[]);
        tokio::time::pause();

        let pending = tokio::spawn({
            let session = Arc::clone(session.inner());
            async move { deliver_with_retry(&session, "never", json!(1), vec![]).await }
        });

        for _ in 0..=RETRY_LIMIT {
            tokio::time::advance(RETRY_INTERVAL).await;
        }
        let result = pending.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::DeliveryTimeout { attempts: RETRY_LIMIT, .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_lock_is_granted_with_the_buffer_id() {
        let (session, mut rx) = test_session(&[]);
        session.inner().create_buffer(BUFFER_ID, 8).unwrap();

        let raw = format!(
            r#"{{"state":"acquire_lock_with_sync","data":"{BUFFER_ID}","code":null}}"#
        );
        session.handle_message(&raw).await;

        let envelope = next_envelope(&mut rx).await;
        assert_eq!(envelope.state, ConnectionState::GetLockWithSync);
        assert_eq!(envelope.data, json!(BUFFER_ID));
    }

    #[tokio::test]
    async fn test_wasm_module_ready_is_sent_even_when_the_download_fails() {
        let (session, mut rx) = test_session(&[]);
        let raw = r#"{"state":"create_wasm_module","data":{"moduleId":"m1","url":"http://host/missing.wasm"},"code":null}"#;
        session.handle_message(raw).await;

        let envelope = next_envelope(&mut rx).await;
        assert_eq!(envelope.state, ConnectionState::WasmModuleReady);
        assert_eq!(envelope.data, json!("m1"));
    }

    #[tokio::test]
    async fn test_create_wasm_memory_replies_ready() {
        let (session, mut rx) = test_session(&[]);
        let raw = format!(
            r#"{{"state":"create_wasm_memory","data":{{"id":"{BUFFER_ID}","descriptor":{{"initial":1,"maximum":2,"shared":true}}}},"code":null}}"#
        );
        session.handle_message(&raw).await;

        let envelope = next_envelope(&mut rx).await;
        assert_eq!(envelope.state, ConnectionState::WasmMemoryReady);
        assert_eq!(envelope.data, json!(BUFFER_ID));

        // The memory now participates in payload substitution.
        let mut payload = json!({ "mem": BUFFER_ID });
        let resources = session.inner().substitute(&mut payload);
        assert_eq!(resources.len(), 1);
        assert!(matches!(resources[0].1, LiveResource::Memory { .. }));
    }

    #[tokio::test]
    async fn test_malformed_envelopes_are_dropped() {
        let (session, mut rx) = test_session(&[]);
        session.handle_message("not json at all").await;
        session
            .handle_message(r#"{"state":"launch_missiles","data":null,"code":null}"#)
            .await;
        session
            .handle_message(r#"{"state":"create_buffer","data":{"id":"x"},"code":null}"#)
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
