// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The sandbox thread body.
//!
//! Runs entirely on one OS thread: builds the engine context, registers
//! the `__host*` natives, evaluates the shim and the client script, then
//! serves the command channel until `Shutdown`. All guest callback errors
//! are caught here at the bridge boundary and logged; a throwing handler
//! never takes the sandbox down.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use boa_engine::object::builtins::{JsArray, JsArrayBuffer, JsSharedArrayBuffer};
use boa_engine::object::ObjectInitializer;
use boa_engine::vm::RuntimeLimits;
use boa_engine::{
    js_string, Context, JsArgs, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction, Source,
};
use boa_gc::{empty_trace, Finalize, Trace};
use serde_json::Value;
use tokio::sync::{mpsc::UnboundedSender, watch};
use tracing::{debug, error, warn};

use crate::fetch::resolve_url;
use crate::observability::messages::sandbox::{
    CallbackFailed, SandboxReady, ScriptExecutionFailed,
};
use crate::preprocessor::analyze_script;
use crate::protocol::marker_bytes;
use crate::sandbox::capabilities::SandboxCapabilities;
use crate::sandbox::shim::{BUILTIN_END, SHIM_SOURCE};
use crate::sandbox::{
    LiveResource, OffWorkerOptions, ParentLink, SandboxCommand, SandboxEvent, RESOURCE_MARKER,
};

/// Everything a sandbox thread needs, bundled at spawn time.
pub(super) struct SandboxSpec {
    pub id: String,
    pub script: String,
    pub options: OffWorkerOptions,
    pub capabilities: SandboxCapabilities,
    pub events: UnboundedSender<SandboxEvent>,
    pub self_tx: mpsc::Sender<SandboxCommand>,
    pub commands: mpsc::Receiver<SandboxCommand>,
    pub ready: watch::Sender<bool>,
    pub handler_ready: watch::Sender<bool>,
}

/// Host-side state shared by every native the sandbox registers.
struct SandboxState {
    id: String,
    url: Option<String>,
    capabilities: SandboxCapabilities,
    events: UnboundedSender<SandboxEvent>,
    self_tx: mpsc::Sender<SandboxCommand>,
    parent: Option<ParentLink>,
    handler_ready: watch::Sender<bool>,
    /// Resources mounted into this context so far, by ID. Consulted when
    /// the guest re-shares a resource with a nested worker.
    mounted: RefCell<HashMap<String, LiveResource>>,
    /// Command channels of nested workers this sandbox created.
    nested: RefCell<HashMap<String, mpsc::Sender<SandboxCommand>>>,
    started: Instant,
}

#[derive(Finalize)]
struct HostBridge {
    state: Rc<SandboxState>,
}

unsafe impl Trace for HostBridge {
    empty_trace!();
}

pub(super) fn run(spec: SandboxSpec) {
    let SandboxSpec {
        id,
        script,
        options,
        capabilities,
        events,
        self_tx,
        commands,
        ready,
        handler_ready,
    } = spec;

    let state = Rc::new(SandboxState {
        id: id.clone(),
        url: options.url.clone(),
        capabilities,
        events,
        self_tx,
        parent: options.parent.clone(),
        handler_ready,
        mounted: RefCell::new(HashMap::new()),
        nested: RefCell::new(HashMap::new()),
        started: Instant::now(),
    });

    let mut context = Context::default();
    let mut limits = RuntimeLimits::default();
    limits.set_recursion_limit(512);
    limits.set_stack_size_limit(8 * 1024 * 1024);
    context.set_runtime_limits(limits);

    if let Err(e) = install_bridge(&mut context, &state) {
        fail_startup(&state, &e.to_string());
        return;
    }

    if let Err(e) = context.eval(Source::from_bytes(SHIM_SOURCE)) {
        fail_startup(&state, &e.to_string());
        return;
    }

    for (name, buffer) in &options.shared_memory {
        let handle = JsSharedArrayBuffer::from_buffer(buffer.clone(), &mut context);
        if let Err(e) = context.global_object().set(
            JsString::from(name.as_str()),
            handle,
            false,
            &mut context,
        ) {
            fail_startup(&state, &e.to_string());
            return;
        }
    }

    // Only top-level scripts go through the assignment rewrite; nested
    // scripts rely on the post-script registration pass instead.
    let source = if options.parent.is_none() {
        analyze_script(&script)
    } else {
        script
    };

    if let Err(e) = context.eval(Source::from_bytes(source.as_bytes())) {
        fail_startup(&state, &e.to_string());
        return;
    }

    if let Err(e) = context.eval(Source::from_bytes(BUILTIN_END)) {
        fail_startup(&state, &e.to_string());
        return;
    }

    let _ = ready.send(true);
    debug!("{}", SandboxReady { worker_id: &id });

    while let Ok(command) = commands.recv() {
        match command {
            SandboxCommand::Deliver { payload, resources } => {
                dispatch_inbound(
                    &mut context,
                    &state,
                    payload,
                    resources,
                    "__dispatchMessage();",
                    "onmessage",
                );
            }
            SandboxCommand::NestedMessage {
                worker_id,
                payload,
                resources,
            } => {
                let call = format!("__dispatchWorkerMessage({:?});", worker_id);
                dispatch_inbound(
                    &mut context,
                    &state,
                    payload,
                    resources,
                    &call,
                    "worker.onmessage",
                );
            }
            SandboxCommand::RunTimer { timer_id } => {
                let call = format!("__runTimer({});", timer_id);
                if let Err(e) = context.eval(Source::from_bytes(call.as_bytes())) {
                    error!(
                        "{}",
                        CallbackFailed {
                            worker_id: &state.id,
                            callback: "setTimeout",
                            error: &e.to_string(),
                        }
                    );
                }
            }
            SandboxCommand::Shutdown => break,
        }
    }

    debug!("Sandbox {} thread exiting", id);
}

/// Construction failed: log it and tell the session so the sandbox is
/// dropped from the worker map. The client learns nothing; a later lookup
/// of this ID reports not-found.
fn fail_startup(state: &SandboxState, error: &str) {
    error!(
        "{}",
        ScriptExecutionFailed {
            worker_id: &state.id,
            error,
        }
    );
    let _ = state.events.send(SandboxEvent::Closed {
        worker_id: state.id.clone(),
    });
}

/// Parks the prepared payload in `__inbound__` and evaluates `call`.
fn dispatch_inbound(
    context: &mut Context,
    state: &Rc<SandboxState>,
    payload: Value,
    resources: Vec<(String, LiveResource)>,
    call: &str,
    callback: &str,
) {
    let extra: HashMap<String, LiveResource> = resources.into_iter().collect();

    let prepared = match json_to_js(&payload, state, &extra, context) {
        Ok(value) => value,
        Err(e) => {
            error!(
                "{}",
                CallbackFailed {
                    worker_id: &state.id,
                    callback,
                    error: &e.to_string(),
                }
            );
            return;
        }
    };

    let set = context
        .global_object()
        .set(js_string!("__inbound__"), prepared, false, context);
    if let Err(e) = set {
        error!(
            "{}",
            CallbackFailed {
                worker_id: &state.id,
                callback,
                error: &e.to_string(),
            }
        );
        return;
    }

    if let Err(e) = context.eval(Source::from_bytes(call.as_bytes())) {
        error!(
            "{}",
            CallbackFailed {
                worker_id: &state.id,
                callback,
                error: &e.to_string(),
            }
        );
    }
}

fn type_error(message: impl Into<String>) -> JsError {
    JsError::from(JsNativeError::typ().with_message(message.into()))
}

/// Registers every `__host*` native the shim calls.
fn install_bridge(context: &mut Context, state: &Rc<SandboxState>) -> JsResult<()> {
    let bridge = |state: &Rc<SandboxState>| HostBridge {
        state: Rc::clone(state),
    };

    context.register_global_callable(
        js_string!("__hostLog"),
        1,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, args, captures, ctx| {
                    let line = args
                        .get_or_undefined(0)
                        .to_string(ctx)?
                        .to_std_string_escaped();
                    let state = &captures.state;
                    state.capabilities.log.log(&state.id, &line);
                    Ok(JsValue::undefined())
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostPostMessage"),
        1,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, args, captures, ctx| {
                    let raw = args
                        .get_or_undefined(0)
                        .to_string(ctx)?
                        .to_std_string_escaped();
                    let payload: Value = serde_json::from_str(&raw)
                        .map_err(|e| type_error(format!("postMessage payload: {e}")))?;

                    let state = &captures.state;
                    match &state.parent {
                        Some(parent) => {
                            let resources =
                                collect_resources(&payload, &state.mounted.borrow());
                            let sent = parent.parent_tx.send(SandboxCommand::NestedMessage {
                                worker_id: parent.child_id.clone(),
                                payload,
                                resources,
                            });
                            if sent.is_err() {
                                debug!(
                                    "Parent of sandbox {} is gone, dropping message",
                                    state.id
                                );
                            }
                        }
                        None => {
                            let _ = state.events.send(SandboxEvent::PostMessage {
                                worker_id: state.id.clone(),
                                payload,
                            });
                        }
                    }
                    Ok(JsValue::undefined())
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostClose"),
        0,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, _args, captures, _ctx| {
                    let state = &captures.state;
                    debug!("Sandbox {} calls close()", state.id);
                    let _ = state.events.send(SandboxEvent::Closed {
                        worker_id: state.id.clone(),
                    });
                    Ok(JsValue::undefined())
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostHandlerRegistered"),
        0,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, _args, captures, _ctx| {
                    let _ = captures.state.handler_ready.send(true);
                    Ok(JsValue::undefined())
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostSetTimeout"),
        2,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, args, captures, ctx| {
                    let timer_id = args.get_or_undefined(0).to_number(ctx)? as u64;
                    let delay = args.get_or_undefined(1).to_number(ctx)?.max(0.0) as u64;
                    let tx = captures.state.self_tx.clone();
                    captures.state.capabilities.timer.schedule(
                        Duration::from_millis(delay),
                        Box::new(move || {
                            let _ = tx.send(SandboxCommand::RunTimer { timer_id });
                        }),
                    );
                    Ok(JsValue::undefined())
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostPerformanceNow"),
        0,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, _args, captures, _ctx| {
                    let elapsed = captures.state.started.elapsed().as_secs_f64() * 1000.0;
                    Ok(JsValue::from(elapsed))
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostDownload"),
        1,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, args, captures, ctx| {
                    let url = args
                        .get_or_undefined(0)
                        .to_string(ctx)?
                        .to_std_string_escaped();
                    let state = &captures.state;
                    let resolved = resolve_url(state.url.as_deref(), &url);
                    debug!("Sandbox {} downloading {}", state.id, resolved);
                    let text = state
                        .capabilities
                        .fetcher
                        .fetch_text(&resolved)
                        .map_err(|e| type_error(e.to_string()))?;
                    Ok(JsValue::from(JsString::from(text.as_str())))
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostDownloadBytes"),
        1,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, args, captures, ctx| {
                    let url = args
                        .get_or_undefined(0)
                        .to_string(ctx)?
                        .to_std_string_escaped();
                    let state = &captures.state;
                    let resolved = resolve_url(state.url.as_deref(), &url);
                    let bytes = state
                        .capabilities
                        .fetcher
                        .fetch_bytes(&resolved)
                        .map_err(|e| type_error(e.to_string()))?;
                    let encoded = BASE64.encode(bytes.as_slice());
                    Ok(JsValue::from(JsString::from(encoded.as_str())))
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostCreateWorker"),
        2,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, args, captures, ctx| {
                    let url_or_script = args
                        .get_or_undefined(0)
                        .to_string(ctx)?
                        .to_std_string_escaped();
                    let raw = args.get_or_undefined(1).to_boolean();

                    let state = &captures.state;
                    let spawner = state
                        .capabilities
                        .spawner
                        .upgrade()
                        .ok_or_else(|| type_error("session is shutting down"))?;

                    let (script, url) = if raw {
                        (url_or_script, None)
                    } else {
                        let resolved = resolve_url(state.url.as_deref(), &url_or_script);
                        debug!("Sandbox {} downloading {}", state.id, resolved);
                        let script = state
                            .capabilities
                            .fetcher
                            .fetch_text(&resolved)
                            .map_err(|e| type_error(e.to_string()))?;
                        (script, Some(resolved))
                    };

                    let child_id = uuid::Uuid::new_v4().to_string();
                    let link = ParentLink {
                        child_id: child_id.clone(),
                        parent_tx: state.self_tx.clone(),
                    };
                    let child_tx = spawner
                        .create_nested(&child_id, &script, link, url)
                        .map_err(|e| type_error(e.to_string()))?;
                    state.nested.borrow_mut().insert(child_id.clone(), child_tx);

                    Ok(JsValue::from(JsString::from(child_id.as_str())))
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostWorkerPostMessage"),
        2,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, args, captures, ctx| {
                    let worker_id = args
                        .get_or_undefined(0)
                        .to_string(ctx)?
                        .to_std_string_escaped();
                    let raw = args
                        .get_or_undefined(1)
                        .to_string(ctx)?
                        .to_std_string_escaped();
                    let payload: Value = serde_json::from_str(&raw)
                        .map_err(|e| type_error(format!("postMessage payload: {e}")))?;

                    let state = &captures.state;
                    let resources = collect_resources(&payload, &state.mounted.borrow());
                    let tx = state.nested.borrow().get(&worker_id).cloned();
                    match tx {
                        Some(tx) => {
                            if tx
                                .send(SandboxCommand::Deliver { payload, resources })
                                .is_err()
                            {
                                warn!("Nested worker {} is gone", worker_id);
                            }
                        }
                        None => warn!("{} is not in the channel map", worker_id),
                    }
                    Ok(JsValue::undefined())
                },
                bridge(state),
            )
        },
    )?;

    context.register_global_callable(
        js_string!("__hostWorkerTerminate"),
        1,
        unsafe {
            NativeFunction::from_closure_with_captures(
                move |_this, args, captures, ctx| {
                    let worker_id = args
                        .get_or_undefined(0)
                        .to_string(ctx)?
                        .to_std_string_escaped();
                    let state = &captures.state;
                    state.nested.borrow_mut().remove(&worker_id);
                    if let Some(spawner) = state.capabilities.spawner.upgrade() {
                        spawner.terminate_nested(&worker_id);
                    }
                    Ok(JsValue::undefined())
                },
                bridge(state),
            )
        },
    )?;

    Ok(())
}

/// Converts an inbound payload to an engine value, splicing live resources
/// back in at their markers.
fn json_to_js(
    value: &Value,
    state: &Rc<SandboxState>,
    extra: &HashMap<String, LiveResource>,
    context: &mut Context,
) -> JsResult<JsValue> {
    match value {
        Value::Null => Ok(JsValue::null()),
        Value::Bool(b) => Ok(JsValue::from(*b)),
        Value::Number(n) => Ok(JsValue::from(n.as_f64().unwrap_or(0.0))),
        Value::String(s) => Ok(JsValue::from(JsString::from(s.as_str()))),
        Value::Array(items) => {
            let array = JsArray::new(context);
            for item in items {
                let converted = json_to_js(item, state, extra, context)?;
                array.push(converted, context)?;
            }
            Ok(array.into())
        }
        Value::Object(map) => {
            if let Some(decoded) = marker_bytes(value) {
                let bytes =
                    decoded.map_err(|e| type_error(format!("bad byte region: {e}")))?;
                let buffer = JsArrayBuffer::from_byte_block(bytes, context)?;
                return Ok(buffer.into());
            }
            if map.len() == 1 {
                if let Some(Value::String(resource_id)) = map.get(RESOURCE_MARKER) {
                    return mount_resource(resource_id, state, extra, context);
                }
            }

            let object = ObjectInitializer::new(context).build();
            for (key, item) in map {
                let converted = json_to_js(item, state, extra, context)?;
                object.set(JsString::from(key.as_str()), converted, false, context)?;
            }
            Ok(object.into())
        }
    }
}

/// Builds the guest-visible object for a resource and remembers it in the
/// mounted map. Unknown IDs degrade to the bare ID string.
fn mount_resource(
    id: &str,
    state: &Rc<SandboxState>,
    extra: &HashMap<String, LiveResource>,
    context: &mut Context,
) -> JsResult<JsValue> {
    let resource = extra
        .get(id)
        .cloned()
        .or_else(|| state.mounted.borrow().get(id).cloned());
    let Some(resource) = resource else {
        return Ok(JsValue::from(JsString::from(id)));
    };

    state
        .mounted
        .borrow_mut()
        .insert(id.to_owned(), resource.clone());

    match resource {
        LiveResource::Buffer(buffer) => {
            let handle = JsObject::from(JsSharedArrayBuffer::from_buffer(buffer, context));
            handle.set(
                js_string!("__offworkerId"),
                JsString::from(id),
                false,
                context,
            )?;
            Ok(handle.into())
        }
        LiveResource::Memory { descriptor, buffer } => {
            let backing = JsSharedArrayBuffer::from_buffer(buffer, context);
            let object = ObjectInitializer::new(context).build();
            object.set(js_string!("buffer"), backing, false, context)?;
            object.set(js_string!("initial"), descriptor.initial, false, context)?;
            let maximum = match descriptor.maximum {
                Some(maximum) => JsValue::from(maximum),
                None => JsValue::undefined(),
            };
            object.set(js_string!("maximum"), maximum, false, context)?;
            object.set(js_string!("shared"), descriptor.shared, false, context)?;
            object.set(
                js_string!("__offworkerId"),
                JsString::from(id),
                false,
                context,
            )?;
            Ok(object.into())
        }
        LiveResource::Module { exports } => {
            let names = JsArray::new(context);
            for name in &exports {
                names.push(JsString::from(name.as_str()), context)?;
            }
            let object = ObjectInitializer::new(context).build();
            object.set(js_string!("id"), JsString::from(id), false, context)?;
            object.set(js_string!("exports"), names, false, context)?;
            object.set(
                js_string!("__offworkerId"),
                JsString::from(id),
                false,
                context,
            )?;
            Ok(object.into())
        }
    }
}

/// Finds every resource marker in an outbound payload and pairs it with
/// the live resource from the mounted map.
fn collect_resources(
    value: &Value,
    mounted: &HashMap<String, LiveResource>,
) -> Vec<(String, LiveResource)> {
    let mut out = Vec::new();
    collect_into(value, mounted, &mut out);
    out
}

fn collect_into(
    value: &Value,
    mounted: &HashMap<String, LiveResource>,
    out: &mut Vec<(String, LiveResource)>,
) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(id)) = map.get(RESOURCE_MARKER) {
                    if let Some(resource) = mounted.get(id) {
                        if !out.iter().any(|(existing, _)| existing == id) {
                            out.push((id.clone(), resource.clone()));
                        }
                    }
                    return;
                }
            }
            for item in map.values() {
                collect_into(item, mounted, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, mounted, out);
            }
        }
        _ => {}
    }
}
