// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The JavaScript shim evaluated in every sandbox before the client script.
//!
//! It builds the Worker-style global surface (`postMessage`, `onmessage`,
//! `addEventListener`, `close`, `setTimeout`, `fetch`, `importScripts`,
//! nested `Worker`) on top of the `__host*` natives registered by the
//! runtime. Conventions shared with the host side:
//!
//! * Outbound payloads are serialized by `__serialize`: byte buffers become
//!   `{"$bytes": base64}` markers, mounted resources collapse to
//!   `{"$resource": id}` markers, and everything else is plain JSON.
//! * Inbound dispatch is by evaluation: the host parks the prepared value
//!   in the `__inbound__` global and evaluates `__dispatchMessage()`,
//!   `__dispatchWorkerMessage(id)`, or `__runTimer(id)`.
//! * Messages arriving before any handler is registered queue inside the
//!   guest and flush in order on the first registration. The same queue
//!   exists per nested worker handle.

/// Evaluated once, immediately after the natives are registered.
pub const SHIM_SOURCE: &str = r#"
var self = globalThis;
globalThis.self = self;

var __B64_ALPHABET = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

function __b64Encode(bytes) {
    var out = "";
    var i;
    for (i = 0; i + 2 < bytes.length; i += 3) {
        var n = (bytes[i] << 16) | (bytes[i + 1] << 8) | bytes[i + 2];
        out += __B64_ALPHABET[(n >> 18) & 63] + __B64_ALPHABET[(n >> 12) & 63] +
            __B64_ALPHABET[(n >> 6) & 63] + __B64_ALPHABET[n & 63];
    }
    var rest = bytes.length - i;
    if (rest === 1) {
        var n1 = bytes[i] << 16;
        out += __B64_ALPHABET[(n1 >> 18) & 63] + __B64_ALPHABET[(n1 >> 12) & 63] + "==";
    } else if (rest === 2) {
        var n2 = (bytes[i] << 16) | (bytes[i + 1] << 8);
        out += __B64_ALPHABET[(n2 >> 18) & 63] + __B64_ALPHABET[(n2 >> 12) & 63] +
            __B64_ALPHABET[(n2 >> 6) & 63] + "=";
    }
    return out;
}

function __b64Decode(str) {
    var bytes = [];
    var buffer = 0;
    var bits = 0;
    for (var i = 0; i < str.length; i++) {
        var v = __B64_ALPHABET.indexOf(str[i]);
        if (v < 0) continue;
        buffer = (buffer << 6) | v;
        bits += 6;
        if (bits >= 8) {
            bits -= 8;
            bytes.push((buffer >> bits) & 255);
        }
    }
    return new Uint8Array(bytes);
}

function __toWireValue(value) {
    if (value === null || value === undefined) return null;
    var t = typeof value;
    if (t === "number" || t === "string" || t === "boolean") return value;
    if (t === "function") return null;
    if (value.__offworkerId !== undefined) {
        return { "$resource": value.__offworkerId };
    }
    if (value instanceof ArrayBuffer) {
        return { "$bytes": __b64Encode(new Uint8Array(value)) };
    }
    if (typeof SharedArrayBuffer !== "undefined" && value instanceof SharedArrayBuffer) {
        return { "$bytes": __b64Encode(new Uint8Array(value)) };
    }
    if (ArrayBuffer.isView(value)) {
        return { "$bytes": __b64Encode(new Uint8Array(value.buffer, value.byteOffset, value.byteLength)) };
    }
    if (Array.isArray(value)) {
        var arr = [];
        for (var i = 0; i < value.length; i++) arr.push(__toWireValue(value[i]));
        return arr;
    }
    var out = {};
    for (var k in value) {
        if (Object.prototype.hasOwnProperty.call(value, k)) out[k] = __toWireValue(value[k]);
    }
    return out;
}

function __serialize(value) {
    return JSON.stringify(__toWireValue(value));
}

function log() {
    var parts = [];
    for (var i = 0; i < arguments.length; i++) parts.push(String(arguments[i]));
    __hostLog(parts.join(" "));
}
var console = { log: log, info: log, warn: log, error: log, debug: log };

var performance = {
    now: function () { return __hostPerformanceNow(); }
};

function postMessage(message, transfer) {
    __hostPostMessage(__serialize(message));
}
self.postMessage = postMessage;

function close() {
    __hostClose();
}
self.close = close;

var onmessage = null;
var __messageHandlers = [];
var __pendingMessages = [];

function __deliverEvent(event) {
    for (var i = 0; i < __messageHandlers.length; i++) {
        __messageHandlers[i](event);
    }
}

function __registerHandler(fn) {
    for (var i = 0; i < __messageHandlers.length; i++) {
        if (__messageHandlers[i] === fn) return;
    }
    __messageHandlers.push(fn);
    __hostHandlerRegistered();
    if (__pendingMessages.length > 0) {
        var pending = __pendingMessages;
        __pendingMessages = [];
        for (var j = 0; j < pending.length; j++) __deliverEvent(pending[j]);
    }
}

function addEventListener(name, func, options) {
    if (name == "message") {
        __registerHandler(func);
    } else {
        throw new Error('Error: addEventListener not supports "' + name + '"');
    }
}
self.addEventListener = addEventListener;

function __registerAssignedHandler(target) {
    if (target === self || target === globalThis) {
        if (typeof self.onmessage === "function") __registerHandler(self.onmessage);
        return;
    }
    if (target && target.__isOffWorker && typeof target.onmessage === "function") {
        target.__registerHandler(target.onmessage);
    }
}

function __dispatchMessage() {
    var event = { data: __inbound__ };
    __inbound__ = undefined;
    if (__messageHandlers.length === 0 && typeof self.onmessage === "function") {
        __registerHandler(self.onmessage);
    }
    if (__messageHandlers.length === 0) {
        __pendingMessages.push(event);
        return;
    }
    __deliverEvent(event);
}

var __timers = {};
var __nextTimerId = 1;

function setTimeout(fn, time) {
    var id = __nextTimerId++;
    __timers[id] = fn;
    __hostSetTimeout(id, time || 0);
    return id;
}

function clearTimeout(id) {
    delete __timers[id];
}

function __runTimer(timerId) {
    var fn = __timers[timerId];
    if (fn !== undefined) {
        delete __timers[timerId];
        fn();
    }
}

function fetch(url) {
    var content = __hostDownload(String(url));
    return {
        _content: content,
        text: function () { return this._content; },
        json: function () { return JSON.parse(this._content); }
    };
}

// Variant of fetch that also exposes the raw bytes.
function fetch2(url) {
    var u = String(url);
    var buf = __b64Decode(__hostDownloadBytes(u)).buffer;
    var content = __hostDownload(u);
    return {
        _buf: buf,
        _content: content,
        text: function () { return this._content; },
        arrayBuffer: function () { return this._buf; }
    };
}

function importScripts() {
    for (var i = 0; i < arguments.length; i++) {
        var script = __hostDownload(String(arguments[i]));
        try {
            (0, eval)(script);
        } catch (e) {
            log("importScripts Eval Error");
            throw String(e);
        }
    }
}

var __workers__ = {};

function Worker(urlOrScript, isRaw) {
    this.onerror = null;
    this.onmessage = null;
    this.onmessageerror = null;
    this.__isOffWorker = true;
    this.__handlers = [];
    this.__pending = [];

    this._id = __hostCreateWorker(String(urlOrScript), !!isRaw);
    __workers__[this._id] = this;
}

Worker.prototype.postMessage = function (message, transfer) {
    __hostWorkerPostMessage(this._id, __serialize(message));
};

Worker.prototype.__registerHandler = function (fn) {
    for (var i = 0; i < this.__handlers.length; i++) {
        if (this.__handlers[i] === fn) return;
    }
    this.__handlers.push(fn);
    if (this.__pending.length > 0) {
        var pending = this.__pending;
        this.__pending = [];
        for (var j = 0; j < pending.length; j++) this.__dispatchEvent(pending[j]);
    }
};

Worker.prototype.__dispatchEvent = function (event) {
    if (this.__handlers.length === 0 && typeof this.onmessage === "function") {
        this.__registerHandler(this.onmessage);
    }
    if (this.__handlers.length === 0) {
        this.__pending.push(event);
        return;
    }
    for (var i = 0; i < this.__handlers.length; i++) this.__handlers[i](event);
};

Worker.prototype.addEventListener = function (name, fn, options) {
    if (name == "message") {
        this.__registerHandler(fn);
    } else {
        throw new Error('Error: worker\'s addEventListener not supports "' + name + '"');
    }
};

Worker.prototype.terminate = function () {
    __hostWorkerTerminate(this._id);
    delete __workers__[this._id];
};

function __dispatchWorkerMessage(workerId) {
    var w = __workers__[workerId];
    if (!w) {
        __inbound__ = undefined;
        return;
    }
    var event = { data: __inbound__ };
    __inbound__ = undefined;
    w.__dispatchEvent(event);
}
"#;

/// Evaluated after the client script, in the same context.
///
/// Catches the plain-assignment forms the rewrite in
/// [`crate::preprocessor`] can miss: a top-level `onmessage = fn` that
/// executed before the shim's bridge existed, and `worker.onmessage`
/// assignments on handles created during script execution.
pub const BUILTIN_END: &str = r#"
if (typeof self.onmessage === "function") {
    __registerAssignedHandler(self);
}
for (var __wid in __workers__) {
    var __w = __workers__[__wid];
    if (typeof __w.onmessage === "function") {
        __w.__registerHandler(__w.onmessage);
    }
}
"#;
