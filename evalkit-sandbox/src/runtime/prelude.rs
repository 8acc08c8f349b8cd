//! Worker-style globals installed into every interpreter
//!
//! Everything the host exposes goes through four native functions registered
//! before this script runs:
//!
//! - `__evalkit_host_console(level, text)`
//! - `__evalkit_host_call(index, argsJson)` returns a JSON string
//! - `__evalkit_host_db(index, op, argsJson)` returns a JSON string or undefined
//! - `__evalkit_host_fetch(requestJson)` returns a JSON string
//!
//! Values cross the boundary as JSON text only.

pub(crate) const PRELUDE_JS: &str = r#"
(function (global) {
    'use strict';

    const hostConsole = global.__evalkit_host_console;
    const hostCall = global.__evalkit_host_call;
    const hostDb = global.__evalkit_host_db;
    const hostFetch = global.__evalkit_host_fetch;

    function formatValue(value) {
        if (typeof value === 'string') return value;
        if (value === undefined) return 'undefined';
        if (typeof value === 'function') return '[Function' + (value.name ? ': ' + value.name : '') + ']';
        if (value instanceof Error) return value.name + ': ' + value.message;
        try {
            const text = JSON.stringify(value);
            return text === undefined ? String(value) : text;
        } catch (_) {
            return String(value);
        }
    }

    function formatArgs(args) {
        return Array.prototype.map.call(args, formatValue).join(' ');
    }

    function consoleLevel(method) {
        return method === 'warn' || method === 'error' ? method : 'log';
    }

    function makeConsole(write) {
        const console = {};
        for (const method of ['log', 'info', 'debug', 'trace', 'warn', 'error']) {
            console[method] = (...args) => { write(consoleLevel(method), formatArgs(args)); };
        }
        return Object.freeze(console);
    }

    // Forwards to the host sink
    function hostBackedConsole() {
        return makeConsole((level, text) => { hostConsole(level, text); });
    }

    // Appends into a caller-owned array
    function capturingConsole(sink) {
        return makeConsole((level, text) => { sink.push({ type: level, text: text }); });
    }

    function decode(text) {
        return text === undefined ? undefined : JSON.parse(text);
    }

    function normalizeHeaders(headers) {
        const out = {};
        if (!headers) return out;
        for (const key of Object.keys(headers)) {
            out[String(key).toLowerCase()] = String(headers[key]);
        }
        return out;
    }

    class Request {
        constructor(url, init = {}) {
            this.url = String(url);
            this.method = String(init.method || 'GET').toUpperCase();
            this.headers = normalizeHeaders(init.headers);
            this.body = init.body === undefined || init.body === null ? null : String(init.body);
        }

        async text() {
            return this.body === null ? '' : this.body;
        }

        async json() {
            return JSON.parse(await this.text());
        }
    }

    class Response {
        constructor(body, init = {}) {
            this.body = body === undefined || body === null ? null : String(body);
            this.status = init.status || 200;
            this.ok = this.status >= 200 && this.status < 300;
            this.headers = normalizeHeaders(init.headers);
        }

        async text() {
            return this.body === null ? '' : this.body;
        }

        async json() {
            return JSON.parse(await this.text());
        }

        static json(data, init = {}) {
            return new Response(JSON.stringify(data), {
                ...init,
                headers: { 'content-type': 'application/json', ...(init.headers || {}) },
            });
        }
    }

    async function fetch(input, init = {}) {
        const request = input instanceof Request ? input : new Request(input, init);
        const reply = JSON.parse(hostFetch(JSON.stringify({
            url: request.url,
            method: request.method,
            headers: request.headers,
            body: request.body,
        })));
        return new Response(reply.body, { status: reply.status, headers: reply.headers });
    }

    function hostFunction(index) {
        return function (...args) {
            return decode(hostCall(index, JSON.stringify(args)));
        };
    }

    function dbHandle(index, readOnly) {
        const call = (op, args) => decode(hostDb(index, op, JSON.stringify(args)));
        const handle = {
            list: (pattern) => call('list', [pattern === undefined ? null : pattern]),
            get: (id) => call('get', [String(id)]),
        };
        if (!readOnly) {
            handle.set = (id, data) => { call('set', [String(id), data === undefined ? null : data]); };
            handle.delete = (pattern) => call('delete', [String(pattern)]);
        }
        return Object.freeze(handle);
    }

    function buildEnv(manifest) {
        const env = {};
        for (const entry of manifest) {
            if (entry.kind === 'data') env[entry.name] = entry.value;
            else if (entry.kind === 'function') env[entry.name] = hostFunction(entry.index);
            else if (entry.kind === 'db') env[entry.name] = dbHandle(entry.index, entry.readOnly);
        }
        return env;
    }

    function errorName(error) {
        if (error !== null && typeof error === 'object' && typeof error.name === 'string') return error.name;
        return undefined;
    }

    function envelopeOk(value, consoleEntries) {
        try {
            return JSON.stringify({ ok: true, value: value, console: consoleEntries });
        } catch (_) {
            return JSON.stringify({ ok: true, value: String(value), console: consoleEntries });
        }
    }

    function envelopeErr(error, consoleEntries) {
        const isObject = error !== null && typeof error === 'object';
        const message = isObject && 'message' in error ? String(error.message) : String(error);
        const stack = isObject && typeof error.stack === 'string' ? error.stack : undefined;
        return JSON.stringify({
            ok: false,
            message: message,
            stack: stack,
            name: errorName(error),
            console: consoleEntries,
        });
    }

    function settle(promise, slot) {
        global[slot] = undefined;
        Promise.resolve(promise).then(
            (value) => { global[slot] = envelopeOk(value); },
            (error) => { global[slot] = envelopeErr(error); },
        );
    }

    function entryObject() {
        const entry = global.__evalkit_entry;
        if (entry === null || typeof entry !== 'object') {
            throw new TypeError('Isolate main module did not produce an entry object');
        }
        return entry;
    }

    function dispatchFetch(requestJson) {
        settle((async () => {
            const entry = entryObject();
            if (typeof entry.fetch !== 'function') {
                throw new TypeError('Isolate entry does not export a fetch handler');
            }
            const payload = JSON.parse(requestJson);
            const request = new Request(payload.url, payload);
            const result = await entry.fetch(request, global.__evalkit_env);
            const response = result instanceof Response
                ? result
                : new Response(typeof result === 'string' ? result : JSON.stringify(result));
            return { status: response.status, headers: response.headers, body: await response.text() };
        })(), '__evalkit_reply');
    }

    function dispatchMethod(name, argsJson) {
        settle((async () => {
            const entry = entryObject();
            if (typeof entry[name] !== 'function') {
                throw new TypeError('Isolate entry has no method ' + name);
            }
            return await entry[name].apply(entry, JSON.parse(argsJson));
        })(), '__evalkit_reply');
    }

    global.Request = Request;
    global.Response = Response;
    global.fetch = fetch;
    global.console = hostBackedConsole();
    global.__evalkit = Object.freeze({
        buildEnv,
        capturingConsole,
        envelopeOk,
        envelopeErr,
        settle,
        dispatchFetch,
        dispatchMethod,
    });
})(globalThis);
"#;
