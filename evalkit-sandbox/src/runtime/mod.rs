//! Interpreter glue shared by the isolate platform and the fallback executor
//!
//! A [`Context`] is single-threaded and never leaves the thread that created
//! it. Host capabilities are registered as native functions that close over a
//! [`HostState`]; everything else is plain script evaluated on top.

mod prelude;

use crate::bindings::{BindingValue, PreparedBindings};
use crate::db::DbContext;
use crate::fetch::{FetchRequest, Fetcher};
use crate::limits::ResourceLimits;
use crate::types::{ConsoleEntry, ConsoleLevel};
use boa_engine::{
    Context, JsArgs, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source,
};
use boa_gc::{empty_trace, Finalize, Trace};
use serde_json::{json, Value};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

pub(crate) use prelude::PRELUDE_JS;

/// Global the fallback harness settles into
pub(crate) const OUTCOME_SLOT: &str = "__evalkit_outcome";

/// Global the isolate dispatch helpers settle into
pub(crate) const REPLY_SLOT: &str = "__evalkit_reply";

/// Where `console.*` output goes
#[derive(Debug, Clone)]
pub(crate) enum ConsoleSink {
    /// Buffered for the caller, in call order
    Capture(Arc<Mutex<Vec<ConsoleEntry>>>),
    /// Forwarded to tracing under the isolate's id
    Trace { isolate_id: String },
}

impl ConsoleSink {
    fn write(&self, level: ConsoleLevel, text: String) {
        match self {
            ConsoleSink::Capture(buffer) => {
                if let Ok(mut entries) = buffer.lock() {
                    entries.push(ConsoleEntry::new(level, text));
                }
            }
            ConsoleSink::Trace { isolate_id } => match level {
                ConsoleLevel::Error => tracing::error!(isolate_id = %isolate_id, "{}", text),
                ConsoleLevel::Warn => tracing::warn!(isolate_id = %isolate_id, "{}", text),
                ConsoleLevel::Log => tracing::info!(isolate_id = %isolate_id, "{}", text),
            },
        }
    }
}

struct HostState {
    bindings: PreparedBindings,
    console: ConsoleSink,
}

#[derive(Finalize)]
struct HostCapture {
    state: Rc<HostState>,
}

// Holds no GC-managed values.
unsafe impl Trace for HostCapture {
    empty_trace!();
}

type HostFn = fn(&JsValue, &[JsValue], &HostCapture, &mut Context) -> JsResult<JsValue>;

fn throw(message: &str) -> JsError {
    JsNativeError::error()
        .with_message(message.to_string())
        .into()
}

fn type_error(message: &str) -> JsError {
    JsNativeError::typ()
        .with_message(message.to_string())
        .into()
}

fn js_text(text: &str) -> JsValue {
    JsValue::from(JsString::from(text))
}

fn arg_string(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn arg_json<T: serde::de::DeserializeOwned>(
    args: &[JsValue],
    index: usize,
    context: &mut Context,
) -> JsResult<T> {
    let text = arg_string(args, index, context)?;
    serde_json::from_str(&text).map_err(|e| type_error(&format!("Invalid host call payload: {}", e)))
}

fn host_console(
    _this: &JsValue,
    args: &[JsValue],
    captures: &HostCapture,
    context: &mut Context,
) -> JsResult<JsValue> {
    let level = ConsoleLevel::from_method(&arg_string(args, 0, context)?);
    let text = arg_string(args, 1, context)?;
    captures.state.console.write(level, text);
    Ok(JsValue::undefined())
}

fn host_call(
    _this: &JsValue,
    args: &[JsValue],
    captures: &HostCapture,
    context: &mut Context,
) -> JsResult<JsValue> {
    let index = args.get_or_undefined(0).to_u32(context)? as usize;
    let function = match captures.state.bindings.entry(index) {
        Some(BindingValue::Function(function)) => function.clone(),
        _ => return Err(type_error("Unknown host function")),
    };
    let call_args: Vec<Value> = arg_json(args, 1, context)?;
    match function(call_args) {
        Ok(value) => Ok(js_text(&value.to_string())),
        Err(message) => Err(throw(&message)),
    }
}

fn host_db(
    _this: &JsValue,
    args: &[JsValue],
    captures: &HostCapture,
    context: &mut Context,
) -> JsResult<JsValue> {
    let index = args.get_or_undefined(0).to_u32(context)? as usize;
    let db: Arc<dyn DbContext> = match captures.state.bindings.entry(index) {
        Some(BindingValue::Db(db)) => db.clone(),
        _ => return Err(type_error("Unknown document store")),
    };
    let op = arg_string(args, 1, context)?;
    let params: Vec<Value> = arg_json(args, 2, context)?;
    let text_param = |i: usize| params.get(i).and_then(Value::as_str).map(str::to_string);

    let result = match op.as_str() {
        "list" => db
            .list(text_param(0).as_deref())
            .map(|documents| Some(json!(documents))),
        "get" => {
            let id = text_param(0).ok_or_else(|| type_error("db.get expects an id"))?;
            db.get(&id)
        }
        "set" | "delete" if db.is_read_only() => {
            return Err(throw(&crate::db::DbError::ReadOnly.to_string()))
        }
        "set" => {
            let id = text_param(0).ok_or_else(|| type_error("db.set expects an id"))?;
            let data = params.get(1).cloned().unwrap_or(Value::Null);
            db.set(&id, data).map(|()| None)
        }
        "delete" => {
            let pattern = text_param(0).ok_or_else(|| type_error("db.delete expects a pattern"))?;
            db.delete(&pattern).map(|count| Some(json!(count)))
        }
        other => return Err(type_error(&format!("Unknown db operation: {}", other))),
    };

    match result {
        Ok(Some(value)) => Ok(js_text(&value.to_string())),
        Ok(None) => Ok(JsValue::undefined()),
        Err(e) => Err(throw(&e.to_string())),
    }
}

fn host_fetch(
    _this: &JsValue,
    args: &[JsValue],
    captures: &HostCapture,
    context: &mut Context,
) -> JsResult<JsValue> {
    let request: FetchRequest = arg_json(args, 0, context)?;
    let response = captures
        .state
        .bindings
        .fetcher()
        .fetch(request)
        .map_err(|message| type_error(&message))?;
    let text = serde_json::to_string(&response)
        .map_err(|e| throw(&format!("Failed to encode response: {}", e)))?;
    Ok(js_text(&text))
}

fn register(
    context: &mut Context,
    name: &str,
    length: usize,
    state: &Rc<HostState>,
    body: HostFn,
) -> JsResult<()> {
    let native = NativeFunction::from_copy_closure_with_captures(
        body,
        HostCapture {
            state: Rc::clone(state),
        },
    );
    context.register_global_builtin_callable(JsString::from(name), length, native)
}

fn manifest(bindings: &PreparedBindings) -> Value {
    Value::Array(
        bindings
            .iter()
            .enumerate()
            .map(|(index, (name, value))| match value {
                BindingValue::Data(data) => json!({"name": name, "kind": "data", "value": data}),
                BindingValue::Function(_) => json!({"name": name, "kind": "function", "index": index}),
                BindingValue::Db(db) => json!({
                    "name": name,
                    "kind": "db",
                    "index": index,
                    "readOnly": db.is_read_only(),
                }),
            })
            .collect(),
    )
}

/// Quote text as a script string literal
pub(crate) fn js_literal(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

/// Apply limits, register host functions, run the prelude and build `__evalkit_env`
pub(crate) fn install(
    context: &mut Context,
    bindings: PreparedBindings,
    console: ConsoleSink,
    limits: &ResourceLimits,
) -> Result<(), String> {
    context.set_runtime_limits(limits.runtime_limits());

    let manifest = manifest(&bindings).to_string();
    let state = Rc::new(HostState { bindings, console });
    let natives: [(&str, usize, HostFn); 4] = [
        ("__evalkit_host_console", 2, host_console),
        ("__evalkit_host_call", 2, host_call),
        ("__evalkit_host_db", 3, host_db),
        ("__evalkit_host_fetch", 1, host_fetch),
    ];
    for (name, length, body) in natives {
        register(context, name, length, &state, body)
            .map_err(|e| format!("Failed to register {}: {}", name, e))?;
    }

    eval(context, PRELUDE_JS)?;
    eval(
        context,
        &format!(
            "globalThis.__evalkit_env = globalThis.__evalkit.buildEnv(JSON.parse({}));",
            js_literal(&manifest)
        ),
    )?;
    Ok(())
}

/// Evaluate a classic script
pub(crate) fn eval(context: &mut Context, code: &str) -> Result<JsValue, String> {
    context
        .eval(Source::from_bytes(code))
        .map_err(|e| e.to_string())
}

/// Drain the microtask queue, logging a failed job under `owner_id`
pub(crate) fn run_jobs(context: &mut Context, owner_id: &str) {
    report_jobs(owner_id, context.run_jobs());
}

fn report_jobs(owner_id: &str, drained: JsResult<()>) {
    if let Err(error) = drained {
        tracing::debug!(owner_id = %owner_id, error = %error, "Queued job failed");
    }
}

/// Read and clear a string-valued global slot
pub(crate) fn take_slot(context: &mut Context, slot: &str) -> Result<Option<String>, String> {
    let value = eval(
        context,
        &format!(
            "(function () {{ const v = globalThis.{0}; globalThis.{0} = undefined; return v; }})()",
            slot
        ),
    )?;
    if value.is_undefined() {
        return Ok(None);
    }
    value
        .to_string(context)
        .map(|s| Some(s.to_std_string_escaped()))
        .map_err(|e| e.to_string())
}

/// The snippet as an async function taking the console, fetch and each declared binding.
///
/// The body sits in its own block so snippets may redeclare a binding name
/// with `let`/`const`.
pub(crate) fn snippet_function(code: &str, declared: &[String]) -> String {
    let mut params = vec!["console".to_string(), "fetch".to_string()];
    params.extend(declared.iter().cloned());
    format!("(async function ({}) {{\n{{\n{}\n}}\n}})", params.join(", "), code)
}

fn snippet_arguments(console: &str, env: &str, declared: &[String]) -> String {
    let mut args = vec![console.to_string(), "globalThis.fetch".to_string()];
    args.extend(
        declared
            .iter()
            .map(|name| format!("{}[{}]", env, js_literal(name))),
    );
    args.join(", ")
}

/// Script that runs a snippet once and settles its outcome into [`OUTCOME_SLOT`]
pub(crate) fn fallback_script(code: &str, declared: &[String]) -> String {
    format!(
        "globalThis.__evalkit.settle({}({}), {});",
        snippet_function(code, declared),
        snippet_arguments("globalThis.console", "globalThis.__evalkit_env", declared),
        js_literal(OUTCOME_SLOT)
    )
}

/// Main-module expression for an isolate that runs a snippet per fetch.
///
/// Console output is collected per request and returned in the response body
/// alongside the outcome. The snippet is compiled inside the handler so a
/// syntax error surfaces as a failed evaluation, not a failed load.
pub(crate) fn isolate_entry_module(code: &str, declared: &[String]) -> String {
    format!(
        r#"({{
    async fetch(request, env) {{
        const logs = [];
        const console = globalThis.__evalkit.capturingConsole(logs);
        let body;
        try {{
            const run = (0, eval)({run});
            const value = await run({args});
            body = globalThis.__evalkit.envelopeOk(value, logs);
        }} catch (error) {{
            body = globalThis.__evalkit.envelopeErr(error, logs);
        }}
        return new Response(body, {{ headers: {{ 'content-type': 'application/json' }} }});
    }}
}})"#,
        run = js_literal(&snippet_function(code, declared)),
        args = snippet_arguments("console", "env", declared),
    )
}
