//! Isolates backed by dedicated interpreter threads
//!
//! Each isolate owns one OS thread holding its interpreter context. Invocations
//! arrive over a bounded channel and are served one at a time, so calls to the
//! same isolate are serialized. Dropping every handle closes the channel and
//! the thread exits after its current invocation.

use super::{
    ConfigFactory, Invocation, InvocationReply, IsolateConfig, IsolateInstance, IsolationPlatform,
};
use crate::error::{Result, SandboxError};
use crate::normalize::Envelope;
use crate::runtime::{self, ConsoleSink, REPLY_SLOT};
use async_trait::async_trait;
use boa_engine::Context;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const DEFAULT_QUEUE_DEPTH: usize = 32;

/// Isolation platform running each isolate on its own thread
#[derive(Debug, Clone)]
pub struct ThreadIsolatePlatform {
    queue_depth: usize,
}

impl ThreadIsolatePlatform {
    pub fn new() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Pending invocations an isolate accepts before callers wait
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self
    }
}

impl Default for ThreadIsolatePlatform {
    fn default() -> Self {
        Self::new()
    }
}

struct Command {
    invocation: Invocation,
    reply: oneshot::Sender<Result<InvocationReply>>,
}

struct ThreadIsolate {
    id: String,
    sender: mpsc::Sender<Command>,
}

#[async_trait]
impl IsolateInstance for ThreadIsolate {
    async fn invoke(&self, invocation: Invocation) -> Result<InvocationReply> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(Command { invocation, reply })
            .await
            .map_err(|_| SandboxError::Platform(format!("Isolate '{}' has shut down", self.id)))?;
        receiver.await.map_err(|_| {
            SandboxError::Platform(format!("Isolate '{}' dropped the invocation", self.id))
        })?
    }
}

#[async_trait]
impl IsolationPlatform for ThreadIsolatePlatform {
    async fn get(&self, id: &str, factory: ConfigFactory) -> Result<Arc<dyn IsolateInstance>> {
        let config = factory();
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        let (ready_tx, ready_rx) = oneshot::channel();
        let isolate_id = id.to_string();
        let thread_label: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(24)
            .collect();

        std::thread::Builder::new()
            .name(format!("evalkit-isolate-{}", thread_label))
            .spawn(move || isolate_main(isolate_id, config, receiver, ready_tx))?;

        ready_rx.await.map_err(|_| {
            SandboxError::Platform(format!("Isolate '{}' exited during startup", id))
        })??;

        tracing::debug!(isolate_id = %id, "Isolate thread started");
        Ok(Arc::new(ThreadIsolate {
            id: id.to_string(),
            sender,
        }))
    }

    fn name(&self) -> &str {
        "thread"
    }
}

fn isolate_main(
    id: String,
    config: IsolateConfig,
    mut receiver: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut context = Context::default();
    if let Err(e) = boot(&mut context, &id, config) {
        let _ = ready.send(Err(e));
        return;
    }
    if ready.send(Ok(())).is_err() {
        return;
    }

    while let Some(command) = receiver.blocking_recv() {
        let result = dispatch(&mut context, &id, command.invocation);
        if command.reply.send(result).is_err() {
            tracing::debug!(isolate_id = %id, "Invocation caller went away");
        }
    }
    tracing::debug!(isolate_id = %id, "Isolate thread exiting");
}

fn boot(context: &mut Context, id: &str, config: IsolateConfig) -> Result<()> {
    if config.limits.has_advisory_memory_budget() {
        tracing::warn!(
            isolate_id = %id,
            memory_budget_mb = ?config.limits.memory_budget_mb,
            "Memory budget is advisory on this platform"
        );
    }
    tracing::debug!(
        isolate_id = %id,
        compatibility_date = %config.compatibility_date,
        compatibility_flags = ?config.compatibility_flags,
        modules = config.modules.len(),
        "Booting isolate"
    );

    let main = config
        .main_source()
        .ok_or_else(|| {
            SandboxError::Platform(format!(
                "Main module '{}' is missing from the module map",
                config.main_module
            ))
        })?
        .to_string();

    runtime::install(
        context,
        config.bindings,
        ConsoleSink::Trace {
            isolate_id: id.to_string(),
        },
        &config.limits,
    )
    .map_err(SandboxError::Platform)?;

    for (path, source) in config
        .modules
        .iter()
        .filter(|(path, _)| **path != config.main_module)
    {
        runtime::eval(context, source).map_err(|e| {
            SandboxError::Platform(format!("Failed to evaluate module '{}': {}", path, e))
        })?;
    }

    runtime::eval(context, &format!("globalThis.__evalkit_entry = (\n{}\n);", main)).map_err(
        |e| {
            SandboxError::Platform(format!(
                "Failed to evaluate module '{}': {}",
                config.main_module, e
            ))
        },
    )?;
    runtime::run_jobs(context, id);
    Ok(())
}

fn dispatch(context: &mut Context, id: &str, invocation: Invocation) -> Result<InvocationReply> {
    let script = match &invocation {
        Invocation::Request(request) => {
            let payload = serde_json::to_string(request)
                .map_err(|e| SandboxError::Platform(format!("Failed to encode request: {}", e)))?;
            format!(
                "globalThis.__evalkit.dispatchFetch({});",
                runtime::js_literal(&payload)
            )
        }
        Invocation::Method { name, args } => format!(
            "globalThis.__evalkit.dispatchMethod({}, {});",
            runtime::js_literal(name),
            runtime::js_literal(&Value::Array(args.clone()).to_string())
        ),
    };

    runtime::eval(context, &script).map_err(SandboxError::execution)?;
    runtime::run_jobs(context, id);
    let reply = runtime::take_slot(context, REPLY_SLOT)
        .map_err(SandboxError::execution)?
        .ok_or_else(|| SandboxError::execution("Invocation did not settle"))?;
    let value = Envelope::parse(&reply)?.into_result()?;

    match invocation {
        Invocation::Request(_) => {
            let response = serde_json::from_value(value.unwrap_or(Value::Null)).map_err(|e| {
                SandboxError::Platform(format!("Malformed isolate response: {}", e))
            })?;
            Ok(InvocationReply::Response(response))
        }
        Invocation::Method { .. } => Ok(InvocationReply::Value(value.unwrap_or(Value::Null))),
    }
}
