//! In-process fallback executor
//!
//! Runs a snippet on a fresh interpreter in a dedicated thread. There is no
//! isolation boundary beyond the interpreter itself: bindings are the only
//! route to host capabilities.

use crate::bindings::PreparedBindings;
use crate::error::{Result, SandboxError};
use crate::limits::ResourceLimits;
use crate::normalize::Envelope;
use crate::runtime::{self, ConsoleSink, OUTCOME_SLOT};
use crate::types::ConsoleEntry;
use boa_engine::Context;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// One snippet run
#[derive(Debug)]
pub struct FallbackJob {
    /// Evaluation id, used in logs and the thread name
    pub id: String,
    /// Plain script body (types already stripped)
    pub code: String,
    pub bindings: PreparedBindings,
    pub limits: ResourceLimits,
}

/// A started run
#[derive(Debug)]
pub struct FallbackRun {
    console: Arc<Mutex<Vec<ConsoleEntry>>>,
    outcome: oneshot::Receiver<Result<Envelope>>,
}

impl FallbackRun {
    /// Console output written so far
    pub fn console_snapshot(&self) -> Vec<ConsoleEntry> {
        self.console
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Wait for the snippet to settle
    pub(crate) async fn outcome(&mut self) -> Result<Envelope> {
        (&mut self.outcome).await.map_err(|_| {
            SandboxError::execution("Fallback executor terminated without reporting an outcome")
        })?
    }
}

/// Spawns interpreter threads for fallback runs
#[derive(Debug, Clone, Default)]
pub struct FallbackExecutor;

impl FallbackExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Start a job on its own thread.
    ///
    /// The thread is detached: a caller that stops waiting (timeout) leaves it
    /// running until the snippet finishes or hits its loop budget.
    pub fn spawn(&self, job: FallbackJob) -> Result<FallbackRun> {
        let console = Arc::new(Mutex::new(Vec::new()));
        let (sender, outcome) = oneshot::channel();
        let sink = ConsoleSink::Capture(console.clone());
        let label: String = job
            .id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .take(24)
            .collect();

        std::thread::Builder::new()
            .name(format!("evalkit-fallback-{}", label))
            .spawn(move || {
                let id = job.id.clone();
                let result = run_job(job, sink);
                if sender.send(result).is_err() {
                    tracing::debug!(evaluation_id = %id, "Fallback outcome arrived after caller gave up");
                }
            })?;

        Ok(FallbackRun { console, outcome })
    }
}

fn run_job(job: FallbackJob, sink: ConsoleSink) -> Result<Envelope> {
    if job.limits.has_advisory_memory_budget() {
        tracing::warn!(
            evaluation_id = %job.id,
            memory_budget_mb = ?job.limits.memory_budget_mb,
            "Memory budget is advisory in fallback mode"
        );
    }

    let declared = job.bindings.declared_names().to_vec();
    let mut context = Context::default();
    runtime::install(&mut context, job.bindings, sink, &job.limits).map_err(SandboxError::Platform)?;

    runtime::eval(&mut context, &runtime::fallback_script(&job.code, &declared))
        .map_err(SandboxError::execution)?;
    runtime::run_jobs(&mut context, &job.id);

    match runtime::take_slot(&mut context, OUTCOME_SLOT).map_err(SandboxError::execution)? {
        Some(text) => Envelope::parse(&text),
        None => Err(SandboxError::execution(
            "Evaluation did not settle: the snippet awaited a promise that never resolved or exceeded its resource limits",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConsoleLevel;
    use serde_json::json;

    fn job(code: &str) -> FallbackJob {
        FallbackJob {
            id: "test".into(),
            code: code.into(),
            bindings: PreparedBindings::empty(),
            limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn test_runs_snippet() {
        let mut run = FallbackExecutor::new().spawn(job("return [1, 2].map(x => x * 2);")).unwrap();
        let envelope = run.outcome().await.unwrap();
        assert_eq!(envelope.into_result().unwrap(), Some(json!([2, 4])));
    }

    #[tokio::test]
    async fn test_console_is_buffered() {
        let mut run = FallbackExecutor::new()
            .spawn(job("console.log('one'); console.error('two');"))
            .unwrap();
        run.outcome().await.unwrap();
        let console = run.console_snapshot();
        assert_eq!(console.len(), 2);
        assert_eq!(console[1].level, ConsoleLevel::Error);
    }

    #[tokio::test]
    async fn test_syntax_error_is_execution_error() {
        let mut run = FallbackExecutor::new().spawn(job("return (;")).unwrap();
        let err = run.outcome().await.unwrap_err();
        assert!(matches!(err, SandboxError::Execution { .. }));
    }

    #[tokio::test]
    async fn test_never_settling_promise() {
        let mut run = FallbackExecutor::new()
            .spawn(job("await new Promise(() => {}); return 1;"))
            .unwrap();
        let err = run.outcome().await.unwrap_err();
        assert!(err.to_string().starts_with("Evaluation did not settle"));
    }
}
