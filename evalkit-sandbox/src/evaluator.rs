//! Evaluator facade - main entry point

use crate::bindings::PreparedBindings;
use crate::config::EngineConfig;
use crate::dispatch::{select_path, DispatchDecision, EvaluationPhase, ExecutionPath, PhaseTracker};
use crate::document::CompiledDocument;
use crate::error::{Result, SandboxError};
use crate::fallback::{FallbackExecutor, FallbackJob};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::normalize::{normalize, Envelope, Outcome};
use crate::platform::{Invocation, InvocationReply, IsolateConfig, IsolateRequest, IsolationPlatform};
use crate::policy::SecurityPolicy;
use crate::registry::IsolateRegistry;
use crate::runtime;
use crate::types::{EvaluateOptions, EvaluationResult, SourceKind, SourceUnit};
use crate::typescript::strip_types;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main module path of generated evaluation isolates
const MAIN_MODULE: &str = "evaluate.js";

/// URL of the request that triggers an evaluation inside an isolate
const EVALUATE_URL: &str = "https://evalkit.internal/evaluate";

/// Builder for [`Evaluator`]
#[derive(Default)]
pub struct EvaluatorBuilder {
    platform: Option<Arc<dyn IsolationPlatform>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    config: EngineConfig,
}

impl EvaluatorBuilder {
    /// Use an isolation platform; without one every evaluation takes the fallback path
    pub fn platform(mut self, platform: impl IsolationPlatform + 'static) -> Self {
        self.platform = Some(Arc::new(platform));
        self
    }

    pub fn shared_platform(mut self, platform: Arc<dyn IsolationPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Backend for the sandbox `fetch`; defaults to [`HttpFetcher`]
    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    pub fn shared_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Evaluator {
        Evaluator {
            registry: Arc::new(IsolateRegistry::new(self.platform)),
            fetcher: self
                .fetcher
                .unwrap_or_else(|| Arc::new(HttpFetcher::new())),
            fallback: FallbackExecutor::new(),
            config: self.config,
        }
    }
}

/// Sandboxed evaluation entry point
pub struct Evaluator {
    registry: Arc<IsolateRegistry>,
    fetcher: Arc<dyn Fetcher>,
    fallback: FallbackExecutor,
    config: EngineConfig,
}

impl Evaluator {
    pub fn builder() -> EvaluatorBuilder {
        EvaluatorBuilder::default()
    }

    /// Evaluator without an isolation platform
    pub fn local() -> Self {
        Self::builder().build()
    }

    /// Evaluator backed by the given platform
    pub fn with_platform(platform: impl IsolationPlatform + 'static) -> Self {
        Self::builder().platform(platform).build()
    }

    pub fn registry(&self) -> &Arc<IsolateRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Path the next evaluation will take
    pub fn dispatch_decision(&self) -> DispatchDecision {
        select_path(
            self.registry.platform_name(),
            self.config.evaluation.prefer_isolates,
        )
    }

    pub async fn evaluate_script(
        &self,
        source: &str,
        options: EvaluateOptions,
    ) -> Result<EvaluationResult> {
        self.evaluate(&SourceUnit::script(source), options).await
    }

    pub async fn evaluate_typed_script(
        &self,
        source: &str,
        options: EvaluateOptions,
    ) -> Result<EvaluationResult> {
        self.evaluate(&SourceUnit::typed(source), options).await
    }

    /// Evaluate a compiled document; the result is the array of its expression values
    pub async fn evaluate_document(
        &self,
        document: &CompiledDocument,
        options: EvaluateOptions,
    ) -> Result<EvaluationResult> {
        self.evaluate(&SourceUnit::document(document.to_script()), options)
            .await
    }

    /// Evaluate a source unit.
    ///
    /// Snippet failures and timeouts come back as `Ok` with `success: false`.
    /// `Err` is reserved for caller mistakes and platform failures.
    pub async fn evaluate(
        &self,
        unit: &SourceUnit,
        options: EvaluateOptions,
    ) -> Result<EvaluationResult> {
        let started = Instant::now();
        let mut phase = PhaseTracker::new(&unit.id);
        phase.advance(EvaluationPhase::Dispatching);

        let policy = options
            .security
            .clone()
            .unwrap_or_else(|| self.config.security.clone());
        let timeout_ms = options
            .timeout_ms
            .unwrap_or_else(|| self.config.default_timeout_ms());
        let code = match unit.kind {
            SourceKind::TypedScript => match strip_types(&unit.code) {
                Ok(code) => code,
                Err(error) => {
                    tracing::debug!(evaluation_id = %unit.id, error = %error, "Type stripping failed");
                    phase.advance(EvaluationPhase::Failed);
                    return Ok(normalize(
                        Outcome::Failed {
                            error,
                            console: Vec::new(),
                        },
                        started,
                    ));
                }
            },
            SourceKind::Script | SourceKind::RichDocument => unit.code.clone(),
        };

        let bindings = match PreparedBindings::prepare(
            &options.bindings,
            options.db.clone(),
            &policy,
            self.fetcher.clone(),
        ) {
            Ok(bindings) => bindings,
            Err(e) => {
                phase.advance(EvaluationPhase::Failed);
                return Err(e);
            }
        };

        let decision = self.dispatch_decision();
        tracing::info!(
            evaluation_id = %unit.id,
            kind = unit.kind.as_str(),
            path = %decision.path,
            reason = %decision.reason,
            timeout_ms,
            "Evaluating snippet"
        );

        let outcome = match decision.path {
            ExecutionPath::Isolate => {
                phase.advance(EvaluationPhase::IsolateExec);
                self.run_isolated(unit, code, bindings, &policy, options.worker_id.as_deref(), timeout_ms)
                    .await
            }
            ExecutionPath::Fallback => {
                phase.advance(EvaluationPhase::FallbackExec);
                self.run_fallback(unit, code, bindings, &policy, timeout_ms)
                    .await
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(evaluation_id = %unit.id, error = %e, "Evaluation aborted");
                phase.advance(EvaluationPhase::Failed);
                return Err(e);
            }
        };

        let timed_out = matches!(outcome, Outcome::TimedOut { .. });
        phase.advance(if timed_out {
            EvaluationPhase::Failed
        } else {
            EvaluationPhase::Normalizing
        });
        let result = normalize(outcome, started);
        if !timed_out {
            phase.advance(EvaluationPhase::Done);
        }

        tracing::debug!(
            evaluation_id = %unit.id,
            success = result.success,
            phase = ?phase.current(),
            duration_ms = result.duration_ms,
            console_lines = result.console_output.len(),
            "Evaluation finished"
        );
        Ok(result)
    }

    async fn run_isolated(
        &self,
        unit: &SourceUnit,
        code: String,
        bindings: PreparedBindings,
        policy: &SecurityPolicy,
        worker_id: Option<&str>,
        timeout_ms: u64,
    ) -> Result<Outcome> {
        // Without a worker id the isolate lives for this call only, under a key
        // no caller-chosen id can collide with
        let (isolate_id, ephemeral) = match worker_id {
            Some(id) => (id.to_string(), false),
            None => (format!("{}#{}", unit.id, uuid::Uuid::new_v4()), true),
        };

        let settings = self.config.isolate.clone();
        let limits = policy.limits();
        let handle = self
            .registry
            .load_with(&isolate_id, move || {
                let module = runtime::isolate_entry_module(&code, bindings.declared_names());
                IsolateConfig::new(MAIN_MODULE, module)
                    .with_compatibility(settings.compatibility_date, settings.compatibility_flags)
                    .with_bindings(bindings)
                    .with_limits(limits)
            })
            .await?;

        let request = IsolateRequest::post_json(EVALUATE_URL, &json!({ "id": unit.id }));
        let reply = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            handle.invoke(Invocation::Request(request)),
        )
        .await;

        if ephemeral {
            self.registry.unload(&isolate_id).await;
        }

        match reply {
            Err(_) => {
                tracing::warn!(evaluation_id = %unit.id, isolate_id = %isolate_id, timeout_ms, "Isolate evaluation timed out");
                Ok(Outcome::TimedOut {
                    timeout_ms,
                    console: Vec::new(),
                })
            }
            Ok(Ok(InvocationReply::Response(response))) => Ok(Outcome::Settled {
                envelope: Envelope::parse(&response.body)?,
                console: Vec::new(),
            }),
            Ok(Ok(InvocationReply::Value(_))) => Err(SandboxError::Platform(
                "Isolate answered a request with a method reply".to_string(),
            )),
            Ok(Err(error)) if error.is_programmer_error() => Err(error),
            Ok(Err(error)) => Ok(Outcome::Failed {
                error,
                console: Vec::new(),
            }),
        }
    }

    async fn run_fallback(
        &self,
        unit: &SourceUnit,
        code: String,
        bindings: PreparedBindings,
        policy: &SecurityPolicy,
        timeout_ms: u64,
    ) -> Result<Outcome> {
        let mut run = self.fallback.spawn(FallbackJob {
            id: unit.id.clone(),
            code,
            bindings,
            limits: policy.limits(),
        })?;

        let settled = tokio::time::timeout(Duration::from_millis(timeout_ms), run.outcome()).await;
        match settled {
            Err(_) => {
                tracing::warn!(evaluation_id = %unit.id, timeout_ms, "Fallback evaluation timed out");
                Ok(Outcome::TimedOut {
                    timeout_ms,
                    console: run.console_snapshot(),
                })
            }
            Ok(Ok(envelope)) => Ok(Outcome::Settled {
                envelope,
                console: run.console_snapshot(),
            }),
            Ok(Err(error)) if error.is_programmer_error() => Err(error),
            Ok(Err(error)) => Ok(Outcome::Failed {
                error,
                console: run.console_snapshot(),
            }),
        }
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
