//! Execution-path selection and the per-evaluation phase machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an evaluation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    /// Inside an isolate provided by the configured platform
    Isolate,
    /// On an in-process interpreter thread, no isolation boundary
    Fallback,
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionPath::Isolate => "isolate",
            ExecutionPath::Fallback => "fallback",
        })
    }
}

/// Path selection decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
    pub path: ExecutionPath,

    /// Reason for selection
    pub reason: String,
}

/// Choose the execution path.
///
/// An isolate is used whenever a platform is configured, regardless of the
/// security policy; `prefer_isolates = false` forces the fallback.
pub fn select_path(platform: Option<&str>, prefer_isolates: bool) -> DispatchDecision {
    match platform {
        Some(name) if prefer_isolates => DispatchDecision {
            path: ExecutionPath::Isolate,
            reason: format!("isolation platform '{}' is configured", name),
        },
        Some(name) => DispatchDecision {
            path: ExecutionPath::Fallback,
            reason: format!("isolates disabled by configuration (platform '{}' unused)", name),
        },
        None => DispatchDecision {
            path: ExecutionPath::Fallback,
            reason: "no isolation platform configured".to_string(),
        },
    }
}

/// Lifecycle of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPhase {
    Idle,
    Dispatching,
    IsolateExec,
    FallbackExec,
    Normalizing,
    Done,
    Failed,
}

impl EvaluationPhase {
    pub fn can_transition_to(self, next: EvaluationPhase) -> bool {
        use EvaluationPhase::*;
        matches!(
            (self, next),
            (Idle, Dispatching)
                | (Dispatching, IsolateExec)
                | (Dispatching, FallbackExec)
                | (IsolateExec, Normalizing)
                | (FallbackExec, Normalizing)
                | (Normalizing, Done)
                | (Dispatching | IsolateExec | FallbackExec | Normalizing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EvaluationPhase::Done | EvaluationPhase::Failed)
    }
}

/// Tracks and logs phase transitions for one evaluation
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    evaluation_id: String,
    phase: EvaluationPhase,
}

impl PhaseTracker {
    pub fn new(evaluation_id: impl Into<String>) -> Self {
        Self {
            evaluation_id: evaluation_id.into(),
            phase: EvaluationPhase::Idle,
        }
    }

    pub fn advance(&mut self, next: EvaluationPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        tracing::debug!(
            evaluation_id = %self.evaluation_id,
            from = ?self.phase,
            to = ?next,
            "Evaluation phase"
        );
        self.phase = next;
    }

    pub fn current(&self) -> EvaluationPhase {
        self.phase
    }
}
