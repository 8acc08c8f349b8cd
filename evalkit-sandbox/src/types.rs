//! Core types for snippet evaluation

use crate::bindings::BindingSet;
use crate::db::DbContext;
use crate::policy::SecurityPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// What kind of source a snippet is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Plain script
    Script,
    /// Script with type annotations (stripped before execution)
    TypedScript,
    /// Code already extracted from a rich document
    RichDocument,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Script => "script",
            SourceKind::TypedScript => "typescript",
            SourceKind::RichDocument => "document",
        }
    }
}

/// A snippet submitted for evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Caller-supplied or generated identifier
    pub id: String,

    /// The code to evaluate
    pub code: String,

    pub kind: SourceKind,
}

impl SourceUnit {
    /// Create a unit with a generated id
    pub fn new(code: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: format!("src-{}", uuid::Uuid::new_v4()),
            code: code.into(),
            kind,
        }
    }

    pub fn script(code: impl Into<String>) -> Self {
        Self::new(code, SourceKind::Script)
    }

    pub fn typed(code: impl Into<String>) -> Self {
        Self::new(code, SourceKind::TypedScript)
    }

    pub fn document(code: impl Into<String>) -> Self {
        Self::new(code, SourceKind::RichDocument)
    }

    /// Replace the generated id with a caller-supplied one
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Per-call evaluation options
#[derive(Clone, Default)]
pub struct EvaluateOptions {
    /// Document store exposed to the snippet as `db`
    pub db: Option<Arc<dyn DbContext>>,

    /// Capability bindings visible to the snippet
    pub bindings: BindingSet,

    /// Wall-clock budget (None = engine default)
    pub timeout_ms: Option<u64>,

    /// Security policy (None = engine default)
    pub security: Option<SecurityPolicy>,

    /// Isolate id to load or reuse; when absent the isolate is per-call
    pub worker_id: Option<String>,
}

impl EvaluateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_db(mut self, db: Arc<dyn DbContext>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_bindings(mut self, bindings: BindingSet) -> Self {
        self.bindings = bindings;
        self
    }

    /// Set timeout in milliseconds
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_security(mut self, security: SecurityPolicy) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

impl std::fmt::Debug for EvaluateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluateOptions")
            .field("db", &self.db.as_ref().map(|db| db.is_read_only()))
            .field("bindings", &self.bindings.names().collect::<Vec<_>>())
            .field("timeout_ms", &self.timeout_ms)
            .field("security", &self.security)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Console method a line was written with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

impl ConsoleLevel {
    /// Map a console method name; `info` and `debug` fold into `log`
    pub fn from_method(method: &str) -> Self {
        match method {
            "warn" => ConsoleLevel::Warn,
            "error" => ConsoleLevel::Error,
            _ => ConsoleLevel::Log,
        }
    }
}

/// One captured console line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    #[serde(rename = "type")]
    pub level: ConsoleLevel,
    pub text: String,
}

impl ConsoleEntry {
    pub fn new(level: ConsoleLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

/// Error reported by a failed evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub success: bool,

    /// The snippet's return value, if it returned a serializable value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    #[serde(default)]
    pub console_output: Vec<ConsoleEntry>,

    pub duration_ms: u64,
}

impl EvaluationResult {
    /// Check if evaluation timed out
    pub fn timed_out(&self) -> bool {
        self.error
            .as_ref()
            .map(|e| e.message.starts_with("Execution timed out after"))
            .unwrap_or(false)
    }
}
