//! Error taxonomy for the evaluation engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Engine errors.
///
/// `IsolationUnavailable`, `NotLoaded` and the binding/config variants are
/// programmer errors and are returned to the caller as `Err`. `Execution` and
/// `Timeout` describe a misbehaving snippet; the evaluator folds them into
/// [`crate::EvaluationResult`] instead of returning them.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// An isolate was requested but no hosting platform is configured
    #[error("No isolation platform is configured")]
    IsolationUnavailable,

    /// `execute` was called for an id that was never loaded, or was unloaded
    #[error("Isolate '{0}' is not loaded")]
    NotLoaded(String),

    /// The snippet threw
    #[error("{message}")]
    Execution {
        message: String,
        stack: Option<String>,
    },

    /// Wall-clock budget exceeded
    #[error("Execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A binding was dropped by the allow-list (logged, never returned from `evaluate`)
    #[error("Binding '{0}' is not on the allow-list")]
    BindingRejected(String),

    /// A binding name collides with an identifier the engine installs itself
    #[error("Binding name '{0}' is reserved")]
    ReservedBinding(String),

    /// A binding name is not a valid identifier
    #[error("Binding name '{0}' is not a valid identifier")]
    InvalidBindingName(String),

    /// The hosting platform failed to materialize or drive an isolate
    #[error("Isolation platform error: {0}")]
    Platform(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl SandboxError {
    /// Build an execution error from a message
    pub fn execution(message: impl Into<String>) -> Self {
        SandboxError::Execution {
            message: message.into(),
            stack: None,
        }
    }

    /// Whether this error belongs to the class that `evaluate` returns as `Err`
    pub fn is_programmer_error(&self) -> bool {
        !matches!(
            self,
            SandboxError::Execution { .. } | SandboxError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        SandboxError::Io(e.to_string())
    }
}
