//! Folding raw execution outcomes into [`EvaluationResult`]

use crate::error::{Result, SandboxError};
use crate::types::{ConsoleEntry, ErrorInfo, EvaluationResult};
use serde::Deserialize;
use serde_json::Value;
use std::time::Instant;

/// Settled outcome as reported from inside an interpreter
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Envelope {
    pub ok: bool,
    #[serde(default, deserialize_with = "present")]
    pub value: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub console: Vec<ConsoleEntry>,
}

// Distinguishes `null` (returned) from a missing field (`undefined`)
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SandboxError::Platform(format!("Malformed outcome envelope: {}", e)))
    }

    /// The value on success, the thrown error otherwise
    pub fn into_result(self) -> Result<Option<Value>> {
        if self.ok {
            return Ok(self.value);
        }
        let message = self
            .message
            .unwrap_or_else(|| self.name.unwrap_or_else(|| "Error".to_string()));
        Err(SandboxError::Execution {
            message,
            stack: self.stack,
        })
    }
}

/// How an evaluation ended, before normalization
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The snippet settled; `console` is output gathered outside the envelope
    Settled {
        envelope: Envelope,
        console: Vec<ConsoleEntry>,
    },
    /// The snippet could not be run or failed outside the harness
    Failed {
        error: SandboxError,
        console: Vec<ConsoleEntry>,
    },
    TimedOut {
        timeout_ms: u64,
        console: Vec<ConsoleEntry>,
    },
}

fn error_info(error: SandboxError) -> ErrorInfo {
    match error {
        SandboxError::Execution { message, stack } => ErrorInfo { message, stack },
        other => ErrorInfo {
            message: other.to_string(),
            stack: None,
        },
    }
}

/// Build the caller-facing result
pub(crate) fn normalize(outcome: Outcome, started: Instant) -> EvaluationResult {
    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Outcome::Settled {
            mut envelope,
            console,
        } => {
            let mut console_output = console;
            console_output.append(&mut envelope.console);
            match envelope.into_result() {
                Ok(result) => EvaluationResult {
                    success: true,
                    // `undefined` does not survive JSON; absent stays absent
                    result,
                    error: None,
                    console_output,
                    duration_ms,
                },
                Err(error) => EvaluationResult {
                    success: false,
                    result: None,
                    error: Some(error_info(error)),
                    console_output,
                    duration_ms,
                },
            }
        }
        Outcome::Failed { error, console } => EvaluationResult {
            success: false,
            result: None,
            error: Some(error_info(error)),
            console_output: console,
            duration_ms,
        },
        Outcome::TimedOut {
            timeout_ms,
            console,
        } => EvaluationResult {
            success: false,
            result: None,
            error: Some(error_info(SandboxError::Timeout { timeout_ms })),
            console_output: console,
            duration_ms,
        },
    }
}
