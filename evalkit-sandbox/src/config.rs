//! Engine configuration

use crate::error::{Result, SandboxError};
use crate::platform::DEFAULT_COMPATIBILITY_DATE;
use crate::policy::SecurityPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Evaluation defaults
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Settings stamped on every isolate
    #[serde(default)]
    pub isolate: IsolateSettings,
    /// Policy used when a call does not supply one
    #[serde(default)]
    pub security: SecurityPolicy,
}

/// Evaluation defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Wall-clock timeout when the caller does not set one
    #[serde(default = "EvaluationConfig::default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Use the isolation platform when one is configured
    #[serde(default = "EvaluationConfig::default_prefer_isolates")]
    pub prefer_isolates: bool,
}

impl EvaluationConfig {
    fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_prefer_isolates() -> bool {
        true
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            default_timeout: Self::default_timeout(),
            prefer_isolates: Self::default_prefer_isolates(),
        }
    }
}

/// Isolate compatibility settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolateSettings {
    #[serde(default = "IsolateSettings::default_compatibility_date")]
    pub compatibility_date: String,
    #[serde(default)]
    pub compatibility_flags: Vec<String>,
}

impl IsolateSettings {
    fn default_compatibility_date() -> String {
        DEFAULT_COMPATIBILITY_DATE.to_string()
    }
}

impl Default for IsolateSettings {
    fn default() -> Self {
        Self {
            compatibility_date: Self::default_compatibility_date(),
            compatibility_flags: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SandboxError::Config(format!("Failed to serialize config: {}", e)))
    }

    pub fn default_timeout_ms(&self) -> u64 {
        self.evaluation.default_timeout.as_millis() as u64
    }
}
