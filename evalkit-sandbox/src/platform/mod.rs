//! Isolation platform abstraction
//!
//! A platform materializes isolated units (isolates) from a lazily built
//! [`IsolateConfig`] and hands back an [`IsolateInstance`] that can be invoked
//! over a request/response channel or by method name.

mod thread;

pub use thread::ThreadIsolatePlatform;

use crate::bindings::PreparedBindings;
use crate::error::Result;
use crate::limits::ResourceLimits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default compatibility date stamped on new isolates
pub const DEFAULT_COMPATIBILITY_DATE: &str = "2024-01-01";

/// Everything a platform needs to create one isolate
#[derive(Debug, Clone)]
pub struct IsolateConfig {
    pub compatibility_date: String,
    pub compatibility_flags: Vec<String>,
    /// Path of the module whose value is the isolate's entry object
    pub main_module: String,
    /// Module path → source
    pub modules: BTreeMap<String, String>,
    pub bindings: PreparedBindings,
    pub limits: ResourceLimits,
}

impl IsolateConfig {
    /// Single-module isolate
    pub fn new(main_module: impl Into<String>, source: impl Into<String>) -> Self {
        let main_module = main_module.into();
        let mut modules = BTreeMap::new();
        modules.insert(main_module.clone(), source.into());
        Self {
            compatibility_date: DEFAULT_COMPATIBILITY_DATE.to_string(),
            compatibility_flags: Vec::new(),
            main_module,
            modules,
            bindings: PreparedBindings::empty(),
            limits: ResourceLimits::default(),
        }
    }

    /// Add a supporting module, evaluated before the main module
    pub fn with_module(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.modules.insert(path.into(), source.into());
        self
    }

    pub fn with_bindings(mut self, bindings: PreparedBindings) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_compatibility(mut self, date: impl Into<String>, flags: Vec<String>) -> Self {
        self.compatibility_date = date.into();
        self.compatibility_flags = flags;
        self
    }

    pub fn main_source(&self) -> Option<&str> {
        self.modules.get(&self.main_module).map(String::as_str)
    }
}

/// Lazily builds a config; only called when the isolate is actually created
pub type ConfigFactory = Box<dyn FnOnce() -> IsolateConfig + Send>;

/// Request delivered to an isolate's `fetch` handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolateRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl IsolateRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// POST with a JSON body
    pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers,
            body: Some(body.to_string()),
        }
    }
}

/// Response produced by an isolate's `fetch` handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolateResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl IsolateResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.body).map_err(|e| {
            crate::error::SandboxError::execution(format!("Response body is not JSON: {}", e))
        })
    }
}

/// How an isolate is driven
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Call the entry's `fetch(request, env)` handler
    Request(IsolateRequest),
    /// Call a named method on the entry object
    Method { name: String, args: Vec<Value> },
}

impl Invocation {
    pub fn method(name: impl Into<String>, args: Vec<Value>) -> Self {
        Invocation::Method {
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationReply {
    Response(IsolateResponse),
    Value(Value),
}

/// A live isolate
#[async_trait]
pub trait IsolateInstance: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<InvocationReply>;
}

/// Capability that can materialize isolates
#[async_trait]
pub trait IsolationPlatform: Send + Sync {
    /// Create the isolate for `id` from the factory's config.
    ///
    /// Callers deduplicate by id; the platform may assume each call wants a
    /// fresh isolate.
    async fn get(&self, id: &str, factory: ConfigFactory) -> Result<Arc<dyn IsolateInstance>>;

    /// Platform name for logs
    fn name(&self) -> &str;
}
