//! Capability bindings injected into a snippet's scope

use crate::db::DbContext;
use crate::error::{Result, SandboxError};
use crate::fetch::{Fetcher, PolicyFetcher};
use crate::policy::SecurityPolicy;
use serde_json::Value;
use std::sync::Arc;

/// Host function callable from a snippet.
///
/// Arguments and the return value cross the sandbox boundary as JSON. An `Err`
/// is thrown inside the snippet as an `Error` with that message.
pub type HostFunction = Arc<dyn Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync>;

/// Identifiers the engine installs itself
const RESERVED: &[&str] = &[
    "console", "fetch", "globalThis", "undefined", "NaN", "Infinity", "arguments", "eval",
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for",
    "function", "if", "implements", "import", "in", "instanceof", "interface", "let", "new",
    "null", "package", "private", "protected", "public", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with",
    "yield",
];

/// Prefix of every engine-internal global
pub(crate) const INTERNAL_PREFIX: &str = "__evalkit";

/// A value that can be injected
#[derive(Clone)]
pub enum BindingValue {
    /// Plain data, copied into the snippet
    Data(Value),
    /// Host function
    Function(HostFunction),
    /// Document-store handle
    Db(Arc<dyn DbContext>),
}

impl BindingValue {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        BindingValue::Function(Arc::new(f))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BindingValue::Data(_) => "data",
            BindingValue::Function(_) => "function",
            BindingValue::Db(_) => "db",
        }
    }
}

impl std::fmt::Debug for BindingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingValue::Data(value) => f.debug_tuple("Data").field(value).finish(),
            BindingValue::Function(_) => f.write_str("Function(..)"),
            BindingValue::Db(db) => f
                .debug_struct("Db")
                .field("read_only", &db.is_read_only())
                .finish(),
        }
    }
}

/// Check that a name can be bound as a free variable
pub fn validate_binding_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        }
        _ => false,
    };
    if !valid {
        return Err(SandboxError::InvalidBindingName(name.to_string()));
    }
    if RESERVED.contains(&name) || name.starts_with(INTERNAL_PREFIX) {
        return Err(SandboxError::ReservedBinding(name.to_string()));
    }
    Ok(())
}

/// Ordered name → value mapping
#[derive(Debug, Clone, Default)]
pub struct BindingSet {
    entries: Vec<(String, BindingValue)>,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a binding; an existing name keeps its position and returns the old value
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: BindingValue,
    ) -> Result<Option<BindingValue>> {
        let name = name.into();
        validate_binding_name(&name)?;
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            return Ok(Some(std::mem::replace(&mut slot.1, value)));
        }
        self.entries.push((name, value));
        Ok(None)
    }

    /// Builder form of [`insert`](Self::insert) for plain data
    pub fn data(mut self, name: impl Into<String>, value: Value) -> Result<Self> {
        self.insert(name, BindingValue::Data(value))?;
        Ok(self)
    }

    /// Builder form of [`insert`](Self::insert) for host functions
    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Result<Self>
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.insert(name, BindingValue::function(f))?;
        Ok(self)
    }

    /// Builder form of [`insert`](Self::insert) for document stores
    pub fn db(mut self, name: impl Into<String>, db: Arc<dyn DbContext>) -> Result<Self> {
        self.insert(name, BindingValue::Db(db))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&BindingValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindingValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bindings after policy application, ready to install into an interpreter
#[derive(Clone)]
pub struct PreparedBindings {
    entries: Vec<(String, BindingValue)>,
    declared: Vec<String>,
    fetch: Arc<PolicyFetcher>,
}

impl PreparedBindings {
    /// Merge the `db` option, apply the allow-list and wrap the fetcher.
    ///
    /// Names dropped by the allow-list are logged and skipped; the snippet sees
    /// them as `undefined`.
    pub fn prepare(
        bindings: &BindingSet,
        db: Option<Arc<dyn DbContext>>,
        policy: &SecurityPolicy,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let mut merged = bindings.clone();
        if let Some(db) = db {
            if merged.contains("db") {
                return Err(SandboxError::ReservedBinding("db".to_string()));
            }
            merged.insert("db", BindingValue::Db(db))?;
        }

        let declared = merged.names().map(str::to_string).collect();
        let entries = merged
            .entries
            .into_iter()
            .filter(|(name, _)| {
                let allowed = policy.allows_binding(name);
                if !allowed {
                    let rejection = SandboxError::BindingRejected(name.clone());
                    tracing::warn!(binding = %name, "{}", rejection);
                }
                allowed
            })
            .collect();

        Ok(Self {
            entries,
            declared,
            fetch: Arc::new(PolicyFetcher::new(policy.network.clone(), fetcher)),
        })
    }

    /// No bindings, network blocked
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            declared: Vec::new(),
            fetch: Arc::new(PolicyFetcher::new(
                crate::policy::NetworkPosture::Blocked,
                Arc::new(crate::fetch::HttpFetcher::new()),
            )),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindingValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Every requested name, including ones the allow-list dropped
    pub fn declared_names(&self) -> &[String] {
        &self.declared
    }

    pub(crate) fn entry(&self, index: usize) -> Option<&BindingValue> {
        self.entries.get(index).map(|(_, v)| v)
    }

    pub fn fetcher(&self) -> &Arc<PolicyFetcher> {
        &self.fetch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for PreparedBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedBindings")
            .field("entries", &self.entries)
            .field("declared", &self.declared)
            .field("fetch", &self.fetch)
            .finish()
    }
}
