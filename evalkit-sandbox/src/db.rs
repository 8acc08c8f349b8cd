//! Document-store capability exposed to snippets as `db`

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// A stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Document store is read-only")]
    ReadOnly,

    #[error("Invalid pattern '{0}'")]
    InvalidPattern(String),

    #[error("Document store error: {0}")]
    Backend(String),
}

/// Capability-scoped handle over an external document store.
///
/// Methods are synchronous: they are called from interpreter threads, never
/// from async tasks.
pub trait DbContext: Send + Sync {
    /// List documents whose id matches a glob pattern (`*`, `?`); all when None
    fn list(&self, pattern: Option<&str>) -> Result<Vec<Document>, DbError>;

    /// Fetch one document's data
    fn get(&self, id: &str) -> Result<Option<Value>, DbError>;

    /// Create or replace a document
    fn set(&self, _id: &str, _data: Value) -> Result<(), DbError> {
        Err(DbError::ReadOnly)
    }

    /// Delete documents matching a glob pattern, returning how many were removed
    fn delete(&self, _pattern: &str) -> Result<usize, DbError> {
        Err(DbError::ReadOnly)
    }

    /// Read-only contexts are exposed without `set`/`delete`
    fn is_read_only(&self) -> bool {
        false
    }
}

/// Compile a glob pattern into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex, DbError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    expr.push_str(&regex::escape(&literal));
    expr.push('$');
    Regex::new(&expr).map_err(|_| DbError::InvalidPattern(pattern.to_string()))
}

/// In-memory document store ordered by id
#[derive(Debug, Default)]
pub struct MemoryDb {
    documents: RwLock<BTreeMap<String, Value>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from documents
    pub fn from_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        let map = documents.into_iter().map(|d| (d.id, d.data)).collect();
        Self {
            documents: RwLock::new(map),
        }
    }

    /// Seed a store from a JSON object keyed by document id
    pub fn from_json(value: Value) -> Result<Self, DbError> {
        match value {
            Value::Object(map) => Ok(Self {
                documents: RwLock::new(map.into_iter().collect()),
            }),
            other => Err(DbError::Backend(format!(
                "expected a JSON object of documents, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wrap in a read-only view
    pub fn read_only(self: Arc<Self>) -> ReadOnlyDb<Arc<MemoryDb>> {
        ReadOnlyDb::new(self)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn poisoned() -> DbError {
    DbError::Backend("document store lock poisoned".to_string())
}

impl DbContext for MemoryDb {
    fn list(&self, pattern: Option<&str>) -> Result<Vec<Document>, DbError> {
        let matcher = pattern.map(glob_to_regex).transpose()?;
        let documents = self.documents.read().map_err(|_| poisoned())?;
        Ok(documents
            .iter()
            .filter(|(id, _)| matcher.as_ref().map(|re| re.is_match(id)).unwrap_or(true))
            .map(|(id, data)| Document {
                id: id.clone(),
                data: data.clone(),
            })
            .collect())
    }

    fn get(&self, id: &str) -> Result<Option<Value>, DbError> {
        let documents = self.documents.read().map_err(|_| poisoned())?;
        Ok(documents.get(id).cloned())
    }

    fn set(&self, id: &str, data: Value) -> Result<(), DbError> {
        let mut documents = self.documents.write().map_err(|_| poisoned())?;
        documents.insert(id.to_string(), data);
        Ok(())
    }

    fn delete(&self, pattern: &str) -> Result<usize, DbError> {
        let matcher = glob_to_regex(pattern)?;
        let mut documents = self.documents.write().map_err(|_| poisoned())?;
        let before = documents.len();
        documents.retain(|id, _| !matcher.is_match(id));
        Ok(before - documents.len())
    }
}

impl<D: DbContext + ?Sized> DbContext for Arc<D> {
    fn list(&self, pattern: Option<&str>) -> Result<Vec<Document>, DbError> {
        (**self).list(pattern)
    }

    fn get(&self, id: &str) -> Result<Option<Value>, DbError> {
        (**self).get(id)
    }

    fn set(&self, id: &str, data: Value) -> Result<(), DbError> {
        (**self).set(id, data)
    }

    fn delete(&self, pattern: &str) -> Result<usize, DbError> {
        (**self).delete(pattern)
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

/// Read-only view over another context
#[derive(Debug)]
pub struct ReadOnlyDb<D> {
    inner: D,
}

impl<D: DbContext> ReadOnlyDb<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

impl<D: DbContext> DbContext for ReadOnlyDb<D> {
    fn list(&self, pattern: Option<&str>) -> Result<Vec<Document>, DbError> {
        self.inner.list(pattern)
    }

    fn get(&self, id: &str) -> Result<Option<Value>, DbError> {
        self.inner.get(id)
    }

    fn is_read_only(&self) -> bool {
        true
    }
}
