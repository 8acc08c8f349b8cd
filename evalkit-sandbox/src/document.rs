//! Compiled rich documents
//!
//! Documents are compiled elsewhere into a plain script plus the top-level
//! expressions whose values should surface as output.

use serde::{Deserialize, Serialize};

/// Output of the document compiler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledDocument {
    /// Executable script extracted from the document
    pub code: String,

    /// Top-level expressions, in document order
    #[serde(default)]
    pub expressions: Vec<String>,
}

impl CompiledDocument {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            expressions: Vec::new(),
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expressions.push(expression.into());
        self
    }

    /// Script that runs the code, then returns every expression's value as an array
    pub fn to_script(&self) -> String {
        if self.expressions.is_empty() {
            return self.code.clone();
        }
        let values: Vec<String> = self
            .expressions
            .iter()
            .map(|expr| format!("({})", expr.trim().trim_end_matches(';')))
            .collect();
        format!("{}\nreturn [{}];", self.code, values.join(", "))
    }
}
