//! Compiler configuration.

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};

/// Environment variable overriding [`CompilerConfig::use_jsquery`].
pub const USE_JSQUERY_ENV: &str = "AQL_USE_JSQUERY";

/// Settings passed explicitly into the compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Render simple document comparisons with the jsquery `@@` operator
    /// instead of path operators.
    pub use_jsquery: bool,
    /// Node name appended to composition uids.
    pub server_node_id: String,
    /// Relational schema holding the storage tables.
    pub schema: String,
    /// Upper bound on the number of templates a query is bound against.
    pub max_templates: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            use_jsquery: false,
            server_node_id: default_server_node_id(),
            schema: default_schema(),
            max_templates: default_max_templates(),
        }
    }
}

fn default_server_node_id() -> String {
    "local.ehrbase.org".to_string()
}

fn default_schema() -> String {
    "ehr".to_string()
}

fn default_max_templates() -> usize {
    256
}

impl CompilerConfig {
    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(USE_JSQUERY_ENV) {
            match parse_flag(&value) {
                Some(flag) => self.use_jsquery = flag,
                None => tracing::warn!(
                    value = %value,
                    "ignoring unparsable {USE_JSQUERY_ENV} override"
                ),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema.trim().is_empty() {
            return Err(CompileError::InvalidQuery(
                "compiler schema must not be empty".to_string(),
            ));
        }
        if self.server_node_id.trim().is_empty() {
            return Err(CompileError::InvalidQuery(
                "server node id must not be empty".to_string(),
            ));
        }
        if self.max_templates == 0 {
            return Err(CompileError::InvalidQuery(
                "max_templates must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
