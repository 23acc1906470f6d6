//! Named query parameters (`$name`) and their textual substitution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CompileError, Result};
use crate::literal::quote;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Identifier(Uuid),
    Text(String),
}

impl ParameterValue {
    /// Text substituted for `$name`.
    pub fn to_aql(&self) -> String {
        match self {
            Self::Text(s) => quote(s),
            Self::Identifier(id) => quote(&id.to_string()),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Boolean(b) => b.to_string(),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Uuid> for ParameterValue {
    fn from(value: Uuid) -> Self {
        Self::Identifier(value)
    }
}

impl TryFrom<serde_json::Value> for ParameterValue {
    type Error = CompileError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Bool(b) => Ok(Self::Boolean(b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Float))
                .ok_or_else(|| CompileError::InvalidQuery(format!("unsupported number {n}"))),
            serde_json::Value::String(s) => Ok(match Uuid::parse_str(&s) {
                Ok(id) => Self::Identifier(id),
                Err(_) => Self::Text(s),
            }),
            other => Err(CompileError::InvalidQuery(format!(
                "unsupported parameter value {other}"
            ))),
        }
    }
}

/// Named parameter values for one compilation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    values: HashMap<String, ParameterValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Build from a JSON object.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(map) = value else {
            return Err(CompileError::InvalidQuery(
                "query parameters must be a JSON object".to_string(),
            ));
        };
        let mut parameters = Self::new();
        for (name, value) in map {
            parameters.insert(name, ParameterValue::try_from(value)?);
        }
        Ok(parameters)
    }

    /// Replace every `$name` outside string literals by its value.
    pub fn substitute(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();
        let mut quote: Option<char> = None;

        while let Some((pos, ch)) = chars.next() {
            if let Some(q) = quote {
                if ch == q {
                    quote = None;
                }
                out.push(ch);
                continue;
            }
            match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    out.push(ch);
                }
                '$' => {
                    let start = pos + ch.len_utf8();
                    let mut end = start;
                    while let Some(&(i, c)) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            end = i + c.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let name = &text[start..end];
                    if name.is_empty() {
                        out.push('$');
                        continue;
                    }
                    let value = self
                        .get(name)
                        .ok_or_else(|| CompileError::UnresolvedParameter(name.to_string()))?;
                    out.push_str(&value.to_aql());
                }
                _ => out.push(ch),
            }
        }
        Ok(out)
    }
}
