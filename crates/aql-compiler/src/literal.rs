//! AQL literals and their SQL rendering.

use std::sync::LazyLock;

use regex::Regex;

use crate::parser::{ParseNode, Rule};

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}(T\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}(:?\d{2})?)?)?$")
        .expect("Invalid ISO date regex")
});

/// Lexical class of a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralKind {
    Boolean,
    Float,
    Integer,
    Date,
    Real,
    String,
    Null,
    Unknown,
}

/// A literal as written in the query plus its SQL form.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub kind: LiteralKind,
    /// Unquoted text for strings and dates, the token otherwise.
    pub value: String,
}

impl Literal {
    pub fn new(kind: LiteralKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(LiteralKind::String, value)
    }

    /// Build from a `literal` node, or from the typed node below it.
    pub fn from_node(node: &ParseNode) -> Self {
        let node = if node.rule == Rule::literal {
            match node.first() {
                Some(inner) => inner,
                None => return Self::new(LiteralKind::Unknown, node.text.clone()),
            }
        } else {
            node
        };

        match node.rule {
            Rule::boolean => Self::new(LiteralKind::Boolean, node.text.to_ascii_lowercase()),
            Rule::integer => Self::new(LiteralKind::Integer, node.text.clone()),
            Rule::float => Self::new(LiteralKind::Float, node.text.clone()),
            Rule::real => Self::new(LiteralKind::Real, node.text.clone()),
            Rule::null => Self::new(LiteralKind::Null, "NULL"),
            Rule::string => {
                let value = unquote(&node.text);
                let kind = if ISO_DATE.is_match(&value) {
                    LiteralKind::Date
                } else {
                    LiteralKind::String
                };
                Self::new(kind, value)
            }
            _ => Self::new(LiteralKind::Unknown, node.text.clone()),
        }
    }

    pub fn is_quoted(&self) -> bool {
        matches!(self.kind, LiteralKind::String | LiteralKind::Date)
    }

    /// SQL rendering: strings single-quoted, everything else verbatim.
    pub fn to_sql(&self) -> String {
        match self.kind {
            LiteralKind::String | LiteralKind::Date => quote(&self.value),
            LiteralKind::Null => "NULL".to_string(),
            _ => self.value.clone(),
        }
    }
}

/// Single-quote `value` for SQL, doubling embedded quotes.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Strip the quotes of an AQL string token and undo its escapes.
pub fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 {
        if let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            return inner.replace("''", "'").replace("\\'", "'");
        }
        if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
            return inner.replace("\\\"", "\"");
        }
    }
    raw.to_string()
}

/// Unquote an SQL literal produced by [`Literal::to_sql`].
pub fn sql_unquote(sql: &str) -> Option<String> {
    let inner = sql.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace("''", "'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_and_unquote() {
        assert_eq!(quote("O'Brien"), "'O''Brien'");
        assert_eq!(unquote("'O''Brien'"), "O'Brien");
        assert_eq!(unquote("\"double\""), "double");
        assert_eq!(sql_unquote("'a''b'").as_deref(), Some("a'b"));
        assert!(sql_unquote("42").is_none());
    }

    #[test]
    fn test_dates_are_recognised() {
        assert!(ISO_DATE.is_match("2020-01-01"));
        assert!(ISO_DATE.is_match("2020-01-01T00:00:00+01:00"));
        assert!(!ISO_DATE.is_match("hello"));
    }

    #[test]
    fn test_sql_rendering() {
        assert_eq!(Literal::string("x").to_sql(), "'x'");
        assert_eq!(Literal::new(LiteralKind::Integer, "5").to_sql(), "5");
        assert_eq!(Literal::new(LiteralKind::Null, "null").to_sql(), "NULL");
    }
}
