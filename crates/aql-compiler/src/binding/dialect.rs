//! The jsquery dialect for document comparisons.
//!
//! Consecutive comparisons on the same document column, joined by AND/NOT,
//! collapse into one `<column> @@ '<expr>'::jsquery` term. A span is opened
//! on the first such comparison and closed as soon as anything else follows.

use time::OffsetDateTime;
use time::format_description::well_known::Iso8601;

use crate::error::{CompileError, Result};
use crate::knowledge::{JsonPath, JsonSegment};
use crate::literal::sql_unquote;

/// Comparison operators jsquery accepts.
const JSQUERY_OPERATORS: &[&str] = &["=", "<", ">", "<=", ">="];

/// An open run of jsquery terms over one column.
#[derive(Debug, Default)]
pub struct DialectSpan {
    column: Option<String>,
    expression: String,
}

impl DialectSpan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.column.is_some()
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn open(&mut self, column: &str) -> Result<()> {
        if let Some(open) = &self.column {
            return Err(CompileError::InvalidQuery(format!(
                "jsquery span on {open} is still open"
            )));
        }
        self.column = Some(column.to_string());
        self.expression.clear();
        Ok(())
    }

    /// Append a term or a connective (`" AND "`, `"NOT "`).
    pub fn push(&mut self, text: &str) {
        self.expression.push_str(text);
    }

    /// The finished SQL term; `None` when no span is open.
    pub fn close(&mut self) -> Option<String> {
        let column = self.column.take()?;
        let expression = std::mem::take(&mut self.expression);
        Some(format!(
            "{column} @@ '{}'::jsquery",
            expression.replace('\'', "''")
        ))
    }
}

/// `"k1".#."k2"` path notation.
pub fn jsquery_path(path: &JsonPath) -> String {
    path.segments()
        .iter()
        .map(|s| match s {
            JsonSegment::Key(k) => format!("\"{}\"", k.replace('"', "\\\"")),
            JsonSegment::Index(i) => format!("#{i}"),
            JsonSegment::Iterate | JsonSegment::Named(_) => "#".to_string(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// jsquery form of an SQL literal; `None` for anything but plain values.
pub fn jsquery_value(literal: &str) -> Option<String> {
    if let Some(text) = sql_unquote(literal) {
        return Some(format!("\"{}\"", text.replace('"', "\\\"")));
    }
    let lowered = literal.to_ascii_lowercase();
    if matches!(lowered.as_str(), "true" | "false" | "null") || literal.parse::<f64>().is_ok() {
        return Some(lowered);
    }
    None
}

/// `path op value` as a jsquery term, when the comparison fits. Node name
/// filters have no jsquery form.
pub fn jsquery_term(path: &JsonPath, operator: &str, literal: &str) -> Option<String> {
    let operator = operator.trim();
    if !JSQUERY_OPERATORS.contains(&operator)
        || path
            .segments()
            .iter()
            .any(|s| matches!(s, JsonSegment::Named(_)))
    {
        return None;
    }
    let value = jsquery_value(literal)?;
    Some(format!("{} {operator} {value}", jsquery_path(path)))
}

/// Epoch seconds of an ISO-8601 date-time literal carrying an offset.
pub fn zoned_epoch_seconds(literal: &str) -> Option<i64> {
    let text = sql_unquote(literal)?;
    if !text.contains('T') {
        return None;
    }
    OffsetDateTime::parse(&text, &Iso8601::DEFAULT)
        .ok()
        .map(OffsetDateTime::unix_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> JsonPath {
        JsonPath::new(vec![
            JsonSegment::Key("/content[openEHR-EHR-OBSERVATION.x.v1]".into()),
            JsonSegment::Iterate,
            JsonSegment::Key("/data[at0001]".into()),
            JsonSegment::Index(0),
            JsonSegment::Key("value".into()),
        ])
    }

    #[test]
    fn test_path_and_term_rendering() {
        assert_eq!(
            jsquery_path(&path()),
            "\"/content[openEHR-EHR-OBSERVATION.x.v1]\".#.\"/data[at0001]\".#0.\"value\""
        );
        let term = jsquery_term(&path(), " = ", "'high'").unwrap();
        assert!(term.ends_with("\"value\" = \"high\""));
        assert!(jsquery_term(&path(), " LIKE ", "'h%'").is_none());
        assert!(jsquery_term(&path(), " <> ", "1").is_none());
        let named = JsonPath::new(vec![
            JsonSegment::Key("/events[at0006]".into()),
            JsonSegment::Named("Any event".into()),
            JsonSegment::Key("value".into()),
        ]);
        assert!(jsquery_term(&named, " = ", "'x'").is_none());
        assert_eq!(jsquery_value("12.5").as_deref(), Some("12.5"));
        assert_eq!(jsquery_value("TRUE").as_deref(), Some("true"));
    }

    #[test]
    fn test_span_open_close() {
        let mut span = DialectSpan::new();
        assert!(span.close().is_none());

        span.open("\"ehr\".\"entry\".\"entry\"").unwrap();
        assert!(span.open("other").is_err());
        span.push("\"a\" = \"it's\"");
        span.push(" AND ");
        span.push("\"b\" > 1");
        assert_eq!(
            span.close().unwrap(),
            "\"ehr\".\"entry\".\"entry\" @@ '\"a\" = \"it''s\" AND \"b\" > 1'::jsquery"
        );
        assert!(!span.is_open());
    }

    #[test]
    fn test_zoned_epoch_seconds() {
        assert_eq!(
            zoned_epoch_seconds("'2020-01-01T00:00:00+01:00'"),
            Some(1_577_833_200)
        );
        assert_eq!(zoned_epoch_seconds("'2020-01-01'"), None);
        assert_eq!(zoned_epoch_seconds("'2020-01-01T00:00:00'"), None);
        assert_eq!(zoned_epoch_seconds("42"), None);
    }
}
