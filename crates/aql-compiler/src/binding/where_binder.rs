//! WHERE token list to SQL condition, for one template.

use super::dialect::{DialectSpan, jsquery_term, zoned_epoch_seconds};
use super::field::{DocumentColumn, FieldBinding, TemplateBinder};
use crate::error::Result;
use crate::where_clause::{AND, COMPARISONS, NOT, WhereClause, WhereToken};

/// Renders a WHERE clause, folding document comparisons into jsquery spans
/// when the dialect is enabled.
pub struct WhereBinder<'b, 'a> {
    binder: &'b mut TemplateBinder<'a>,
    use_jsquery: bool,
    span: DialectSpan,
    /// Connectives held back while a span is open.
    deferred: Vec<String>,
    out: String,
}

impl<'b, 'a> WhereBinder<'b, 'a> {
    pub fn new(binder: &'b mut TemplateBinder<'a>, use_jsquery: bool) -> Self {
        Self {
            binder,
            use_jsquery,
            span: DialectSpan::new(),
            deferred: Vec::new(),
            out: String::new(),
        }
    }

    /// The SQL condition; `None` for an empty clause.
    pub fn bind(mut self, clause: &WhereClause) -> Result<Option<String>> {
        if clause.is_empty() {
            return Ok(None);
        }

        let tokens = &clause.tokens;
        let mut i = 0;
        while i < tokens.len() {
            match &tokens[i] {
                WhereToken::Variable(variable) => {
                    let field = self.binder.bind(variable)?;
                    if let Some((operator, operand)) = comparison_at(tokens, i)
                        && self.comparison(&field, operator, operand)?
                    {
                        i += 3;
                        continue;
                    }
                    self.sql(&field.expression);
                }
                WhereToken::Operator(op) if op == NOT || (self.span.is_open() && op == AND) => {
                    self.deferred.push(op.clone());
                }
                WhereToken::Operator(op) => self.sql(op),
                WhereToken::Operand(operand) => self.sql(operand),
                WhereToken::Exists { variable, negated } => {
                    let field = self.binder.bind(variable)?;
                    let test = if *negated { "IS NULL" } else { "IS NOT NULL" };
                    self.sql(&format!("{} {test}", field.expression));
                }
            }
            i += 1;
        }
        self.flush();
        Ok(Some(self.out))
    }

    /// Handle `field op literal` specially; false when it is plain SQL.
    fn comparison(&mut self, field: &FieldBinding, operator: &str, operand: &str) -> Result<bool> {
        let Some(doc) = field.document() else {
            return Ok(false);
        };

        if let Some(epoch) = zoned_epoch_seconds(operand)
            && doc.path.last_key() == Some("value")
        {
            let offset = DocumentColumn {
                path: doc.path.with_last_key("epoch_offset"),
                cast: Some("numeric"),
                whole_object: false,
                ..doc.clone()
            };
            let expression = self.binder.render_document(&offset);
            self.sql(&format!("{expression}{operator}{epoch}"));
            return Ok(true);
        }

        if !self.use_jsquery {
            return Ok(false);
        }
        let Some(term) = jsquery_term(&doc.path, operator, operand) else {
            return Ok(false);
        };

        if self.span.column() == Some(doc.column.as_str()) {
            for connective in self.deferred.drain(..) {
                self.span.push(&connective);
            }
        } else {
            let negations = self.take_trailing_negations();
            self.flush();
            self.span.open(&doc.column)?;
            for negation in negations {
                self.span.push(&negation);
            }
        }
        self.span.push(&term);
        Ok(true)
    }

    /// Held-back `NOT`s directly in front of the current term; they negate
    /// that term alone.
    fn take_trailing_negations(&mut self) -> Vec<String> {
        let keep = self
            .deferred
            .iter()
            .rposition(|c| c != NOT)
            .map_or(0, |i| i + 1);
        self.deferred.split_off(keep)
    }

    /// Close any open span, then write held-back connectives.
    fn flush(&mut self) {
        if let Some(term) = self.span.close() {
            self.out.push_str(&term);
        }
        for connective in self.deferred.drain(..) {
            self.out.push_str(&connective);
        }
    }

    fn sql(&mut self, text: &str) {
        self.flush();
        self.out.push_str(text);
    }
}

fn comparison_at(tokens: &[WhereToken], i: usize) -> Option<(&str, &str)> {
    match (tokens.get(i + 1), tokens.get(i + 2)) {
        (Some(WhereToken::Operator(op)), Some(WhereToken::Operand(operand)))
            if COMPARISONS.contains(&op.as_str()) =>
        {
            Some((op.as_str(), operand.as_str()))
        }
        _ => None,
    }
}
