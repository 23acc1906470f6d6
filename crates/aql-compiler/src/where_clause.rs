//! WHERE clause assembly into a flat, dialect-neutral token list.
//!
//! Operators carry their surrounding spaces (`" AND "`, `" = "`), so the
//! binder can emit the tokens back to back. `TERMINOLOGY(...)` calls are
//! resolved here, against the terminology collaborator.

use tracing::debug;

use crate::containment::BoolOp;
use crate::definition::PathVariable;
use crate::error::{CompileError, Result};
use crate::literal::{Literal, quote, unquote};
use crate::parser::{ParseNode, Rule};
use crate::projection::path_variable;
use crate::terminology::{TerminologyError, TerminologyParam, TerminologyService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhereToken {
    Operator(String),
    Variable(PathVariable),
    /// A literal in SQL form.
    Operand(String),
    /// `EXISTS path`, or `NOT EXISTS path` when negated.
    Exists {
        variable: PathVariable,
        negated: bool,
    },
}

impl WhereToken {
    pub fn operator(op: &str) -> Self {
        Self::Operator(op.to_string())
    }

    pub fn is_operator(&self, op: &str) -> bool {
        matches!(self, Self::Operator(o) if o == op)
    }
}

pub const AND: &str = " AND ";
pub const OR: &str = " OR ";
pub const NOT: &str = "NOT ";
pub const OPEN: &str = "(";
pub const CLOSE: &str = ")";
pub const IN: &str = " IN ";
pub const COMMA: &str = ",";
/// Boolean inequality, used for XOR.
pub const DIFFERS: &str = " <> ";

/// Comparison operators that take a single operand.
pub const COMPARISONS: &[&str] = &[" = ", " <> ", " > ", " < ", " >= ", " <= "];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhereClause {
    pub tokens: Vec<WhereToken>,
}

impl WhereClause {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn variables(&self) -> impl Iterator<Item = &PathVariable> {
        self.tokens.iter().filter_map(|t| match t {
            WhereToken::Variable(v) | WhereToken::Exists { variable: v, .. } => Some(v),
            _ => None,
        })
    }

    /// Plain-text rendering, for logs and tests.
    pub fn render(&self) -> String {
        self.tokens
            .iter()
            .map(|t| match t {
                WhereToken::Operator(o) => o.clone(),
                WhereToken::Variable(v) => v.text(),
                WhereToken::Operand(o) => o.clone(),
                WhereToken::Exists { variable, negated } => {
                    let not = if *negated { "NOT " } else { "" };
                    format!("{not}EXISTS {}", variable.text())
                }
            })
            .collect()
    }
}

/// Walks the WHERE subtree of a parse tree.
pub struct WhereAssembler<'a> {
    terminology: &'a dyn TerminologyService,
    tokens: Vec<WhereToken>,
}

impl<'a> WhereAssembler<'a> {
    pub fn new(terminology: &'a dyn TerminologyService) -> Self {
        Self {
            terminology,
            tokens: Vec::new(),
        }
    }

    /// Assemble the WHERE clause of `tree`; empty when there is none.
    pub fn assemble(mut self, tree: &ParseNode) -> Result<WhereClause> {
        let Some(expr) = tree.find(Rule::where_expr) else {
            return Ok(WhereClause::default());
        };
        self.expression(expr)?;
        check_token_balance(&self.tokens)?;

        let clause = WhereClause {
            tokens: self.tokens,
        };
        debug!(condition = %clause.render(), "where clause assembled");
        Ok(clause)
    }

    /// Operands joined by operators with AND over XOR over OR. XOR becomes
    /// an explicit parenthesized inequality.
    fn expression(&mut self, expr: &ParseNode) -> Result<()> {
        let mut terms: Vec<Vec<Vec<&ParseNode>>> = vec![vec![vec![]]];
        for child in &expr.children {
            match child.rule {
                Rule::where_unary => {
                    if let Some(factor) = terms.last_mut().and_then(|t| t.last_mut()) {
                        factor.push(child);
                    }
                }
                Rule::where_bool_op => match child.text.parse::<BoolOp>()? {
                    BoolOp::And => {}
                    BoolOp::Xor => {
                        if let Some(term) = terms.last_mut() {
                            term.push(vec![]);
                        }
                    }
                    BoolOp::Or => terms.push(vec![vec![]]),
                },
                _ => {}
            }
        }

        for (i, term) in terms.iter().enumerate() {
            if i > 0 {
                self.tokens.push(WhereToken::operator(OR));
            }
            match term.as_slice() {
                [single] => self.conjunction(single)?,
                [first, rest @ ..] => {
                    for _ in rest {
                        self.tokens.push(WhereToken::operator(OPEN));
                    }
                    self.parenthesized(first)?;
                    for factor in rest {
                        self.tokens.push(WhereToken::operator(DIFFERS));
                        self.parenthesized(factor)?;
                        self.tokens.push(WhereToken::operator(CLOSE));
                    }
                }
                [] => {}
            }
        }
        Ok(())
    }

    fn parenthesized(&mut self, factor: &[&ParseNode]) -> Result<()> {
        self.tokens.push(WhereToken::operator(OPEN));
        self.conjunction(factor)?;
        self.tokens.push(WhereToken::operator(CLOSE));
        Ok(())
    }

    fn conjunction(&mut self, factor: &[&ParseNode]) -> Result<()> {
        for (i, unary) in factor.iter().enumerate() {
            if i > 0 {
                self.tokens.push(WhereToken::operator(AND));
            }
            self.unary(unary)?;
        }
        Ok(())
    }

    fn unary(&mut self, unary: &ParseNode) -> Result<()> {
        let negations = unary.children_of(Rule::not_kw).count();
        let Some(primary) = unary.children.iter().find(|c| c.rule != Rule::not_kw) else {
            return Ok(());
        };

        if primary.rule == Rule::exists_expr {
            let path = primary
                .child(Rule::identified_path)
                .ok_or_else(|| CompileError::Syntax(format!("bad EXISTS '{}'", primary.text)))?;
            self.tokens.push(WhereToken::Exists {
                variable: path_variable(path)?,
                negated: negations % 2 == 1,
            });
            return Ok(());
        }

        for _ in 0..negations {
            self.tokens.push(WhereToken::operator(NOT));
        }
        match primary.rule {
            Rule::where_group => {
                let inner = primary
                    .child(Rule::where_expr)
                    .ok_or_else(|| CompileError::Syntax(format!("empty group '{}'", primary.text)))?;
                self.tokens.push(WhereToken::operator(OPEN));
                self.expression(inner)?;
                self.tokens.push(WhereToken::operator(CLOSE));
                Ok(())
            }
            Rule::comparison => self.comparison(primary),
            other => Err(CompileError::Syntax(format!(
                "unexpected WHERE term {other:?}: '{}'",
                primary.text
            ))),
        }
    }

    fn comparison(&mut self, node: &ParseNode) -> Result<()> {
        let mut children = node.children.iter();
        let left = children
            .next()
            .ok_or_else(|| CompileError::Syntax(format!("empty comparison '{}'", node.text)))?;
        self.operand(left)?;

        for tail in children {
            match tail.rule {
                Rule::compare_tail => {
                    let op = tail
                        .child(Rule::comparison_op)
                        .map(|o| normalize_comparison(&o.text))
                        .unwrap_or("=");
                    self.tokens.push(WhereToken::Operator(format!(" {op} ")));
                    self.tail_operand(tail)?;
                }
                Rule::like_tail => {
                    let op = tail
                        .child(Rule::like_op)
                        .map(|o| o.text.to_ascii_uppercase())
                        .unwrap_or_else(|| "LIKE".to_string());
                    self.tokens.push(WhereToken::Operator(format!(" {op} ")));
                    self.tail_operand(tail)?;
                }
                Rule::matches_tail => self.matches(tail)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn tail_operand(&mut self, tail: &ParseNode) -> Result<()> {
        let operand = tail
            .children
            .iter()
            .find(|c| {
                matches!(
                    c.rule,
                    Rule::terminology_call | Rule::literal | Rule::identified_path
                )
            })
            .ok_or_else(|| CompileError::Syntax(format!("missing operand in '{}'", tail.text)))?;
        self.operand(operand)
    }

    /// `MATCHES {a, b}` becomes ` IN (a,b)`.
    fn matches(&mut self, tail: &ParseNode) -> Result<()> {
        self.tokens.push(WhereToken::operator(IN));
        self.tokens.push(WhereToken::operator(OPEN));
        let items = tail.children.iter().filter(|c| {
            matches!(
                c.rule,
                Rule::terminology_call | Rule::literal | Rule::identified_path
            )
        });
        for (i, item) in items.enumerate() {
            if i > 0 {
                self.tokens.push(WhereToken::operator(COMMA));
            }
            self.operand(item)?;
        }
        self.tokens.push(WhereToken::operator(CLOSE));
        Ok(())
    }

    fn operand(&mut self, node: &ParseNode) -> Result<()> {
        let token = match node.rule {
            Rule::identified_path => WhereToken::Variable(path_variable(node)?),
            Rule::literal => WhereToken::Operand(Literal::from_node(node).to_sql()),
            Rule::terminology_call => WhereToken::Operand(self.terminology(node)?),
            other => {
                return Err(CompileError::Syntax(format!(
                    "unexpected operand {other:?}: '{}'",
                    node.text
                )));
            }
        };
        self.tokens.push(token);
        Ok(())
    }

    fn terminology(&self, node: &ParseNode) -> Result<String> {
        let args: Vec<String> = node
            .children_of(Rule::string)
            .map(|s| unquote(&s.text))
            .collect();
        let [operation, service_api, parameter] = args.as_slice() else {
            return Err(CompileError::Syntax(format!(
                "TERMINOLOGY expects three arguments: '{}'",
                node.text
            )));
        };
        let param = TerminologyParam::new(operation, service_api, parameter);

        match operation.to_ascii_lowercase().as_str() {
            "expand" => {
                let codes = self.terminology.expand(&param)?;
                if codes.is_empty() {
                    return Ok("NULL".to_string());
                }
                Ok(codes
                    .iter()
                    .map(|c| quote(&c.code))
                    .collect::<Vec<_>>()
                    .join(","))
            }
            "validate" => match self.terminology.validate(&param) {
                Ok(valid) => Ok(valid.to_string()),
                Err(TerminologyError::ConstraintViolation { .. }) => Ok("false".to_string()),
                Err(err) => Err(err.into()),
            },
            other => Err(CompileError::InvalidQuery(format!(
                "unsupported terminology operation '{other}'"
            ))),
        }
    }
}

fn normalize_comparison(op: &str) -> &str {
    match op {
        "!=" => "<>",
        other => other,
    }
}

/// Verify the `(` / `)` operator tokens pair up.
pub fn check_token_balance(tokens: &[WhereToken]) -> Result<()> {
    let mut depth = 0usize;
    for (position, token) in tokens.iter().enumerate() {
        if token.is_operator(OPEN) {
            depth += 1;
        } else if token.is_operator(CLOSE) {
            depth = depth.checked_sub(1).ok_or(CompileError::UnbalancedGroup {
                symbol: ')',
                position,
            })?;
        }
    }
    if depth > 0 {
        return Err(CompileError::UnbalancedGroup {
            symbol: '(',
            position: tokens.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;
    use crate::terminology::{CodedText, DisabledTerminology, StaticTerminology};

    fn assemble_with(text: &str, terminology: &dyn TerminologyService) -> Result<WhereClause> {
        WhereAssembler::new(terminology).assemble(&parse_query(text)?)
    }

    fn assemble(text: &str) -> WhereClause {
        assemble_with(text, &DisabledTerminology).unwrap()
    }

    #[test]
    fn test_simple_comparison() {
        let clause = assemble("SELECT c FROM EHR e CONTAINS COMPOSITION c WHERE e/ehr_id/value = '123'");
        assert_eq!(clause.tokens.len(), 3);
        assert!(matches!(&clause.tokens[0], WhereToken::Variable(v) if v.text() == "e/ehr_id/value"));
        assert_eq!(clause.tokens[1], WhereToken::operator(" = "));
        assert_eq!(clause.tokens[2], WhereToken::Operand("'123'".into()));
    }

    #[test]
    fn test_boolean_structure_and_groups() {
        let clause = assemble(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c \
             WHERE c/name/value = 'a' AND (c/name/value = 'b' OR NOT c/name/value != 'c')",
        );
        assert_eq!(
            clause.render(),
            "c/name/value = 'a' AND (c/name/value = 'b' OR NOT c/name/value <> 'c')"
        );
    }

    #[test]
    fn test_xor_becomes_inequality() {
        let clause = assemble(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c WHERE c/a = 1 XOR c/b = 2 AND c/d = 3",
        );
        assert_eq!(clause.render(), "((c/a = 1) <> (c/b = 2 AND c/d = 3))");
    }

    #[test]
    fn test_matches_and_like() {
        let clause = assemble(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c \
             WHERE c/name/value MATCHES {'a', 'b'} AND c/name/value ILIKE 'x%'",
        );
        assert_eq!(
            clause.render(),
            "c/name/value IN ('a','b') AND c/name/value ILIKE 'x%'"
        );
    }

    #[test]
    fn test_exists_and_not_exists() {
        let clause = assemble(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c WHERE EXISTS c/context AND NOT EXISTS c/name",
        );
        assert!(matches!(&clause.tokens[0], WhereToken::Exists { negated: false, .. }));
        assert!(matches!(&clause.tokens[2], WhereToken::Exists { negated: true, .. }));
        assert_eq!(clause.variables().count(), 2);
    }

    #[test]
    fn test_terminology_expand_and_validate() {
        let terminology = StaticTerminology::new();
        terminology.insert(
            "urn:vs:1",
            vec![
                CodedText {
                    code: "a".into(),
                    value: String::new(),
                    terminology: String::new(),
                },
                CodedText {
                    code: "b".into(),
                    value: String::new(),
                    terminology: String::new(),
                },
            ],
        );

        let clause = assemble_with(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c \
             WHERE c/x MATCHES {TERMINOLOGY('expand', 'hl7.org/fhir/4.0', 'urn:vs:1')}",
            &terminology,
        )
        .unwrap();
        assert_eq!(clause.render(), "c/x IN ('a','b')");

        let clause = assemble_with(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c \
             WHERE TERMINOLOGY('validate', 'hl7.org/fhir/4.0', 'url=urn:vs:1&code=z') = true",
            &terminology,
        )
        .unwrap();
        assert_eq!(clause.render(), "false = true");
    }

    #[test]
    fn test_terminology_failure_is_a_collaborator_error() {
        let err = assemble_with(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c \
             WHERE c/x MATCHES {TERMINOLOGY('expand', 'hl7.org/fhir/4.0', 'urn:vs:1')}",
            &DisabledTerminology,
        )
        .unwrap_err();
        assert!(err.is_server_error());
    }

    #[test]
    fn test_token_balance() {
        let tokens = vec![WhereToken::operator(OPEN)];
        assert!(matches!(
            check_token_balance(&tokens),
            Err(CompileError::UnbalancedGroup { symbol: '(', .. })
        ));
        let tokens = vec![WhereToken::operator(CLOSE)];
        assert!(matches!(
            check_token_balance(&tokens),
            Err(CompileError::UnbalancedGroup { symbol: ')', .. })
        ));
    }

    #[test]
    fn test_no_where_clause() {
        assert!(assemble("SELECT c FROM EHR e CONTAINS COMPOSITION c").is_empty());
    }
}
