//! Parser adapter.
//!
//! Wraps the pest grammar in `aql.pest`, converts its pair tree into an owned
//! [`ParseNode`] tree and owns the two pre/post checks around parsing:
//!
//! - bracket balance across `()`, `{}` and `[]`, reported with the offending
//!   symbol before the grammar ever runs;
//! - recovery of quoted archetype ids, see [`recovery`].

mod recovery;
mod tree;

use std::fmt;
use std::str::FromStr;

use pest::Parser;
use pest_derive::Parser;
use tracing::debug;

pub use recovery::recover_archetype_ids;
pub use tree::ParseNode;

use crate::error::{CompileError, Result};

#[derive(Parser)]
#[grammar = "parser/aql.pest"]
pub struct AqlGrammar;

/// Supported stand-alone start rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRule {
    Query,
    SelectItem,
    WhereExpr,
    IdentifiedPath,
    ContainsExpr,
}

impl StartRule {
    fn rule(self) -> Rule {
        match self {
            Self::Query => Rule::query,
            Self::SelectItem => Rule::select_fragment,
            Self::WhereExpr => Rule::where_fragment,
            Self::IdentifiedPath => Rule::path_fragment,
            Self::ContainsExpr => Rule::contains_fragment,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::SelectItem => "select",
            Self::WhereExpr => "where",
            Self::IdentifiedPath => "path",
            Self::ContainsExpr => "contains",
        }
    }
}

impl fmt::Display for StartRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StartRule {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "query" => Ok(Self::Query),
            "select" => Ok(Self::SelectItem),
            "where" => Ok(Self::WhereExpr),
            "path" => Ok(Self::IdentifiedPath),
            "contains" => Ok(Self::ContainsExpr),
            other => Err(CompileError::InvalidQuery(format!(
                "unknown start rule '{other}'"
            ))),
        }
    }
}

/// Parse a complete AQL query.
pub fn parse_query(text: &str) -> Result<ParseNode> {
    parse_fragment(StartRule::Query, text)
}

/// Parse `text` starting from `start`.
///
/// The returned node is the fragment rule itself; its children are the
/// grammar constructs below it.
pub fn parse_fragment(start: StartRule, text: &str) -> Result<ParseNode> {
    check_balanced(text)?;

    match parse_strict(start, text) {
        Ok(node) => Ok(node),
        Err(err) => {
            let Some(recovered) = recover_archetype_ids(text) else {
                return Err(syntax_error(&err));
            };
            debug!(rule = %start, "retrying parse with unquoted archetype ids");
            parse_strict(start, &recovered).map_err(|_| syntax_error(&err))
        }
    }
}

fn parse_strict(
    start: StartRule,
    text: &str,
) -> std::result::Result<ParseNode, Box<pest::error::Error<Rule>>> {
    let mut pairs = AqlGrammar::parse(start.rule(), text).map_err(Box::new)?;
    match pairs.next() {
        Some(root) => Ok(ParseNode::from_pair(root)),
        None => Err(Box::new(pest::error::Error::new_from_pos(
            pest::error::ErrorVariant::CustomError {
                message: "empty input".to_string(),
            },
            pest::Position::from_start(text),
        ))),
    }
}

fn syntax_error(err: &pest::error::Error<Rule>) -> CompileError {
    let (line, column) = match err.line_col {
        pest::error::LineColLocation::Pos(pos) => pos,
        pest::error::LineColLocation::Span(start, _) => start,
    };
    CompileError::Syntax(format!(
        "line {line}, column {column}: {}",
        err.variant.message()
    ))
}

/// Verify that `()`, `{}` and `[]` are balanced outside string literals.
pub fn check_balanced(text: &str) -> Result<()> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut quote: Option<char> = None;

    for (pos, ch) in text.char_indices() {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '{' | '[' => stack.push((ch, pos)),
            ')' | '}' | ']' => {
                let expected = match ch {
                    ')' => '(',
                    '}' => '{',
                    _ => '[',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => {
                        return Err(CompileError::UnbalancedGroup {
                            symbol: ch,
                            position: pos,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    match stack.pop() {
        Some((symbol, position)) => Err(CompileError::UnbalancedGroup { symbol, position }),
        None => Ok(()),
    }
}
