//! Owned parse tree shared by every compiler pass.

use std::fmt::Write as _;

use pest::iterators::Pair;

use super::Rule;

/// A node of the generic parse tree.
///
/// Built once from the pest pair tree so the passes can walk it without
/// borrowing the query text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseNode {
    pub rule: Rule,
    pub text: String,
    pub span: (usize, usize),
    pub children: Vec<ParseNode>,
}

impl ParseNode {
    pub(crate) fn from_pair(pair: Pair<'_, Rule>) -> Self {
        let span = pair.as_span();
        let rule = pair.as_rule();
        let text = pair.as_str().to_string();
        let children = pair
            .into_inner()
            .filter(|inner| inner.as_rule() != Rule::EOI)
            .map(ParseNode::from_pair)
            .collect();

        Self {
            rule,
            text,
            span: (span.start(), span.end()),
            children,
        }
    }

    /// First direct child with the given rule.
    pub fn child(&self, rule: Rule) -> Option<&ParseNode> {
        self.children.iter().find(|c| c.rule == rule)
    }

    /// All direct children with the given rule.
    pub fn children_of(&self, rule: Rule) -> impl Iterator<Item = &ParseNode> {
        self.children.iter().filter(move |c| c.rule == rule)
    }

    /// First direct child, whatever its rule.
    pub fn first(&self) -> Option<&ParseNode> {
        self.children.first()
    }

    /// Depth-first search for a descendant (or self) with the given rule.
    pub fn find(&self, rule: Rule) -> Option<&ParseNode> {
        if self.rule == rule {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(rule))
    }

    pub fn has(&self, rule: Rule) -> bool {
        self.child(rule).is_some()
    }

    /// Indented dump of the tree, one node per line.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.write_pretty(&mut out, 0);
        out
    }

    fn write_pretty(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        if self.children.is_empty() {
            let _ = writeln!(out, "{indent}{:?} {:?}", self.rule, self.text);
        } else {
            let _ = writeln!(out, "{indent}{:?}", self.rule);
            for child in &self.children {
                child.write_pretty(out, depth + 1);
            }
        }
    }
}
