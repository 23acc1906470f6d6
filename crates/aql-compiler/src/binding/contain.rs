//! Containment sets to path-matching sub-queries.
//!
//! Every closed set is reduced to one boolean expression over containment
//! chains. A chain becomes a match on the materialized containment label,
//! and the boolean operators become set operations between the matches.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::containment::{
    BoolOp, COMPOSITION, ContainmentExpr, ContainmentId, ContainmentResolution, SetId, SetItem, labelize,
};
use crate::error::{CompileError, Result};
use crate::literal::quote;

/// Any sequence of labels.
const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    Intersect,
    UnionAll,
    ExceptAll,
}

impl SetOperator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Intersect => "INTERSECT",
            Self::UnionAll => "UNION ALL",
            Self::ExceptAll => "EXCEPT ALL",
        }
    }
}

impl From<BoolOp> for SetOperator {
    fn from(op: BoolOp) -> Self {
        match op {
            BoolOp::And => Self::Intersect,
            BoolOp::Or => Self::UnionAll,
            BoolOp::Xor => Self::ExceptAll,
        }
    }
}

impl fmt::Display for SetOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Sub-query selecting the compositions a containment expression matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainmentQuery {
    Match {
        label: String,
    },
    Compose {
        operator: SetOperator,
        left: Box<ContainmentQuery>,
        right: Box<ContainmentQuery>,
    },
}

impl ContainmentQuery {
    pub fn to_sql(&self, schema: &str) -> String {
        match self {
            Self::Match { label } => format!(
                "SELECT DISTINCT \"comp_id\" FROM \"{schema}\".\"containment\" WHERE \"label\" ~ {}",
                quote(label)
            ),
            Self::Compose {
                operator,
                left,
                right,
            } => format!(
                "({}) {operator} ({})",
                left.to_sql(schema),
                right.to_sql(schema)
            ),
        }
    }
}

/// One reduced sub-expression and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Details {
    pub expression: String,
    pub parent_set: Option<SetId>,
    pub enclosing: Option<ContainmentId>,
}

/// Reduced sub-expressions, bucketed by the operator that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicates {
    pub atomic: Vec<Details>,
    pub intersect: Vec<Details>,
    pub union: Vec<Details>,
    pub except: Vec<Details>,
}

impl Predicates {
    fn record(&mut self, operator: Option<SetOperator>, details: Details) {
        let bucket = match operator {
            None => &mut self.atomic,
            Some(SetOperator::Intersect) => &mut self.intersect,
            Some(SetOperator::UnionAll) => &mut self.union,
            Some(SetOperator::ExceptAll) => &mut self.except,
        };
        bucket.push(details);
    }
}

/// Output of containment binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainmentBinding {
    /// The whole CONTAINS clause as one expression; `None` without CONTAINS.
    pub expr: Option<ContainmentExpr>,
    /// `None` when no filtering is needed.
    pub query: Option<ContainmentQuery>,
    /// The clause only asks for "some composition".
    pub simple_composition: bool,
    pub predicates: Predicates,
    /// Sets pruned as dangling wrappers, with the set standing in for them.
    pub collapsed: BTreeMap<SetId, SetId>,
}

impl ContainmentBinding {
    pub fn sql(&self, schema: &str) -> Option<String> {
        self.query.as_ref().map(|q| q.to_sql(schema))
    }

    /// `entry.composition_id IN (...)` restriction, if any.
    pub fn filter(&self, schema: &str) -> Option<String> {
        self.sql(schema)
            .map(|sql| format!("\"{schema}\".\"entry\".\"composition_id\" IN ({sql})"))
    }
}

struct Reduced {
    expr: ContainmentExpr,
    query: ContainmentQuery,
}

struct ContainmentBinder<'r> {
    resolution: &'r ContainmentResolution,
    predicates: Predicates,
    collapsed: BTreeMap<SetId, SetId>,
}

/// Reduce the closed containment sets of pass 1.
pub fn bind_containment(resolution: &ContainmentResolution) -> Result<ContainmentBinding> {
    let Some(root) = resolution.root else {
        return Ok(ContainmentBinding::default());
    };
    if !resolution.set(root).has_operand() {
        return Ok(ContainmentBinding::default());
    }

    let mut binder = ContainmentBinder {
        resolution,
        predicates: Predicates::default(),
        collapsed: BTreeMap::new(),
    };
    let reduced = binder.reduce(root)?;

    let simple_composition = match &reduced.expr {
        ContainmentExpr::Chain(chain) => {
            matches!(chain.as_slice(), [only] if only.class_name == COMPOSITION && only.archetype_id.is_none())
        }
        _ => false,
    };
    debug!(
        simple_composition,
        collapsed = binder.collapsed.len(),
        "containment bound"
    );

    Ok(ContainmentBinding {
        query: (!simple_composition).then_some(reduced.query),
        expr: Some(reduced.expr),
        simple_composition,
        predicates: binder.predicates,
        collapsed: binder.collapsed,
    })
}

enum Operand {
    Chain(Vec<ContainmentId>),
    Group(SetId),
}

impl ContainmentBinder<'_> {
    fn reduce(&mut self, id: SetId) -> Result<Reduced> {
        let set = self.resolution.set(id);
        if let [SetItem::Group(child)] = set.items.as_slice() {
            self.collapsed.insert(id, *child);
            debug!(pruned = id.index(), child = child.index(), "dangling group collapsed");
            return self.reduce(*child);
        }

        let (operands, operators) = split_operands(&set.items)?;
        let mut output: Vec<Reduced> = Vec::new();
        let mut pending: Vec<BoolOp> = Vec::new();

        for (index, operand) in operands.into_iter().enumerate() {
            if index > 0 {
                let op = operators[index - 1];
                while let Some(top) = pending.last().copied()
                    && top.precedence() >= op.precedence()
                {
                    pending.pop();
                    self.apply(&mut output, top, id)?;
                }
                pending.push(op);
            }
            let reduced = match operand {
                Operand::Chain(chain) => self.chain(&chain, id),
                Operand::Group(group) => self.reduce(group)?,
            };
            output.push(reduced);
        }
        while let Some(op) = pending.pop() {
            self.apply(&mut output, op, id)?;
        }

        match (output.pop(), output.is_empty()) {
            (Some(reduced), true) => Ok(reduced),
            _ => Err(CompileError::InvalidQuery(
                "malformed boolean structure in CONTAINS clause".to_string(),
            )),
        }
    }

    fn apply(&mut self, output: &mut Vec<Reduced>, op: BoolOp, set: SetId) -> Result<()> {
        let (Some(right), Some(left)) = (output.pop(), output.pop()) else {
            return Err(CompileError::InvalidQuery(format!(
                "{op} without operand in CONTAINS clause"
            )));
        };
        let operator = SetOperator::from(op);
        let query = ContainmentQuery::Compose {
            operator,
            left: Box::new(left.query),
            right: Box::new(right.query),
        };
        self.record(Some(operator), &query, set);
        output.push(Reduced {
            expr: ContainmentExpr::binary(op, left.expr, right.expr),
            query,
        });
        Ok(())
    }

    fn record(&mut self, operator: Option<SetOperator>, query: &ContainmentQuery, set: SetId) {
        let set = self.resolution.set(set);
        self.predicates.record(
            operator,
            Details {
                expression: query.to_sql("ehr"),
                parent_set: set.parent,
                enclosing: set.enclosing,
            },
        );
    }

    /// A chain of nested containments, scoped by the ancestry of its head.
    fn chain(&mut self, chain: &[ContainmentId], set: SetId) -> Reduced {
        let mapper = &self.resolution.mapper;
        let mut ids = chain
            .first()
            .map(|head| mapper.ancestry(*head))
            .unwrap_or_default();
        ids.extend(chain.iter().skip(1).copied());

        let last = ids.len().saturating_sub(1);
        let tokens: Vec<String> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let containment = mapper.containment(*id);
                match (&containment.archetype_id, i == last) {
                    (Some(archetype_id), _) => labelize(archetype_id),
                    (None, true) => containment.label(),
                    (None, false) => WILDCARD.to_string(),
                }
            })
            .collect();

        let query = ContainmentQuery::Match {
            label: chain_label(&tokens),
        };
        self.record(None, &query, set);
        Reduced {
            expr: ContainmentExpr::Chain(
                ids.iter()
                    .map(|id| mapper.containment(*id).to_ref())
                    .collect(),
            ),
            query,
        }
    }
}

/// Nested labels joined by `.`, with a wildcard between two concrete labels
/// and runs of wildcards merged.
fn chain_label(tokens: &[String]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for token in tokens {
        let token = token.as_str();
        match parts.last() {
            Some(&WILDCARD) if token == WILDCARD => {}
            Some(&previous) if previous != WILDCARD && token != WILDCARD => {
                parts.push(WILDCARD);
                parts.push(token);
            }
            _ => parts.push(token),
        }
    }
    parts.join(".")
}

/// Operands of a set, and the operators between them.
///
/// Containments not separated by an operator form one chain; a group
/// directly following a chain is nested in it and replaces it.
fn split_operands(items: &[SetItem]) -> Result<(Vec<Operand>, Vec<BoolOp>)> {
    let mut operands = Vec::new();
    let mut operators = Vec::new();
    let mut after_operator = true;

    for item in items {
        match item {
            SetItem::Operator(op) => {
                if after_operator {
                    return Err(CompileError::InvalidQuery(format!(
                        "{op} without operand in CONTAINS clause"
                    )));
                }
                operators.push(*op);
                after_operator = true;
            }
            SetItem::Containment(id) => {
                match operands.last_mut() {
                    Some(Operand::Chain(chain)) if !after_operator => chain.push(*id),
                    _ => operands.push(Operand::Chain(vec![*id])),
                }
                after_operator = false;
            }
            SetItem::Group(group) => {
                if !after_operator {
                    operands.pop();
                }
                operands.push(Operand::Group(*group));
                after_operator = false;
            }
        }
    }

    if after_operator && !operators.is_empty() {
        return Err(CompileError::InvalidQuery(
            "trailing boolean operator in CONTAINS clause".to_string(),
        ));
    }
    Ok((operands, operators))
}
