//! Post-processing of the resolved passes into bindable statements.
//!
//! Checks identifiers, folds the FROM EHR predicate into the WHERE clause,
//! turns ORDER BY items into result columns and decides whether the result
//! needs a DISTINCT wrapper.

use tracing::debug;

use crate::containment::IdentifierMapper;
use crate::definition::{OrderAttribute, PathVariable, TopDirection, Variable};
use crate::error::{CompileError, Result};
use crate::path::AqlPath;
use crate::projection::Projection;
use crate::sql_builder::SortOrder;
use crate::where_clause::{AND, CLOSE, OPEN, OR, WhereClause, WhereToken};

/// One ORDER BY entry, by result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderColumn {
    pub column: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statements {
    /// SELECT variables, followed by hidden ORDER BY variables.
    pub variables: Vec<Variable>,
    pub where_clause: WhereClause,
    pub order_by: Vec<OrderColumn>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub distinct: bool,
}

impl Statements {
    pub fn build(
        projection: Projection,
        where_clause: WhereClause,
        mapper: &IdentifierMapper,
        has_contains: bool,
    ) -> Result<Self> {
        let Projection {
            mut variables,
            top,
            order_by,
            limit,
            offset,
        } = projection;

        check_identifiers(&variables, &where_clause, &order_by, mapper)?;
        let where_clause = inject_ehr_predicate(where_clause, mapper);
        let order_by = order_columns(&mut variables, order_by, mapper);

        let limit = match top {
            Some(top) => {
                if top.direction == Some(TopDirection::Backward) {
                    debug!(count = top.count, "TOP BACKWARD evaluated as FORWARD");
                }
                Some(top.count)
            }
            None => limit,
        };

        let ehr_only = !variables.is_empty()
            && variables
                .iter()
                .all(|v| matches!(v, Variable::Path(p) if mapper.is_ehr(&p.identifier)));
        let distinct = variables.iter().any(Variable::is_distinct) || (has_contains && ehr_only);

        Ok(Self {
            variables,
            where_clause,
            order_by,
            limit,
            offset,
            distinct,
        })
    }

    pub fn has_functions(&self) -> bool {
        self.variables.iter().any(Variable::is_function)
    }

    /// Visible result columns, in SELECT order.
    pub fn visible_columns(&self) -> impl Iterator<Item = &str> {
        self.variables
            .iter()
            .filter(|v| !v.is_hidden())
            .map(Variable::column)
    }
}

fn is_alias(identifier: &str, variables: &[Variable]) -> bool {
    variables
        .iter()
        .any(|v| v.explicit_alias() == Some(identifier))
}

fn check_identifiers(
    variables: &[Variable],
    where_clause: &WhereClause,
    order_by: &[OrderAttribute],
    mapper: &IdentifierMapper,
) -> Result<()> {
    let known = |v: &PathVariable| mapper.get(&v.identifier).is_some();
    let unknown = variables
        .iter()
        .flat_map(Variable::path_variables)
        .chain(where_clause.variables())
        .find(|&v| !known(v))
        .or_else(|| {
            order_by
                .iter()
                .map(|o| &o.variable)
                .find(|&v| !known(v) && !(v.path.is_none() && is_alias(&v.identifier, variables)))
        });
    match unknown {
        Some(v) => Err(CompileError::InvalidQuery(format!(
            "identifier '{}' is not defined in the FROM clause",
            v.identifier
        ))),
        None => Ok(()),
    }
}

/// Append the FROM EHR predicate to the WHERE clause, unless the same
/// comparison is already there.
fn inject_ehr_predicate(mut clause: WhereClause, mapper: &IdentifierMapper) -> WhereClause {
    let Some(ehr) = mapper.ehr_container() else {
        return clause;
    };
    let Some(condition) = &ehr.condition else {
        return clause;
    };

    let operator = match condition.operator.trim() {
        "!=" => "<>",
        other => other,
    };
    let triple = [
        WhereToken::Variable(PathVariable::new(
            ehr.identifier.clone(),
            Some(AqlPath::parse(&condition.path)),
        )),
        WhereToken::Operator(format!(" {operator} ")),
        WhereToken::Operand(condition.value.clone()),
    ];

    let present = clause.tokens.windows(3).enumerate().any(|(i, w)| {
        let same = match (&w[0], &triple[0]) {
            (WhereToken::Variable(a), WhereToken::Variable(b)) => {
                a.same_target(b) && w[1] == triple[1] && w[2] == triple[2]
            }
            _ => false,
        };
        same && is_top_level_conjunct(&clause.tokens, i, 3)
    });
    if present {
        return clause;
    }

    if !clause.is_empty() {
        let mut tokens = Vec::with_capacity(clause.tokens.len() + 6);
        tokens.push(WhereToken::operator(OPEN));
        tokens.append(&mut clause.tokens);
        tokens.push(WhereToken::operator(CLOSE));
        tokens.push(WhereToken::operator(AND));
        clause.tokens = tokens;
    }
    clause.tokens.extend(triple);
    debug!(condition = %clause.render(), "EHR predicate injected");
    clause
}

/// Whether `tokens[start..start + len]` is ANDed with the rest of the
/// clause: outside any parentheses, bordered only by AND, with no OR at the
/// outermost level.
fn is_top_level_conjunct(tokens: &[WhereToken], start: usize, len: usize) -> bool {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_operator(OPEN) {
            depth += 1;
        } else if token.is_operator(CLOSE) {
            depth = depth.saturating_sub(1);
        } else if i == start && depth > 0 {
            return false;
        } else if depth == 0 && token.is_operator(OR) {
            return false;
        }
    }
    let before = start.checked_sub(1).and_then(|i| tokens.get(i));
    let after = tokens.get(start + len);
    [before, after]
        .into_iter()
        .flatten()
        .all(|t| t.is_operator(AND))
}

/// Resolve ORDER BY items to result columns, adding hidden variables for
/// items not selected.
fn order_columns(
    variables: &mut Vec<Variable>,
    order_by: Vec<OrderAttribute>,
    mapper: &IdentifierMapper,
) -> Vec<OrderColumn> {
    let mut hidden = 0;
    let mut columns = Vec::with_capacity(order_by.len());

    for OrderAttribute { variable, order } in order_by {
        let by_alias = (variable.path.is_none() && mapper.get(&variable.identifier).is_none())
            .then(|| {
                variables
                    .iter()
                    .find(|v| v.explicit_alias() == Some(variable.identifier.as_str()))
            })
            .flatten();
        let by_path = || {
            variables.iter().find(|v| match v {
                Variable::Path(p) => p.same_target(&variable),
                _ => false,
            })
        };

        let selected = by_alias.or_else(by_path).map(|v| v.column().to_string());
        let column = match selected {
            Some(column) => column,
            None => {
                let name = loop {
                    hidden += 1;
                    let name = format!("_ORDER_{hidden}");
                    if variables.iter().all(|v| v.column() != name) {
                        break name;
                    }
                };
                let mut extra = variable;
                extra.hidden = true;
                extra.column = name;
                let column = extra.column.clone();
                variables.push(Variable::Path(extra));
                column
            }
        };
        columns.push(OrderColumn { column, order });
    }
    columns
}
