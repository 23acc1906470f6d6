//! Pass 2: SELECT list, TOP, ORDER BY and LIMIT/OFFSET.

use std::collections::HashSet;

use tracing::debug;

use crate::definition::{
    ALLOWED_FUNCTIONS, ConstantDefinition, ExtensionDefinition, FunctionDefinition,
    FunctionParameter, OrderAttribute, PathVariable, TopAttributes, TopDirection, Variable,
};
use crate::error::{CompileError, Result};
use crate::literal::{Literal, unquote};
use crate::parser::{ParseNode, Rule};
use crate::path::AqlPath;
use crate::sql_builder::{MAX_IDENTIFIER_LENGTH, SortOrder};

/// Output of pass 2.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub variables: Vec<Variable>,
    pub top: Option<TopAttributes>,
    pub order_by: Vec<OrderAttribute>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Default)]
struct Counters {
    function_args: usize,
    columns: usize,
    aliases: usize,
}

/// Run pass 2 over a parsed query.
pub fn resolve_projection(tree: &ParseNode) -> Result<Projection> {
    let mut projection = Projection::default();
    let mut counters = Counters::default();

    if let Some(select) = tree.find(Rule::select_clause) {
        if let Some(top) = select.child(Rule::top_clause) {
            projection.top = Some(top_attributes(top)?);
        }
        for expr in select.children_of(Rule::select_expr) {
            projection.variables.push(select_item(expr, &mut counters)?);
        }
    }
    check_aliases(&projection.variables)?;

    if let Some(order) = tree.find(Rule::order_by_clause) {
        projection.order_by = order
            .children_of(Rule::order_by_expr)
            .map(order_attribute)
            .collect::<Result<_>>()?;
    }

    if let Some(limit) = tree.find(Rule::limit_clause) {
        let (limit, offset) = limit_offset(limit)?;
        projection.limit = limit;
        projection.offset = offset;
    }

    if projection.top.is_some() && projection.limit.is_some() {
        return Err(CompileError::InvalidQuery(
            "TOP cannot be combined with LIMIT".to_string(),
        ));
    }

    debug!(
        variables = projection.variables.len(),
        order_by = projection.order_by.len(),
        limit = ?projection.limit,
        offset = ?projection.offset,
        "projection resolved"
    );
    Ok(projection)
}

fn select_item(expr: &ParseNode, counters: &mut Counters) -> Result<Variable> {
    let distinct = expr.has(Rule::distinct_kw);
    let alias = expr.child(Rule::alias).map(|a| a.text.clone());
    let operand = expr
        .children
        .iter()
        .find(|c| !matches!(c.rule, Rule::distinct_kw | Rule::as_kw | Rule::alias))
        .ok_or_else(|| CompileError::Syntax(format!("empty SELECT item '{}'", expr.text)))?;

    match operand.rule {
        Rule::identified_path => {
            let mut variable = path_variable(operand)?;
            variable.distinct = distinct;
            variable.column = match &alias {
                Some(alias) => alias.clone(),
                None if variable.column.len() > MAX_IDENTIFIER_LENGTH => {
                    counters.columns += 1;
                    format!("_COL_{}", counters.columns)
                }
                None => variable.column,
            };
            variable.alias = alias;
            Ok(Variable::Path(variable))
        }
        Rule::function_call => function(operand, alias, counters).map(Variable::Function),
        Rule::cast_call => cast(operand, alias, counters).map(Variable::Function),
        Rule::extension_call => {
            let mut args = operand.children_of(Rule::string).map(|s| unquote(&s.text));
            let context = args.next().unwrap_or_default();
            let expression = args.next().unwrap_or_default();
            Ok(Variable::Extension(ExtensionDefinition {
                context,
                expression,
                alias: alias.unwrap_or_else(|| generated_alias(counters)),
            }))
        }
        Rule::literal => Ok(Variable::Constant(ConstantDefinition {
            value: Literal::from_node(operand),
            alias: alias.unwrap_or_else(|| generated_alias(counters)),
        })),
        other => Err(CompileError::Syntax(format!(
            "unexpected SELECT item {other:?}: '{}'",
            operand.text
        ))),
    }
}

fn generated_alias(counters: &mut Counters) -> String {
    counters.aliases += 1;
    format!("_alias_{}", counters.aliases)
}

/// Build a path variable from an `identified_path` node.
pub fn path_variable(node: &ParseNode) -> Result<PathVariable> {
    let identifier = node
        .child(Rule::identifier)
        .map(|i| i.text.clone())
        .ok_or_else(|| CompileError::Syntax(format!("missing identifier in '{}'", node.text)))?;
    let path = node.child(Rule::object_path).map(|p| AqlPath::parse(&p.text));
    Ok(PathVariable::new(identifier, path))
}

fn function_argument(node: &ParseNode, counters: &mut Counters) -> Result<FunctionParameter> {
    match node.rule {
        Rule::identified_path => {
            let mut variable = path_variable(node)?;
            variable.function_argument = true;
            if variable.column.len() > MAX_IDENTIFIER_LENGTH {
                counters.function_args += 1;
                variable.column = format!("_FCT_ARG_{}", counters.function_args);
            }
            Ok(FunctionParameter::Variable(variable))
        }
        Rule::literal => Ok(FunctionParameter::Operand(Literal::from_node(node).to_sql())),
        _ => Ok(FunctionParameter::Identifier(node.text.trim().to_string())),
    }
}

fn function(node: &ParseNode, alias: Option<String>, counters: &mut Counters) -> Result<FunctionDefinition> {
    let name = node
        .child(Rule::function_name)
        .map(|n| n.text.to_ascii_uppercase())
        .unwrap_or_default();
    if !ALLOWED_FUNCTIONS.contains(&name.as_str()) {
        return Err(CompileError::UnsupportedFunction(name));
    }

    let parameters = node
        .children
        .iter()
        .filter(|c| c.rule != Rule::function_name)
        .map(|c| function_argument(c, counters))
        .collect::<Result<Vec<_>>>()?;

    Ok(FunctionDefinition {
        alias: alias.unwrap_or_else(|| name.to_ascii_lowercase()),
        name,
        parameters,
    })
}

fn cast(node: &ParseNode, alias: Option<String>, counters: &mut Counters) -> Result<FunctionDefinition> {
    let value = node
        .children
        .iter()
        .find(|c| matches!(c.rule, Rule::identified_path | Rule::literal))
        .ok_or_else(|| CompileError::Syntax(format!("CAST without operand: '{}'", node.text)))?;
    let target = node
        .child(Rule::cast_type)
        .map(|t| t.text.trim().to_string())
        .ok_or_else(|| CompileError::Syntax(format!("CAST without type: '{}'", node.text)))?;

    Ok(FunctionDefinition {
        name: "CAST".to_string(),
        alias: alias.unwrap_or_else(|| "cast".to_string()),
        parameters: vec![
            function_argument(value, counters)?,
            FunctionParameter::Identifier(target),
        ],
    })
}

fn top_attributes(node: &ParseNode) -> Result<TopAttributes> {
    let count = node
        .child(Rule::integer)
        .map(|n| parse_count(&n.text))
        .transpose()?
        .unwrap_or_default();
    let direction = node
        .child(Rule::top_direction)
        .map(|d| match d.text.to_ascii_uppercase().as_str() {
            "BACKWARD" => TopDirection::Backward,
            _ => TopDirection::Forward,
        });
    Ok(TopAttributes { count, direction })
}

fn order_attribute(node: &ParseNode) -> Result<OrderAttribute> {
    let path = node
        .child(Rule::identified_path)
        .ok_or_else(|| CompileError::Syntax(format!("bad ORDER BY item '{}'", node.text)))?;
    let order = match node.child(Rule::order_direction) {
        Some(d) if d.text.to_ascii_uppercase().starts_with("DESC") => SortOrder::Desc,
        _ => SortOrder::Asc,
    };
    Ok(OrderAttribute {
        variable: path_variable(path)?,
        order,
    })
}

fn limit_offset(node: &ParseNode) -> Result<(Option<usize>, Option<usize>)> {
    let mut limit = None;
    let mut offset = None;
    let mut after_offset = false;
    for child in &node.children {
        match child.rule {
            Rule::limit_kw => after_offset = false,
            Rule::offset_kw => after_offset = true,
            Rule::integer if after_offset => offset = Some(parse_count(&child.text)?),
            Rule::integer => limit = Some(parse_count(&child.text)?),
            _ => {}
        }
    }
    Ok((limit, offset))
}

fn parse_count(text: &str) -> Result<usize> {
    text.trim()
        .parse()
        .map_err(|_| CompileError::InvalidQuery(format!("expected a non-negative integer, got '{text}'")))
}

/// Explicit aliases must be unique across non-function variables.
fn check_aliases(variables: &[Variable]) -> Result<()> {
    let mut seen = HashSet::new();
    for variable in variables.iter().filter(|v| !v.is_function()) {
        if let Some(alias) = variable.explicit_alias()
            && !seen.insert(alias)
        {
            return Err(CompileError::DuplicateAlias(alias.to_string()));
        }
    }
    Ok(())
}
