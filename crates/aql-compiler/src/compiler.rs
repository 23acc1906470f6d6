//! Compiler facade: AQL text in, SQL out.
//!
//! ```text
//! text ─▶ parameters ─▶ parse ─▶ pass 1 (FROM/CONTAINS) ─┐
//!                              ─▶ pass 2 (SELECT/ORDER)  ─┼─▶ statements ─▶ bind per template ─▶ SQL
//!                              ─▶ WHERE assembly         ─┘
//! ```

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::binding::{ContainmentBinding, QueryBinder, TemplateQuery, bind_containment};
use crate::config::CompilerConfig;
use crate::containment::resolve;
use crate::definition::{FunctionDefinition, FunctionParameter, Variable};
use crate::error::{CompileError, Result};
use crate::knowledge::{KnowledgeCache, TemplateId};
use crate::parameters::Parameters;
use crate::parser::parse_query;
use crate::projection::resolve_projection;
use crate::sql_builder::{
    BuiltQuery, INNER_ALIAS, Pagination, SelectField, SelectQueryBuilder, SortSpec, SuperQuery,
    quote_alias,
};
use crate::statements::{OrderColumn, Statements};
use crate::terminology::TerminologyService;
use crate::where_clause::WhereAssembler;

/// One column of the result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultColumn {
    pub alias: String,
    /// Selected only to sort by; not part of the caller's result.
    pub hidden: bool,
}

/// Everything compilation produced for one query.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub templates: Vec<TemplateQuery>,
    pub columns: Vec<ResultColumn>,
    pub order_by: Vec<OrderColumn>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub containment: ContainmentBinding,
    /// The final statement.
    pub sql: BuiltQuery,
}

impl CompiledQuery {
    pub fn template_ids(&self) -> impl Iterator<Item = &str> {
        self.templates.iter().filter_map(|t| t.template_id.as_deref())
    }
}

/// Compiles AQL queries against a knowledge cache and a terminology
/// service. Holds no per-query state.
pub struct AqlCompiler<'a> {
    config: CompilerConfig,
    knowledge: &'a dyn KnowledgeCache,
    terminology: &'a dyn TerminologyService,
}

impl<'a> AqlCompiler<'a> {
    pub fn new(
        config: CompilerConfig,
        knowledge: &'a dyn KnowledgeCache,
        terminology: &'a dyn TerminologyService,
    ) -> Self {
        Self {
            config,
            knowledge,
            terminology,
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn compile(&self, text: &str, parameters: &Parameters) -> Result<CompiledQuery> {
        self.config.validate()?;

        let text = parameters.substitute(text)?;
        let tree = parse_query(&text)?;
        debug!(nodes = tree.children.len(), "query parsed");

        let resolution = resolve(&tree)?;
        let projection = resolve_projection(&tree)?;
        let where_clause = WhereAssembler::new(self.terminology).assemble(&tree)?;
        let statements = Statements::build(
            projection,
            where_clause,
            &resolution.mapper,
            resolution.has_contains,
        )?;
        let containment = bind_containment(&resolution)?;

        let binder = QueryBinder::new(
            &self.config,
            self.knowledge,
            &resolution,
            &statements,
            &containment,
        );
        let templates = self.bind_templates(&binder, &statements, &containment)?;
        let sql = assemble(&templates, &statements)?;
        debug!(templates = templates.len(), sql = %sql, "query compiled");

        Ok(CompiledQuery {
            columns: statements
                .variables
                .iter()
                .map(|v| ResultColumn {
                    alias: v.column().to_string(),
                    hidden: v.is_hidden(),
                })
                .collect(),
            order_by: statements.order_by.clone(),
            limit: statements.limit,
            offset: statements.offset,
            templates,
            containment,
            sql,
        })
    }

    fn bind_templates(
        &self,
        binder: &QueryBinder<'_>,
        statements: &Statements,
        containment: &ContainmentBinding,
    ) -> Result<Vec<TemplateQuery>> {
        let needs_template = binder.needs_template();
        let Some(expr) = containment.expr.as_ref() else {
            return Ok(vec![binder.bind(None)?]);
        };
        if !needs_template && containment.query.is_none() {
            return Ok(vec![binder.bind(None)?]);
        }

        let candidates = self.knowledge.resolve_templates(expr)?;
        debug!(templates = candidates.len(), needs_template, "templates resolved");
        if candidates.len() > self.config.max_templates {
            return Err(CompileError::InvalidQuery(format!(
                "query matches {} templates, more than the limit of {}",
                candidates.len(),
                self.config.max_templates
            )));
        }

        if candidates.is_empty() {
            if needs_template {
                let variable = statements
                    .variables
                    .iter()
                    .flat_map(Variable::path_variables)
                    .map(|v| v.text())
                    .next()
                    .unwrap_or_else(|| statements.where_clause.render());
                return Err(CompileError::unknown_variable(variable, "*"));
            }
            return Ok(vec![binder.bind_empty()?]);
        }
        if !needs_template {
            return Ok(vec![binder.bind(None)?]);
        }

        bind_each(binder, candidates)
    }
}

/// Bind every candidate template, skipping those a path does not bind in.
fn bind_each(
    binder: &QueryBinder<'_>,
    candidates: impl IntoIterator<Item = TemplateId>,
) -> Result<Vec<TemplateQuery>> {
    let mut bound = Vec::new();
    let mut last_error = None;
    for template in candidates {
        match binder.bind(Some(template.clone())) {
            Ok(query) => bound.push(query),
            Err(err @ CompileError::UnknownVariable { .. }) => {
                warn!(template = %template, error = %err, "template skipped");
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    match (bound.is_empty(), last_error) {
        (true, Some(err)) => Err(err),
        _ => Ok(bound),
    }
}

/// Combine the per-template queries and apply post-processing.
fn assemble(templates: &[TemplateQuery], statements: &Statements) -> Result<BuiltQuery> {
    let needs_outer = !statements.order_by.is_empty()
        || statements.limit.is_some()
        || statements.offset.is_some();

    let mut outer = if statements.has_functions() {
        let inner = union(templates)?;
        aggregate(statements)?.wrap(&inner)
    } else if statements.distinct {
        let inner = union(templates)?;
        let on = statements
            .visible_columns()
            .map(quote_alias)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let distinct = SuperQuery::Distinct { on }.wrap(&inner);
        if statements.order_by.is_empty() {
            distinct
        } else {
            // DISTINCT ON fixes the leading sort keys; sort in a wrapper.
            SelectQueryBuilder::new()
                .from_subquery(&distinct.build()?, INNER_ALIAS)
                .field(SelectField::new("*"))
        }
    } else if let [single] = templates {
        single.builder.clone()
    } else if needs_outer {
        SelectQueryBuilder::new()
            .from_subquery(&union(templates)?, INNER_ALIAS)
            .field(SelectField::new("*"))
    } else {
        return union(templates);
    };

    for OrderColumn { column, order } in &statements.order_by {
        outer = outer.order_by(SortSpec::new(quote_alias(column)?, *order));
    }
    outer = outer.paginate(Pagination::new(
        statements.limit,
        statements.offset.unwrap_or_default(),
    ));
    Ok(outer.build()?)
}

fn union(templates: &[TemplateQuery]) -> Result<BuiltQuery> {
    let built = templates
        .iter()
        .map(|t| t.builder.build())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    BuiltQuery::union_all(&built)
        .ok_or_else(|| CompileError::InvalidQuery("no template query to combine".to_string()))
}

/// Super-query re-selecting function results by alias and passing the
/// other columns through.
fn aggregate(statements: &Statements) -> Result<SuperQuery> {
    let function_aliases: HashSet<&str> = statements
        .variables
        .iter()
        .filter_map(|v| match v {
            Variable::Function(f) => Some(f.alias.as_str()),
            _ => None,
        })
        .collect();

    let grouped = statements
        .variables
        .iter()
        .any(|v| matches!(v, Variable::Function(f) if f.is_aggregate()));

    let mut fields = Vec::new();
    let mut passthrough = Vec::new();
    for variable in &statements.variables {
        match variable {
            Variable::Function(function) => {
                fields.push(SelectField::aliased(function_sql(function)?, &function.alias));
            }
            Variable::Path(path) if path.function_argument => {}
            // Hidden sort columns are never grouped.
            Variable::Path(path) if path.hidden => {
                if grouped {
                    return Err(CompileError::InvalidQuery(format!(
                        "ORDER BY {path} must be selected in an aggregate query"
                    )));
                }
                fields.push(SelectField::aliased(quote_alias(&path.column)?, &path.column));
            }
            other if function_aliases.contains(other.column()) => {}
            other => {
                let column = quote_alias(other.column())?;
                fields.push(SelectField::aliased(column.clone(), other.column()));
                passthrough.push(column);
            }
        }
    }

    Ok(SuperQuery::Aggregate {
        fields,
        group_by: if grouped { passthrough } else { Vec::new() },
    })
}

/// `NAME(arg, ...)` over inner query columns, or `CAST(arg AS type)`.
fn function_sql(function: &FunctionDefinition) -> Result<String> {
    let arguments = function
        .parameters
        .iter()
        .map(|p| match p {
            FunctionParameter::Variable(v) => quote_alias(&v.column),
            FunctionParameter::Operand(value) | FunctionParameter::Identifier(value) => {
                Ok(value.clone())
            }
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(match (function.name.as_str(), arguments.as_slice()) {
        ("CAST", [value, target]) => format!("CAST({value} AS {target})"),
        (name, arguments) => format!("{name}({})", arguments.join(", ")),
    })
}
