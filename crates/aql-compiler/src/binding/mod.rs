//! Pass 3: binding resolved statements to SQL, once per template.

pub mod attributes;
pub mod contain;
pub mod dialect;
pub mod field;
pub mod join;
pub mod lateral;
pub mod where_binder;

use std::collections::HashSet;

use tracing::debug;

pub use contain::{ContainmentBinding, ContainmentQuery, SetOperator, bind_containment};
pub use field::{FieldBinding, FieldSource, TemplateBinder, path_requires_template, requires_template};
pub use join::{JoinGroup, JoinSetup};
pub use lateral::{LateralJoin, LateralJoins};
pub use where_binder::WhereBinder;

use crate::config::CompilerConfig;
use crate::containment::ContainmentResolution;
use crate::definition::Variable;
use crate::error::Result;
use crate::knowledge::{KnowledgeCache, TemplateId};
use crate::literal::quote;
use crate::sql_builder::{SelectField, SelectQueryBuilder};
use crate::statements::Statements;

/// Condition selecting nothing.
pub const NO_ROWS: &str = "1 = 0";

/// Placeholder column of a query that projects only aggregates over rows.
const ROW_ALIAS: &str = "_row";

/// The query bound for one template.
#[derive(Debug, Clone)]
pub struct TemplateQuery {
    /// `None` when no variable depends on a template.
    pub template_id: Option<TemplateId>,
    pub builder: SelectQueryBuilder,
    /// Rows must be restricted to `template_id` by the caller's query.
    pub requires_template_filter: bool,
}

/// Binds the statements of one query against any number of templates.
pub struct QueryBinder<'a> {
    config: &'a CompilerConfig,
    knowledge: &'a dyn KnowledgeCache,
    resolution: &'a ContainmentResolution,
    statements: &'a Statements,
    containment: &'a ContainmentBinding,
}

impl<'a> QueryBinder<'a> {
    pub fn new(
        config: &'a CompilerConfig,
        knowledge: &'a dyn KnowledgeCache,
        resolution: &'a ContainmentResolution,
        statements: &'a Statements,
        containment: &'a ContainmentBinding,
    ) -> Self {
        Self {
            config,
            knowledge,
            resolution,
            statements,
            containment,
        }
    }

    /// Whether any SELECT, ORDER BY or WHERE variable needs a template.
    pub fn needs_template(&self) -> bool {
        let mapper = &self.resolution.mapper;
        self.statements
            .variables
            .iter()
            .any(|v| requires_template(v, mapper))
            || self
                .statements
                .where_clause
                .variables()
                .any(|v| path_requires_template(v, mapper))
    }

    pub fn bind(&self, template: Option<TemplateId>) -> Result<TemplateQuery> {
        self.bind_with(template, false)
    }

    /// A query of the right shape that returns no rows.
    pub fn bind_empty(&self) -> Result<TemplateQuery> {
        self.bind_with(None, true)
    }

    fn bind_with(&self, template: Option<TemplateId>, empty: bool) -> Result<TemplateQuery> {
        let schema = self.config.schema.as_str();
        let mut binder = TemplateBinder::new(
            self.config,
            self.knowledge,
            &self.resolution.mapper,
            template.clone(),
        );

        let fields = if empty {
            self.placeholder_fields()
        } else {
            self.fields(&mut binder)?
        };

        let mut conditions = Vec::new();
        if empty {
            conditions.push(NO_ROWS.to_string());
        } else if let Some(condition) =
            WhereBinder::new(&mut binder, self.config.use_jsquery).bind(&self.statements.where_clause)?
        {
            conditions.push(condition);
        }

        if let Some(filter) = self.containment.filter(schema) {
            binder.require(JoinGroup::Entry);
            conditions.push(filter);
        }

        let requires_template_filter =
            template.is_some() && self.resolution.requires_template_where_clause;
        if let Some(template_id) = template.as_deref()
            && requires_template_filter
        {
            binder.require(JoinGroup::Entry);
            conditions.push(format!(
                "{} = {}",
                JoinGroup::Entry.column(schema, "template_id"),
                quote(template_id)
            ));
        }

        let plan = binder.joins().plan(schema, self.resolution.has_contains);
        let mut builder = SelectQueryBuilder::new().from(plan.from);
        for join in plan.joins {
            builder = builder.join(join);
        }
        for lateral in binder.laterals().specs() {
            builder = builder.lateral(lateral);
        }
        builder = if fields.is_empty() {
            builder.field(SelectField::aliased("1", ROW_ALIAS))
        } else {
            builder.fields(fields)
        };
        for condition in conditions {
            builder = builder.where_condition(condition);
        }

        debug!(
            template = template.as_deref().unwrap_or("*"),
            joins = builder.joins().len(),
            laterals = builder.laterals().len(),
            conditions = builder.conditions().len(),
            "template bound"
        );
        Ok(TemplateQuery {
            template_id: template,
            builder,
            requires_template_filter,
        })
    }

    /// Inner query columns: path variables by column name, function
    /// arguments once each, constants and extensions by alias.
    fn fields(&self, binder: &mut TemplateBinder<'_>) -> Result<Vec<SelectField>> {
        let mut fields = Vec::new();
        let mut seen = HashSet::new();

        for variable in &self.statements.variables {
            match variable {
                Variable::Path(path) => {
                    let bound = binder.bind(path)?;
                    if seen.insert(path.column.clone()) {
                        fields.push(SelectField::aliased(bound.expression, &path.column));
                    }
                }
                Variable::Function(function) => {
                    for argument in function.arguments() {
                        let bound = binder.bind(argument)?;
                        if seen.insert(argument.column.clone()) {
                            fields.push(SelectField::aliased(bound.expression, &argument.column));
                        }
                    }
                }
                Variable::Constant(constant) => {
                    fields.push(SelectField::aliased(constant.value.to_sql(), &constant.alias));
                }
                Variable::Extension(extension) => {
                    fields.push(SelectField::aliased(&extension.expression, &extension.alias));
                }
            }
        }
        Ok(fields)
    }

    /// NULL columns under the same names as [`Self::fields`].
    fn placeholder_fields(&self) -> Vec<SelectField> {
        let mut seen = HashSet::new();
        self.statements
            .variables
            .iter()
            .flat_map(|v| match v {
                Variable::Function(f) => f.arguments().map(|a| a.column.clone()).collect(),
                other => vec![other.column().to_string()],
            })
            .filter(|column| seen.insert(column.clone()))
            .map(|column| SelectField::aliased("NULL", column))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containment::resolve;
    use crate::knowledge::{InMemoryKnowledgeCache, TemplateDefinition};
    use crate::parser::parse_query;
    use crate::projection::resolve_projection;
    use crate::terminology::DisabledTerminology;
    use crate::where_clause::WhereAssembler;

    fn knowledge() -> InMemoryKnowledgeCache {
        let template: TemplateDefinition = serde_json::from_value(serde_json::json!({
            "template_id": "vitals.v1",
            "root_archetype": "openEHR-EHR-COMPOSITION.encounter.v1",
            "nodes": [
                {
                    "path": "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]",
                    "archetype_id": "openEHR-EHR-OBSERVATION.blood_pressure.v1",
                    "class_name": "OBSERVATION",
                    "json_path": ["/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]", 0]
                }
            ]
        }))
        .unwrap();
        InMemoryKnowledgeCache::new().with_template(template)
    }

    fn bind(query: &str, template: Option<&str>) -> Result<TemplateQuery> {
        let tree = parse_query(query)?;
        let resolution = resolve(&tree)?;
        let projection = resolve_projection(&tree)?;
        let where_clause = WhereAssembler::new(&DisabledTerminology).assemble(&tree)?;
        let statements = Statements::build(
            projection,
            where_clause,
            &resolution.mapper,
            resolution.has_contains,
        )?;
        let containment = bind_containment(&resolution)?;
        let config = CompilerConfig::default();
        let knowledge = knowledge();
        let binder = QueryBinder::new(&config, &knowledge, &resolution, &statements, &containment);
        binder.bind(template.map(str::to_string))
    }

    #[test]
    fn test_relational_only_query() {
        let query = bind(
            "SELECT c/name/value AS name, e/ehr_id/value FROM EHR e CONTAINS COMPOSITION c",
            None,
        )
        .unwrap();
        let sql = query.builder.build().unwrap().sql;
        assert!(sql.starts_with("SELECT \"ehr\".\"entry\".\"name\" AS \"name\", \"ehr_join\".\"id\" AS \"e/ehr_id/value\""));
        assert!(sql.contains(" FROM \"ehr\".\"entry\" "));
        assert!(sql.contains("RIGHT OUTER JOIN \"ehr\".\"ehr\" AS \"ehr_join\""));
        assert!(!query.requires_template_filter);
    }

    #[test]
    fn test_template_filter_and_containment_condition() {
        let query = bind(
            "SELECT o/data[at0001]/origin/value FROM EHR e CONTAINS COMPOSITION c \
             CONTAINS OBSERVATION o[openEHR-EHR-OBSERVATION.blood_pressure.v1]",
            Some("vitals.v1"),
        )
        .unwrap();
        assert!(query.requires_template_filter);
        let conditions = query.builder.conditions();
        assert_eq!(conditions.len(), 2);
        assert!(conditions[0].starts_with("\"ehr\".\"entry\".\"composition_id\" IN (SELECT DISTINCT \"comp_id\""));
        assert_eq!(conditions[1], "\"ehr\".\"entry\".\"template_id\" = 'vitals.v1'");
    }

    #[test]
    fn test_function_arguments_are_projected_once() {
        let query = bind(
            "SELECT c/name/value, COUNT(c/name/value), MAX(c/name/value) FROM EHR e CONTAINS COMPOSITION c",
            None,
        )
        .unwrap();
        assert_eq!(query.builder.selected().len(), 1);
    }

    #[test]
    fn test_aggregate_only_query_projects_placeholder() {
        let query = bind("SELECT COUNT(*) FROM EHR e CONTAINS COMPOSITION c", None).unwrap();
        let sql = query.builder.build().unwrap().sql;
        assert!(sql.starts_with("SELECT 1 AS \"_row\" FROM"));
    }

    #[test]
    fn test_constants_and_extensions() {
        let query = bind(
            "SELECT 'x' AS label, EXTENSION('sql', 'now()') AS ts FROM EHR e CONTAINS COMPOSITION c",
            None,
        )
        .unwrap();
        let sql = query.builder.build().unwrap().sql;
        assert!(sql.starts_with("SELECT 'x' AS \"label\", now() AS \"ts\""));
    }
}
