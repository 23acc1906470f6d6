//! SQL builder for the compiled AQL queries.
//!
//! A small fluent builder over the SELECT statement shapes the binder
//! produces: a projection over an anchor table with a join graph, lateral
//! expansions of JSON arrays, a WHERE condition and the post-processing
//! wrappers (`SELECT DISTINCT ON`, aggregate super-queries, `UNION ALL`).
//!
//! Literals are already rendered by the compiler; the builder only
//! validates and quotes identifiers.

use std::fmt;

use thiserror::Error;

/// Errors that can occur during SQL building.
#[derive(Debug, Error)]
pub enum SqlBuilderError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Query too complex: {0}")]
    QueryTooComplex(String),

    #[error("Query has no FROM source")]
    MissingSource,

    #[error("Query selects no columns")]
    EmptyProjection,
}

/// Maximum number of joins (tables plus laterals) in one statement.
const MAX_JOINS: usize = 32;

/// Maximum number of top-level WHERE conditions.
const MAX_CONDITIONS: usize = 100;

/// Longest identifier the storage engine keeps without truncation.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

// ============================================================================
// Identifiers
// ============================================================================

/// Validate a schema, table or column name.
///
/// Only allows alphanumeric characters and underscores.
fn validate_identifier(name: &str) -> Result<(), SqlBuilderError> {
    if name.is_empty() {
        return Err(SqlBuilderError::InvalidIdentifier(
            "Empty identifier".to_string(),
        ));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SqlBuilderError::InvalidIdentifier(name.to_string()));
    }

    Ok(())
}

/// Escape a PostgreSQL identifier (table name, column name).
pub fn escape_identifier(name: &str) -> Result<String, SqlBuilderError> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

/// Quote a column alias. Aliases may carry path text, so embedded double
/// quotes are doubled instead of rejected.
pub fn quote_alias(alias: &str) -> Result<String, SqlBuilderError> {
    if alias.is_empty() || alias.contains('\0') {
        return Err(SqlBuilderError::InvalidIdentifier(alias.to_string()));
    }
    if alias.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SqlBuilderError::InvalidIdentifier(format!(
            "alias longer than {MAX_IDENTIFIER_LENGTH} characters: {alias}"
        )));
    }
    Ok(format!("\"{}\"", alias.replace('"', "\"\"")))
}

/// `"table"."column"` for trusted, compile-time names.
pub fn column_ref(table: &str, column: &str) -> String {
    format!("\"{table}\".\"{column}\"")
}

// ============================================================================
// Sources and joins
// ============================================================================

/// A physical table, optionally aliased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            alias: None,
        }
    }

    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name columns are qualified with: the alias, or `schema.table`.
    pub fn reference(&self) -> String {
        match &self.alias {
            Some(alias) => format!("\"{alias}\""),
            None => format!("\"{}\".\"{}\"", self.schema, self.table),
        }
    }

    fn to_sql(&self) -> Result<String, SqlBuilderError> {
        let base = format!(
            "{}.{}",
            escape_identifier(&self.schema)?,
            escape_identifier(&self.table)?
        );
        match &self.alias {
            Some(alias) => Ok(format!("{base} AS {}", escape_identifier(alias)?)),
            None => Ok(base),
        }
    }
}

/// FROM source of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromSource {
    Table(TableRef),
    Subquery { sql: String, alias: String },
}

impl FromSource {
    fn to_sql(&self) -> Result<String, SqlBuilderError> {
        match self {
            Self::Table(table) => table.to_sql(),
            Self::Subquery { sql, alias } => {
                Ok(format!("({sql}) AS {}", escape_identifier(alias)?))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    RightOuter,
}

impl JoinKind {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::LeftOuter => "LEFT OUTER JOIN",
            Self::RightOuter => "RIGHT OUTER JOIN",
        }
    }
}

/// A table join with its ON condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpec {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: String,
}

impl JoinSpec {
    pub fn new(kind: JoinKind, table: TableRef, on: impl Into<String>) -> Self {
        Self {
            kind,
            table,
            on: on.into(),
        }
    }
}

/// `LEFT JOIN LATERAL (<query>) AS "<alias>" ON true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateralSpec {
    pub alias: String,
    pub query: String,
}

// ============================================================================
// Projection, sort and pagination
// ============================================================================

/// One projected expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectField {
    pub expression: String,
    pub alias: Option<String>,
}

impl SelectField {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            alias: None,
        }
    }

    pub fn aliased(expression: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            alias: Some(alias.into()),
        }
    }

    fn to_sql(&self) -> Result<String, SqlBuilderError> {
        match &self.alias {
            Some(alias) => Ok(format!("{} AS {}", self.expression, quote_alias(alias)?)),
            None => Ok(self.expression.clone()),
        }
    }
}

/// Sort order for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Sort specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub expression: String,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn new(expression: impl Into<String>, order: SortOrder) -> Self {
        Self {
            expression: expression.into(),
            order,
        }
    }
}

/// Pagination settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Pagination {
    pub fn new(limit: Option<usize>, offset: usize) -> Self {
        Self { limit, offset }
    }
}

// ============================================================================
// Select Query Builder
// ============================================================================

/// Builder for one SELECT statement.
///
/// # Example
///
/// ```
/// use aql_compiler::sql_builder::{SelectField, SelectQueryBuilder, TableRef};
///
/// let query = SelectQueryBuilder::new()
///     .from(TableRef::new("ehr", "ehr").aliased("ehr_join"))
///     .field(SelectField::aliased("\"ehr_join\".\"id\"", "e/ehr_id/value"))
///     .where_condition("\"ehr_join\".\"id\" = '7d44b88c'")
///     .build()
///     .unwrap();
///
/// assert!(query.sql.starts_with("SELECT \"ehr_join\".\"id\""));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SelectQueryBuilder {
    distinct: bool,
    distinct_on: Vec<String>,
    fields: Vec<SelectField>,
    from: Option<FromSource>,
    joins: Vec<JoinSpec>,
    laterals: Vec<LateralSpec>,
    conditions: Vec<String>,
    group_by: Vec<String>,
    order_by: Vec<SortSpec>,
    pagination: Pagination,
}

impl SelectQueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: SelectField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = SelectField>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn from(mut self, table: TableRef) -> Self {
        self.from = Some(FromSource::Table(table));
        self
    }

    pub fn from_subquery(mut self, inner: &BuiltQuery, alias: impl Into<String>) -> Self {
        self.from = Some(FromSource::Subquery {
            sql: inner.sql.clone(),
            alias: alias.into(),
        });
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    pub fn lateral(mut self, lateral: LateralSpec) -> Self {
        self.laterals.push(lateral);
        self
    }

    pub fn where_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn distinct_on(mut self, expressions: impl IntoIterator<Item = String>) -> Self {
        self.distinct_on.extend(expressions);
        self
    }

    pub fn group_by(mut self, expressions: impl IntoIterator<Item = String>) -> Self {
        self.group_by.extend(expressions);
        self
    }

    pub fn order_by(mut self, spec: SortSpec) -> Self {
        self.order_by.push(spec);
        self
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn selected(&self) -> &[SelectField] {
        &self.fields
    }

    pub fn source(&self) -> Option<&FromSource> {
        self.from.as_ref()
    }

    pub fn joins(&self) -> &[JoinSpec] {
        &self.joins
    }

    pub fn laterals(&self) -> &[LateralSpec] {
        &self.laterals
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    /// Validate the query complexity.
    fn validate(&self) -> Result<(), SqlBuilderError> {
        if self.fields.is_empty() {
            return Err(SqlBuilderError::EmptyProjection);
        }

        if self.conditions.len() > MAX_CONDITIONS {
            return Err(SqlBuilderError::QueryTooComplex(format!(
                "Too many conditions: {} (max {})",
                self.conditions.len(),
                MAX_CONDITIONS
            )));
        }

        let joins = self.joins.len() + self.laterals.len();
        if joins > MAX_JOINS {
            return Err(SqlBuilderError::QueryTooComplex(format!(
                "Too many JOINs: {joins} (max {MAX_JOINS})"
            )));
        }

        Ok(())
    }

    /// Build the SQL statement.
    pub fn build(&self) -> Result<BuiltQuery, SqlBuilderError> {
        self.validate()?;

        let mut sql = String::from("SELECT ");
        if !self.distinct_on.is_empty() {
            sql.push_str(&format!("DISTINCT ON ({}) ", self.distinct_on.join(", ")));
        } else if self.distinct {
            sql.push_str("DISTINCT ");
        }

        let fields = self
            .fields
            .iter()
            .map(SelectField::to_sql)
            .collect::<Result<Vec<_>, _>>()?;
        sql.push_str(&fields.join(", "));

        let from = self.from.as_ref().ok_or(SqlBuilderError::MissingSource)?;
        sql.push_str(" FROM ");
        sql.push_str(&from.to_sql()?);

        for join in &self.joins {
            sql.push_str(&format!(
                " {} {} ON {}",
                join.kind.as_sql(),
                join.table.to_sql()?,
                join.on
            ));
        }

        for lateral in &self.laterals {
            sql.push_str(&format!(
                " LEFT JOIN LATERAL ({}) AS {} ON true",
                lateral.query,
                escape_identifier(&lateral.alias)?
            ));
        }

        if let Some(where_sql) = self.build_where_clause() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }

        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }

        let order_clause = self.build_order_clause();
        if !order_clause.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_clause);
        }

        let limit_clause = build_limit_clause(self.pagination);
        if !limit_clause.is_empty() {
            sql.push(' ');
            sql.push_str(&limit_clause);
        }

        Ok(BuiltQuery { sql })
    }

    fn build_where_clause(&self) -> Option<String> {
        match self.conditions.as_slice() {
            [] => None,
            [single] => Some(single.clone()),
            many => Some(
                many.iter()
                    .map(|c| format!("({c})"))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            ),
        }
    }

    fn build_order_clause(&self) -> String {
        self.order_by
            .iter()
            .map(|s| format!("{} {}", s.expression, s.order.as_sql()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn build_limit_clause(pagination: Pagination) -> String {
    let mut clause = String::new();

    if let Some(limit) = pagination.limit {
        clause.push_str(&format!("LIMIT {limit}"));
    }

    if pagination.offset > 0 {
        if !clause.is_empty() {
            clause.push(' ');
        }
        clause.push_str(&format!("OFFSET {}", pagination.offset));
    }

    clause
}

// ============================================================================
// Super queries
// ============================================================================

/// Alias of the inner query inside a super-query.
pub const INNER_ALIAS: &str = "_aql_inner";

/// Wrapper re-selecting from a built inner query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperQuery {
    /// `SELECT DISTINCT ON (<columns>) * FROM (<inner>)`.
    Distinct { on: Vec<String> },
    /// Re-select function results and pass other columns through, grouped by
    /// the passed-through columns.
    Aggregate {
        fields: Vec<SelectField>,
        group_by: Vec<String>,
    },
}

impl SuperQuery {
    /// Builder selecting from `inner`; ORDER BY and pagination are left to
    /// the caller.
    pub fn wrap(&self, inner: &BuiltQuery) -> SelectQueryBuilder {
        let builder = SelectQueryBuilder::new().from_subquery(inner, INNER_ALIAS);
        match self {
            Self::Distinct { on } => builder
                .distinct_on(on.iter().cloned())
                .field(SelectField::new("*")),
            Self::Aggregate { fields, group_by } => builder
                .fields(fields.iter().cloned())
                .group_by(group_by.iter().cloned()),
        }
    }
}

/// A built SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltQuery {
    pub sql: String,
}

impl BuiltQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// Combine statements with `UNION ALL`; a single statement is returned
    /// unchanged.
    pub fn union_all(queries: &[BuiltQuery]) -> Option<BuiltQuery> {
        match queries {
            [] => None,
            [single] => Some(single.clone()),
            many => Some(BuiltQuery {
                sql: many
                    .iter()
                    .map(|q| format!("({})", q.sql))
                    .collect::<Vec<_>>()
                    .join(" UNION ALL "),
            }),
        }
    }
}

impl fmt::Display for BuiltQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> TableRef {
        TableRef::new("ehr", "entry")
    }

    #[test]
    fn test_escape_identifier() {
        assert_eq!(escape_identifier("composition_join").unwrap(), "\"composition_join\"");
        assert!(escape_identifier("bad;drop").is_err());
        assert!(escape_identifier("").is_err());
    }

    #[test]
    fn test_quote_alias_keeps_path_text() {
        assert_eq!(quote_alias("c/uid/value").unwrap(), "\"c/uid/value\"");
        assert_eq!(quote_alias("a\"b").unwrap(), "\"a\"\"b\"");
        assert!(quote_alias(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_table_reference() {
        assert_eq!(entry().reference(), "\"ehr\".\"entry\"");
        let aliased = TableRef::new("ehr", "composition").aliased("composition_join");
        assert_eq!(aliased.reference(), "\"composition_join\"");
        assert_eq!(
            aliased.to_sql().unwrap(),
            "\"ehr\".\"composition\" AS \"composition_join\""
        );
    }

    #[test]
    fn test_select_query_builder_basic() {
        let query = SelectQueryBuilder::new()
            .from(entry())
            .field(SelectField::aliased("\"ehr\".\"entry\".\"name\"", "name"))
            .build()
            .unwrap();
        assert_eq!(
            query.sql,
            "SELECT \"ehr\".\"entry\".\"name\" AS \"name\" FROM \"ehr\".\"entry\""
        );
    }

    #[test]
    fn test_select_query_builder_joins_and_conditions() {
        let query = SelectQueryBuilder::new()
            .from(entry())
            .field(SelectField::new("1"))
            .join(JoinSpec::new(
                JoinKind::RightOuter,
                TableRef::new("ehr", "composition").aliased("composition_join"),
                "\"composition_join\".\"id\" = \"ehr\".\"entry\".\"composition_id\"",
            ))
            .lateral(LateralSpec {
                alias: "array_1".into(),
                query: "SELECT jsonb_array_elements(x) AS \"var_1\"".into(),
            })
            .where_condition("a = 1")
            .where_condition("b = 2")
            .build()
            .unwrap();

        assert!(query.sql.contains("RIGHT OUTER JOIN \"ehr\".\"composition\" AS \"composition_join\""));
        assert!(query.sql.contains("LEFT JOIN LATERAL (SELECT jsonb_array_elements(x) AS \"var_1\") AS \"array_1\" ON true"));
        assert!(query.sql.ends_with("WHERE (a = 1) AND (b = 2)"));
    }

    #[test]
    fn test_select_query_builder_order_and_limit() {
        let query = SelectQueryBuilder::new()
            .from(entry())
            .field(SelectField::new("1"))
            .order_by(SortSpec::new("\"x\"", SortOrder::Desc))
            .paginate(Pagination::new(Some(10), 5))
            .build()
            .unwrap();
        assert!(query.sql.ends_with("ORDER BY \"x\" DESC LIMIT 10 OFFSET 5"));

        let query = SelectQueryBuilder::new()
            .from(entry())
            .field(SelectField::new("1"))
            .paginate(Pagination::new(None, 3))
            .build()
            .unwrap();
        assert!(query.sql.ends_with("OFFSET 3"));
        assert!(!query.sql.contains("LIMIT"));
    }

    #[test]
    fn test_empty_projection_and_missing_source() {
        let err = SelectQueryBuilder::new().from(entry()).build().unwrap_err();
        assert!(matches!(err, SqlBuilderError::EmptyProjection));

        let err = SelectQueryBuilder::new()
            .field(SelectField::new("1"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SqlBuilderError::MissingSource));
    }

    #[test]
    fn test_too_many_joins() {
        let mut builder = SelectQueryBuilder::new().from(entry()).field(SelectField::new("1"));
        for i in 0..=MAX_JOINS {
            builder = builder.lateral(LateralSpec {
                alias: format!("array_{i}"),
                query: "SELECT 1".into(),
            });
        }
        assert!(matches!(
            builder.build(),
            Err(SqlBuilderError::QueryTooComplex(_))
        ));
    }

    #[test]
    fn test_super_queries() {
        let inner = BuiltQuery::new("SELECT 1 AS \"a\"");
        let distinct = SuperQuery::Distinct {
            on: vec!["\"a\"".into()],
        }
        .wrap(&inner)
        .build()
        .unwrap();
        assert_eq!(
            distinct.sql,
            "SELECT DISTINCT ON (\"a\") * FROM (SELECT 1 AS \"a\") AS \"_aql_inner\""
        );

        let aggregate = SuperQuery::Aggregate {
            fields: vec![
                SelectField::aliased("COUNT(\"a\")", "count"),
                SelectField::new("\"b\""),
            ],
            group_by: vec!["\"b\"".into()],
        }
        .wrap(&inner)
        .build()
        .unwrap();
        assert!(aggregate.sql.starts_with("SELECT COUNT(\"a\") AS \"count\", \"b\" FROM ("));
        assert!(aggregate.sql.ends_with("GROUP BY \"b\""));
    }

    #[test]
    fn test_union_all() {
        let a = BuiltQuery::new("SELECT 1");
        let b = BuiltQuery::new("SELECT 2");
        assert_eq!(BuiltQuery::union_all(std::slice::from_ref(&a)).unwrap(), a);
        assert_eq!(
            BuiltQuery::union_all(&[a, b]).unwrap().to_string(),
            "(SELECT 1) UNION ALL (SELECT 2)"
        );
        assert!(BuiltQuery::union_all(&[]).is_none());
    }
}
