//! Lateral joins for set-returning field expressions.

use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use tracing::trace;

use crate::knowledge::TemplateId;
use crate::sql_builder::{LateralSpec, column_ref};

/// Shared by every compilation in the process so aliases never collide.
static LATERAL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_index() -> u64 {
    LATERAL_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// One `LEFT JOIN LATERAL (SELECT <source> AS "var_N") AS "array_N" ON true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateralJoin {
    pub alias: String,
    pub column: String,
    /// The set-returning expression before wrapping.
    pub source: String,
}

impl LateralJoin {
    fn new(source: &str) -> Self {
        let index = next_index();
        Self {
            alias: format!("array_{index}"),
            column: format!("var_{index}"),
            source: source.to_string(),
        }
    }

    /// Column downstream expressions select from.
    pub fn reference(&self) -> String {
        column_ref(&self.alias, &self.column)
    }

    pub fn spec(&self) -> LateralSpec {
        LateralSpec {
            alias: self.alias.clone(),
            query: format!("SELECT {} AS \"{}\"", self.source, self.column),
        }
    }
}

/// Lateral joins created while binding one template, keyed by their source.
#[derive(Debug, Clone, Default)]
pub struct LateralJoins {
    joins: IndexMap<(Option<TemplateId>, String), LateralJoin>,
}

impl LateralJoins {
    pub fn new() -> Self {
        Self::default()
    }

    /// The join wrapping `source`, created on first request.
    pub fn resolve(&mut self, template: Option<&str>, source: &str) -> &LateralJoin {
        let key = (template.map(str::to_string), source.to_string());
        if self.joins.contains_key(&key) {
            trace!(%source, "reusing lateral join");
        }
        self.joins.entry(key).or_insert_with(|| {
            let join = LateralJoin::new(source);
            trace!(alias = %join.alias, %source, "lateral join created");
            join
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &LateralJoin> {
        self.joins.values()
    }

    pub fn specs(&self) -> Vec<LateralSpec> {
        self.iter().map(LateralJoin::spec).collect()
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_source_reuses_join() {
        let mut laterals = LateralJoins::new();
        let source = "jsonb_array_elements(\"ehr\".\"entry\".\"entry\" #> '{\"/events\"}')";
        let first = laterals.resolve(Some("t1"), source).clone();
        let second = laterals.resolve(Some("t1"), source).clone();
        assert_eq!(first, second);
        assert_eq!(laterals.len(), 1);

        laterals.resolve(Some("t2"), source);
        assert_eq!(laterals.len(), 2);
    }

    #[test]
    fn test_aliases_are_unique() {
        let mut laterals = LateralJoins::new();
        let a = laterals.resolve(None, "a()").clone();
        let b = laterals.resolve(None, "b()").clone();
        assert_ne!(a.alias, b.alias);
        assert!(b.spec().query.starts_with("SELECT b() AS \"var_"));
        assert!(a.reference().starts_with("\"array_"));
    }
}
