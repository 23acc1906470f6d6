//! Join planning over the relational tables.
//!
//! Every attribute group maps to one table. Groups are recorded as they are
//! bound, then [`JoinSetup::plan`] picks the anchor table, adds the
//! prerequisites of each group and emits the joins in dependency order.

use std::collections::BTreeSet;

use crate::sql_builder::{JoinKind, JoinSpec, TableRef, column_ref};

/// A relational table reachable from an entry or an EHR row.
///
/// Declaration order is join emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JoinGroup {
    Entry,
    Composition,
    EventContext,
    Facility,
    Composer,
    Ehr,
    System,
    Status,
    Subject,
}

impl JoinGroup {
    pub fn table(self, schema: &str) -> TableRef {
        let (table, alias) = match self {
            Self::Entry => ("entry", None),
            Self::Composition => ("composition", Some("composition_join")),
            Self::EventContext => ("event_context", None),
            Self::Facility => ("party_identified", Some("facility_ref")),
            Self::Composer => ("party_identified", Some("composer_ref")),
            Self::Ehr => ("ehr", Some("ehr_join")),
            Self::System => ("system", Some("system_join")),
            Self::Status => ("status", Some("status_join")),
            Self::Subject => ("party_identified", Some("subject_ref")),
        };
        let table = TableRef::new(schema, table);
        match alias {
            Some(alias) => table.aliased(alias),
            None => table,
        }
    }

    /// Qualified column of this group's table.
    pub fn column(self, schema: &str, column: &str) -> String {
        format!("{}.\"{column}\"", self.table(schema).reference())
    }

    fn is_composition_side(self) -> bool {
        matches!(
            self,
            Self::Composition | Self::EventContext | Self::Facility | Self::Composer
        )
    }
}

/// FROM table plus the joins hanging off it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPlan {
    pub from: TableRef,
    pub joins: Vec<JoinSpec>,
}

/// Attribute groups referenced while binding one template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinSetup {
    used: BTreeSet<JoinGroup>,
}

impl JoinSetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a group. Repeated calls are no-ops.
    pub fn require(&mut self, group: JoinGroup) {
        self.used.insert(group);
    }

    pub fn uses(&self, group: JoinGroup) -> bool {
        self.used.contains(&group)
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    fn anchor(&self, has_contains: bool) -> JoinGroup {
        let entry_side = self.uses(JoinGroup::Entry)
            || self.used.iter().any(|g| g.is_composition_side());
        if entry_side || has_contains {
            JoinGroup::Entry
        } else {
            JoinGroup::Ehr
        }
    }

    /// A single table answers the query on its own.
    fn single_table(&self, has_contains: bool) -> Option<JoinGroup> {
        let mut groups = self.used.iter().copied();
        let (Some(only), None) = (groups.next(), groups.next()) else {
            return None;
        };
        match only {
            JoinGroup::Composition | JoinGroup::EventContext => Some(only),
            JoinGroup::Ehr | JoinGroup::System if !has_contains => Some(only),
            _ => None,
        }
    }

    /// Groups closed under their prerequisites for the given anchor.
    fn closure(&self, anchor: JoinGroup) -> BTreeSet<JoinGroup> {
        let mut groups = self.used.clone();
        loop {
            let before = groups.len();
            for group in groups.clone() {
                let prerequisite = match group {
                    JoinGroup::Subject => Some(JoinGroup::Status),
                    JoinGroup::Facility => Some(JoinGroup::EventContext),
                    JoinGroup::Composer => Some(JoinGroup::Composition),
                    JoinGroup::System => Some(JoinGroup::Ehr),
                    JoinGroup::Ehr | JoinGroup::Status if anchor == JoinGroup::Entry => {
                        Some(JoinGroup::Composition)
                    }
                    _ => None,
                };
                if let Some(prerequisite) = prerequisite {
                    groups.insert(prerequisite);
                }
            }
            if groups.len() == before {
                break;
            }
        }
        groups.remove(&anchor);
        groups
    }

    /// Minimal FROM / JOIN graph for the recorded groups.
    pub fn plan(&self, schema: &str, has_contains: bool) -> JoinPlan {
        if let Some(only) = self.single_table(has_contains) {
            return JoinPlan {
                from: only.table(schema),
                joins: Vec::new(),
            };
        }

        let anchor = self.anchor(has_contains);
        let joins = self
            .closure(anchor)
            .into_iter()
            .map(|group| join_spec(schema, group, anchor))
            .collect();
        JoinPlan {
            from: anchor.table(schema),
            joins,
        }
    }
}

fn join_spec(schema: &str, group: JoinGroup, anchor: JoinGroup) -> JoinSpec {
    let col = |g: JoinGroup, c: &str| g.column(schema, c);
    let (kind, on) = match group {
        JoinGroup::Composition => (
            JoinKind::RightOuter,
            format!(
                "{} = {}",
                col(JoinGroup::Composition, "id"),
                col(JoinGroup::Entry, "composition_id")
            ),
        ),
        JoinGroup::EventContext => (
            JoinKind::Inner,
            format!(
                "{} = {}",
                col(JoinGroup::EventContext, "composition_id"),
                col(JoinGroup::Entry, "composition_id")
            ),
        ),
        JoinGroup::Facility => (
            JoinKind::Inner,
            format!(
                "{} = {}",
                column_ref("facility_ref", "id"),
                col(JoinGroup::EventContext, "facility")
            ),
        ),
        JoinGroup::Composer => (
            JoinKind::Inner,
            format!(
                "{} = {}",
                column_ref("composer_ref", "id"),
                column_ref("composition_join", "composer")
            ),
        ),
        JoinGroup::Ehr => (
            JoinKind::RightOuter,
            format!(
                "{} = {}",
                column_ref("ehr_join", "id"),
                column_ref("composition_join", "ehr_id")
            ),
        ),
        JoinGroup::System => (
            JoinKind::Inner,
            format!(
                "{} = {}",
                column_ref("system_join", "id"),
                column_ref("ehr_join", "system_id")
            ),
        ),
        JoinGroup::Status => {
            let owner = if anchor == JoinGroup::Ehr {
                column_ref("ehr_join", "id")
            } else {
                column_ref("composition_join", "ehr_id")
            };
            (
                JoinKind::Inner,
                format!("{} = {owner}", column_ref("status_join", "ehr_id")),
            )
        }
        JoinGroup::Subject => (
            JoinKind::Inner,
            format!(
                "{} = {}",
                column_ref("subject_ref", "id"),
                column_ref("status_join", "party")
            ),
        ),
        JoinGroup::Entry => (JoinKind::Inner, "true".to_string()),
    };
    JoinSpec::new(kind, group.table(schema), on)
}
