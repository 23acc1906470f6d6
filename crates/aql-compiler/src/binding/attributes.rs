//! Relational attributes of COMPOSITION and EHR.

use super::join::JoinGroup;
use crate::path::AqlPath;

/// Where a relational attribute lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeTarget {
    Column {
        group: JoinGroup,
        column: &'static str,
    },
    /// `uid/value`: the composition id qualified by the server node.
    CompositionUid,
    /// An item structure stored in a document column, addressed by the rest
    /// of the path.
    Nested {
        group: JoinGroup,
        column: &'static str,
        rest: AqlPath,
    },
    WholeComposition,
    WholeEhr,
}

const COMPOSITION_COLUMNS: &[(&str, JoinGroup, &str)] = &[
    ("name/value", JoinGroup::Entry, "name"),
    ("archetype_node_id", JoinGroup::Entry, "archetype_id"),
    ("archetype_details/template_id/value", JoinGroup::Entry, "template_id"),
    ("category/defining_code/code_string", JoinGroup::Entry, "category"),
    ("language/code_string", JoinGroup::Composition, "language"),
    ("territory/code_string", JoinGroup::Composition, "territory"),
    ("composer/name", JoinGroup::Composer, "name"),
    ("composer/external_ref/id/value", JoinGroup::Composer, "party_ref_value"),
    ("composer/external_ref/namespace", JoinGroup::Composer, "party_ref_namespace"),
    ("context/start_time/value", JoinGroup::EventContext, "start_time"),
    ("context/end_time/value", JoinGroup::EventContext, "end_time"),
    ("context/location", JoinGroup::EventContext, "location"),
    ("context/setting/defining_code/code_string", JoinGroup::EventContext, "setting"),
    ("context/health_care_facility/name", JoinGroup::Facility, "name"),
    ("context/health_care_facility/external_ref/id/value", JoinGroup::Facility, "party_ref_value"),
];

const COMPOSITION_NESTED: &[(&str, JoinGroup, &str)] =
    &[("context/other_context", JoinGroup::EventContext, "other_context")];

const EHR_COLUMNS: &[(&str, JoinGroup, &str)] = &[
    ("ehr_id/value", JoinGroup::Ehr, "id"),
    ("time_created/value", JoinGroup::Ehr, "date_created"),
    ("system_id/value", JoinGroup::System, "settings"),
    ("ehr_status/subject/external_ref/id/value", JoinGroup::Subject, "party_ref_value"),
    ("ehr_status/subject/external_ref/namespace", JoinGroup::Subject, "party_ref_namespace"),
    ("ehr_status/is_queryable", JoinGroup::Status, "is_queryable"),
    ("ehr_status/is_modifiable", JoinGroup::Status, "is_modifiable"),
];

const EHR_NESTED: &[(&str, JoinGroup, &str)] =
    &[("ehr_status/other_details", JoinGroup::Status, "other_details")];

fn lookup(
    path: &AqlPath,
    columns: &[(&str, JoinGroup, &'static str)],
    nested: &[(&str, JoinGroup, &'static str)],
) -> Option<AttributeTarget> {
    let names = path.names();
    if let Some((_, group, column)) = columns.iter().find(|(n, _, _)| *n == names) {
        return Some(AttributeTarget::Column {
            group: *group,
            column: *column,
        });
    }
    nested
        .iter()
        .find(|(prefix, _, _)| path.names_start_with(prefix))
        .map(|(prefix, group, column)| {
            let depth = prefix.split('/').count();
            let (_, rest) = path.split_at(depth);
            AttributeTarget::Nested {
                group: *group,
                column: *column,
                rest,
            }
        })
}

/// Relational target of a COMPOSITION path; `None` for paths that live in
/// the document.
pub fn composition_attribute(path: Option<&AqlPath>) -> Option<AttributeTarget> {
    let Some(path) = path else {
        return Some(AttributeTarget::WholeComposition);
    };
    if path.names() == "uid/value" {
        return Some(AttributeTarget::CompositionUid);
    }
    lookup(path, COMPOSITION_COLUMNS, COMPOSITION_NESTED)
}

pub fn ehr_attribute(path: Option<&AqlPath>) -> Option<AttributeTarget> {
    match path {
        None => Some(AttributeTarget::WholeEhr),
        Some(path) => lookup(path, EHR_COLUMNS, EHR_NESTED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composition_columns() {
        let path = AqlPath::parse("context/start_time/value");
        assert_eq!(
            composition_attribute(Some(&path)),
            Some(AttributeTarget::Column {
                group: JoinGroup::EventContext,
                column: "start_time"
            })
        );
        assert_eq!(
            composition_attribute(Some(&AqlPath::parse("uid/value"))),
            Some(AttributeTarget::CompositionUid)
        );
        assert_eq!(composition_attribute(None), Some(AttributeTarget::WholeComposition));
        assert!(composition_attribute(Some(&AqlPath::parse("content[openEHR-EHR-OBSERVATION.x.v1]"))).is_none());
    }

    #[test]
    fn test_nested_group_keeps_remaining_path() {
        let path = AqlPath::parse("context/other_context[at0001]/items[at0002]/value/value");
        let Some(AttributeTarget::Nested { group, column, rest }) = composition_attribute(Some(&path)) else {
            panic!("expected nested target");
        };
        assert_eq!(group, JoinGroup::EventContext);
        assert_eq!(column, "other_context");
        assert_eq!(rest.relative(), "items[at0002]/value/value");
    }

    #[test]
    fn test_ehr_attributes() {
        let path = AqlPath::parse("ehr_status/subject/external_ref/id/value");
        assert_eq!(
            ehr_attribute(Some(&path)),
            Some(AttributeTarget::Column {
                group: JoinGroup::Subject,
                column: "party_ref_value"
            })
        );
        assert_eq!(ehr_attribute(None), Some(AttributeTarget::WholeEhr));
        assert!(ehr_attribute(Some(&AqlPath::parse("folders"))).is_none());
    }
}
