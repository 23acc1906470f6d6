//! Knowledge cache collaborator: which templates contain which archetype
//! nodes, and where those nodes live inside a stored document.

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::containment::{BoolOp, COMPOSITION, ContainmentExpr, ContainmentRef};
use crate::path::{AqlPath, PathSegment};

pub type TemplateId = String;

/// Errors from knowledge cache operations.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Invalid template definition: {0}")]
    InvalidDefinition(String),

    #[error("Knowledge cache unavailable: {0}")]
    Unavailable(String),
}

/// One step into a stored JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawSegment", into = "RawSegment")]
pub enum JsonSegment {
    Key(String),
    Index(usize),
    /// Every element of a multi-valued node.
    Iterate,
    /// Elements of a multi-valued node whose `/name` value equals the text.
    Named(String),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSegment {
    Index(usize),
    Key(String),
    Named { named: String },
}

impl JsonSegment {
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, Self::Iterate | Self::Named(_))
    }
}

impl From<RawSegment> for JsonSegment {
    fn from(raw: RawSegment) -> Self {
        match raw {
            RawSegment::Index(i) => Self::Index(i),
            RawSegment::Key(k) if k == "*" => Self::Iterate,
            RawSegment::Key(k) => Self::Key(k),
            RawSegment::Named { named } => Self::Named(named),
        }
    }
}

impl From<JsonSegment> for RawSegment {
    fn from(segment: JsonSegment) -> Self {
        match segment {
            JsonSegment::Key(k) => Self::Key(k),
            JsonSegment::Index(i) => Self::Index(i),
            JsonSegment::Iterate => Self::Key("*".to_string()),
            JsonSegment::Named(named) => Self::Named { named },
        }
    }
}

/// A location inside a JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPath(Vec<JsonSegment>);

impl JsonPath {
    pub fn new(segments: Vec<JsonSegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[JsonSegment] {
        &self.0
    }

    pub fn push(&mut self, segment: JsonSegment) {
        self.0.push(segment);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_multi_valued(&self) -> bool {
        self.0.iter().any(JsonSegment::is_multi_valued)
    }

    /// Split at the first multi-valued step: the path to the array, the
    /// step itself and the path below one of its elements.
    pub fn split_iterate(&self) -> Option<(JsonPath, JsonSegment, JsonPath)> {
        let pos = self.0.iter().position(JsonSegment::is_multi_valued)?;
        Some((
            Self(self.0[..pos].to_vec()),
            self.0[pos].clone(),
            Self(self.0[pos + 1..].to_vec()),
        ))
    }

    pub fn last_key(&self) -> Option<&str> {
        match self.0.last()? {
            JsonSegment::Key(k) => Some(k.as_str()),
            _ => None,
        }
    }

    /// Replace the final key, keeping everything before it.
    pub fn with_last_key(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        if let Some(JsonSegment::Key(last)) = segments.last_mut() {
            *last = key.to_string();
        }
        Self(segments)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|s| match s {
                JsonSegment::Key(k) => k.clone(),
                JsonSegment::Index(i) => i.to_string(),
                JsonSegment::Iterate => "*".to_string(),
                JsonSegment::Named(name) => format!("*[{name}]"),
            })
            .collect();
        write!(f, "{{{}}}", parts.join(","))
    }
}

/// Structural lookups against the operational templates.
pub trait KnowledgeCache: Send + Sync {
    /// Templates whose structure satisfies the containment expression.
    fn resolve_templates(
        &self,
        expr: &ContainmentExpr,
    ) -> Result<BTreeSet<TemplateId>, KnowledgeError>;

    /// Node paths (from the composition root) at which a containment occurs
    /// in a template.
    fn containment_paths(
        &self,
        template: &str,
        containment: &ContainmentRef,
    ) -> Result<Vec<String>, KnowledgeError>;

    /// RM class of the node at `path`.
    fn class_name_at(&self, template: &str, path: &str) -> Result<Option<String>, KnowledgeError>;

    /// Document location of `path`; `None` when the template has no such node.
    fn resolve_json_path(
        &self,
        template: &str,
        path: &str,
    ) -> Result<Option<JsonPath>, KnowledgeError>;
}

/// One archetype node of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Path from the composition root; empty for the root itself.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub archetype_id: Option<String>,
    pub class_name: String,
    /// Where the node's JSON lives inside the entry document.
    #[serde(default)]
    pub json_path: JsonPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub template_id: TemplateId,
    pub root_archetype: String,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

impl TemplateDefinition {
    fn root_node(&self) -> NodeDefinition {
        NodeDefinition {
            path: String::new(),
            archetype_id: Some(self.root_archetype.clone()),
            class_name: COMPOSITION.to_string(),
            json_path: JsonPath::default(),
        }
    }

    /// Every node, root first.
    fn all_nodes(&self) -> Vec<NodeDefinition> {
        let mut nodes = vec![self.root_node()];
        nodes.extend(self.nodes.iter().filter(|n| !n.path.is_empty()).cloned());
        nodes
    }
}

/// Templates kept in memory, in registration order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKnowledgeCache {
    templates: IndexMap<TemplateId, TemplateDefinition>,
}

impl InMemoryKnowledgeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, template: TemplateDefinition) -> Self {
        self.register(template);
        self
    }

    pub fn register(&mut self, template: TemplateDefinition) {
        self.templates
            .insert(template.template_id.clone(), template);
    }

    /// Load a JSON array of template definitions.
    pub fn from_json(value: serde_json::Value) -> Result<Self, KnowledgeError> {
        let templates: Vec<TemplateDefinition> = serde_json::from_value(value)
            .map_err(|e| KnowledgeError::InvalidDefinition(e.to_string()))?;
        let mut cache = Self::new();
        for template in templates {
            cache.register(template);
        }
        Ok(cache)
    }

    pub fn template_ids(&self) -> impl Iterator<Item = &TemplateId> {
        self.templates.keys()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    fn template(&self, id: &str) -> Result<&TemplateDefinition, KnowledgeError> {
        self.templates
            .get(id)
            .ok_or_else(|| KnowledgeError::UnknownTemplate(id.to_string()))
    }

    fn matches(template: &TemplateDefinition, expr: &ContainmentExpr) -> bool {
        match expr {
            ContainmentExpr::Chain(chain) => chain_matches(template, chain),
            ContainmentExpr::Binary { op, left, right } => {
                let l = Self::matches(template, left);
                let r = Self::matches(template, right);
                match op {
                    BoolOp::And => l && r,
                    BoolOp::Or => l || r,
                    BoolOp::Xor => l && !r,
                }
            }
        }
    }
}

fn node_matches(node: &NodeDefinition, containment: &ContainmentRef) -> bool {
    match &containment.archetype_id {
        Some(id) => node.archetype_id.as_deref() == Some(id.as_str()),
        None => node.class_name.eq_ignore_ascii_case(&containment.class_name),
    }
}

/// True when some sequence of nodes matches the chain, each strictly below
/// the previous one.
fn chain_matches(template: &TemplateDefinition, chain: &[ContainmentRef]) -> bool {
    fn below(
        nodes: &[NodeDefinition],
        parent: Option<&AqlPath>,
        chain: &[ContainmentRef],
    ) -> bool {
        let Some((head, rest)) = chain.split_first() else {
            return true;
        };
        nodes.iter().any(|node| {
            let path = AqlPath::parse(&node.path);
            let nested = parent.is_none_or(|p| path.len() > p.len() && path.starts_with(p));
            nested && node_matches(node, head) && below(nodes, Some(&path), rest)
        })
    }
    below(&template.all_nodes(), None, chain)
}

/// Request segment against registered node segment, by node id. A bare
/// name, a name-only predicate or a numeric index matches any node.
fn segment_matches(node: &PathSegment, wanted: &PathSegment) -> bool {
    node.name == wanted.name
        && (wanted.index().is_some()
            || match (node.node_id(), wanted.node_id()) {
                (_, None) => true,
                (Some(a), Some(b)) => a == b,
                (None, Some(_)) => false,
            })
}

fn prefix_len(node: &AqlPath, wanted: &AqlPath) -> Option<usize> {
    (node.len() <= wanted.len()
        && node
            .segments()
            .iter()
            .zip(wanted.segments())
            .all(|(n, w)| segment_matches(n, w)))
    .then_some(node.len())
}

/// JSON keys for the part of a path below the last registered node.
///
/// Attributes of an archetyped node are stored under `/name` keys; attributes
/// of the data values below them are stored under their bare names.
fn mechanical_suffix(json: &mut JsonPath, rest: &[PathSegment], mut after_node: bool) {
    for segment in rest {
        match (segment.index(), segment.predicate.is_some()) {
            (Some(i), _) => {
                json.push(JsonSegment::Key(format!("/{}", segment.name)));
                json.push(JsonSegment::Index(i));
                after_node = true;
            }
            (None, true) => {
                json.push(JsonSegment::Key(format!("/{}", segment.without_name())));
                if let Some(name) = segment.name_filter() {
                    json.push(JsonSegment::Named(name));
                }
                after_node = true;
            }
            (None, false) if after_node => {
                json.push(JsonSegment::Key(format!("/{}", segment.name)));
                after_node = false;
            }
            (None, false) => json.push(JsonSegment::Key(segment.name.clone())),
        }
    }
}

/// Document location of a path below a locatable node, without consulting
/// any template.
pub fn mechanical_json_path(path: &AqlPath) -> JsonPath {
    let mut json = JsonPath::default();
    mechanical_suffix(&mut json, path.segments(), true);
    json
}

impl KnowledgeCache for InMemoryKnowledgeCache {
    fn resolve_templates(
        &self,
        expr: &ContainmentExpr,
    ) -> Result<BTreeSet<TemplateId>, KnowledgeError> {
        Ok(self
            .templates
            .values()
            .filter(|t| Self::matches(t, expr))
            .map(|t| t.template_id.clone())
            .collect())
    }

    fn containment_paths(
        &self,
        template: &str,
        containment: &ContainmentRef,
    ) -> Result<Vec<String>, KnowledgeError> {
        Ok(self
            .template(template)?
            .all_nodes()
            .into_iter()
            .filter(|n| node_matches(n, containment))
            .map(|n| n.path)
            .collect())
    }

    fn class_name_at(&self, template: &str, path: &str) -> Result<Option<String>, KnowledgeError> {
        let wanted = AqlPath::parse(path);
        Ok(self
            .template(template)?
            .all_nodes()
            .into_iter()
            .find(|n| {
                let node = AqlPath::parse(&n.path);
                node.len() == wanted.len() && prefix_len(&node, &wanted).is_some()
            })
            .map(|n| n.class_name))
    }

    fn resolve_json_path(
        &self,
        template: &str,
        path: &str,
    ) -> Result<Option<JsonPath>, KnowledgeError> {
        let wanted = AqlPath::parse(path);
        let nodes = self.template(template)?.all_nodes();
        let matched: Vec<(usize, &NodeDefinition)> = nodes
            .iter()
            .filter_map(|n| {
                let node = AqlPath::parse(&n.path);
                prefix_len(&node, &wanted).map(|len| (len, n))
            })
            .collect();

        let Some(&(len, node)) = matched.iter().max_by_key(|(len, _)| *len) else {
            return Ok(None);
        };
        let mut json = node.json_path.clone();
        let at_locatable = AqlPath::parse(&node.path)
            .last()
            .is_none_or(|s| s.predicate.is_some());

        // A numeric index on a multi-valued node selects one element.
        if let Some(index) = len
            .checked_sub(1)
            .and_then(|i| wanted.segments()[i].index())
            && json.segments().last() == Some(&JsonSegment::Iterate)
        {
            let mut segments = json.segments().to_vec();
            segments.pop();
            segments.push(JsonSegment::Index(index));
            json = JsonPath::new(segments);
        }

        // A node name predicate filters the elements of the node's array.
        let mut segments = json.segments().to_vec();
        for (depth, name) in wanted.segments()[..len]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.name_filter().map(|name| (i + 1, name)))
        {
            let Some((_, named)) = matched.iter().find(|(l, _)| *l == depth) else {
                continue;
            };
            let position = named.json_path.segments().len();
            if let Some(step) = position.checked_sub(1).and_then(|p| segments.get_mut(p))
                && matches!(step, JsonSegment::Iterate | JsonSegment::Index(_))
            {
                *step = JsonSegment::Named(name);
            }
        }
        let mut json = JsonPath::new(segments);

        mechanical_suffix(&mut json, &wanted.segments()[len..], at_locatable);
        Ok(Some(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blood_pressure() -> TemplateDefinition {
        serde_json::from_value(serde_json::json!({
            "template_id": "vital_signs.v1",
            "root_archetype": "openEHR-EHR-COMPOSITION.encounter.v1",
            "nodes": [
                {
                    "path": "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]",
                    "archetype_id": "openEHR-EHR-OBSERVATION.blood_pressure.v1",
                    "class_name": "OBSERVATION",
                    "json_path": ["/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]", "*"]
                },
                {
                    "path": "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data[at0001]/events[at0006]",
                    "class_name": "POINT_EVENT",
                    "json_path": ["/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]", 0, "/data[at0001]", "/events[at0006]", "*"]
                },
                {
                    "path": "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data[at0001]/events[at0006]/data[at0003]/items[at0004]/value",
                    "class_name": "DV_QUANTITY",
                    "json_path": ["/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]", 0, "/data[at0001]", "/events[at0006]", 0, "/data[at0003]", "/items[at0004]", 0, "/value"]
                }
            ]
        }))
        .unwrap()
    }

    fn observation(archetype: &str) -> ContainmentExpr {
        ContainmentExpr::Chain(vec![ContainmentRef {
            class_name: "OBSERVATION".into(),
            archetype_id: Some(archetype.into()),
            symbol: "o".into(),
        }])
    }

    #[test]
    fn test_json_segment_serde() {
        let path: JsonPath = serde_json::from_value(serde_json::json!(["/a", 1, "*"])).unwrap();
        assert_eq!(
            path.segments(),
            &[
                JsonSegment::Key("/a".into()),
                JsonSegment::Index(1),
                JsonSegment::Iterate
            ]
        );
        assert_eq!(serde_json::to_value(&path).unwrap(), serde_json::json!(["/a", 1, "*"]));
    }

    #[test]
    fn test_resolve_templates_by_archetype() {
        let cache = InMemoryKnowledgeCache::new().with_template(blood_pressure());
        let found = cache
            .resolve_templates(&observation("openEHR-EHR-OBSERVATION.blood_pressure.v1"))
            .unwrap();
        assert!(found.contains("vital_signs.v1"));

        let none = cache
            .resolve_templates(&observation("openEHR-EHR-OBSERVATION.unknown.v1"))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_boolean_expressions() {
        let cache = InMemoryKnowledgeCache::new().with_template(blood_pressure());
        let bp = observation("openEHR-EHR-OBSERVATION.blood_pressure.v1");
        let other = observation("openEHR-EHR-OBSERVATION.unknown.v1");
        let and = ContainmentExpr::binary(BoolOp::And, bp.clone(), other.clone());
        let or = ContainmentExpr::binary(BoolOp::Or, bp.clone(), other.clone());
        let xor = ContainmentExpr::binary(BoolOp::Xor, bp, other);
        assert!(cache.resolve_templates(&and).unwrap().is_empty());
        assert_eq!(cache.resolve_templates(&or).unwrap().len(), 1);
        assert_eq!(cache.resolve_templates(&xor).unwrap().len(), 1);
    }

    #[test]
    fn test_chain_requires_nesting() {
        let cache = InMemoryKnowledgeCache::new().with_template(blood_pressure());
        let chain = ContainmentExpr::Chain(vec![
            ContainmentRef {
                class_name: "COMPOSITION".into(),
                archetype_id: None,
                symbol: "c".into(),
            },
            ContainmentRef {
                class_name: "OBSERVATION".into(),
                archetype_id: None,
                symbol: "o".into(),
            },
        ]);
        assert_eq!(cache.resolve_templates(&chain).unwrap().len(), 1);

        let reversed = ContainmentExpr::Chain(vec![
            ContainmentRef {
                class_name: "OBSERVATION".into(),
                archetype_id: None,
                symbol: "o".into(),
            },
            ContainmentRef {
                class_name: "COMPOSITION".into(),
                archetype_id: None,
                symbol: "c".into(),
            },
        ]);
        assert!(cache.resolve_templates(&reversed).unwrap().is_empty());
    }

    #[test]
    fn test_json_path_longest_prefix_and_suffix() {
        let cache = InMemoryKnowledgeCache::new().with_template(blood_pressure());
        let path = cache
            .resolve_json_path(
                "vital_signs.v1",
                "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data[at0001]/events[at0006]/data[at0003]/items[at0004]/value/magnitude",
            )
            .unwrap()
            .unwrap();
        assert_eq!(path.last_key(), Some("magnitude"));
        assert!(!path.is_multi_valued());
    }

    #[test]
    fn test_json_path_index_replaces_iterate() {
        let cache = InMemoryKnowledgeCache::new().with_template(blood_pressure());
        let all = cache
            .resolve_json_path(
                "vital_signs.v1",
                "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data/events/time/value",
            )
            .unwrap()
            .unwrap();
        assert!(all.is_multi_valued());

        let first = cache
            .resolve_json_path(
                "vital_signs.v1",
                "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data/events[0]/time/value",
            )
            .unwrap()
            .unwrap();
        assert!(!first.is_multi_valued());
        assert_eq!(
            &first.segments()[first.segments().len() - 3..],
            &[
                JsonSegment::Index(0),
                JsonSegment::Key("/time".into()),
                JsonSegment::Key("value".into())
            ]
        );
    }

    #[test]
    fn test_json_path_node_name_filters_elements() {
        let cache = InMemoryKnowledgeCache::new().with_template(blood_pressure());
        let named = cache
            .resolve_json_path(
                "vital_signs.v1",
                "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data[at0001]/events[at0006, 'Any event']/time/value",
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            named.segments(),
            &[
                JsonSegment::Key("/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]".into()),
                JsonSegment::Index(0),
                JsonSegment::Key("/data[at0001]".into()),
                JsonSegment::Key("/events[at0006]".into()),
                JsonSegment::Named("Any event".into()),
                JsonSegment::Key("/time".into()),
                JsonSegment::Key("value".into()),
            ]
        );

        let class = cache
            .class_name_at(
                "vital_signs.v1",
                "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data[at0001]/events[at0006, 'Any event']",
            )
            .unwrap();
        assert_eq!(class.as_deref(), Some("POINT_EVENT"));

        let other_node = cache
            .resolve_json_path(
                "vital_signs.v1",
                "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data[at0001]/events[at0007, 'Any event']/time/value",
            )
            .unwrap()
            .unwrap();
        assert!(
            other_node
                .segments()
                .contains(&JsonSegment::Key("/events[at0007]".into()))
        );
    }

    #[test]
    fn test_mechanical_path_with_node_name() {
        let json = mechanical_json_path(&AqlPath::parse("items[at0001, 'Rate']/value/magnitude"));
        assert_eq!(
            json.segments(),
            &[
                JsonSegment::Key("/items[at0001]".into()),
                JsonSegment::Named("Rate".into()),
                JsonSegment::Key("/value".into()),
                JsonSegment::Key("magnitude".into()),
            ]
        );
        assert!(json.is_multi_valued());
    }

    #[test]
    fn test_class_name_and_containment_paths() {
        let cache = InMemoryKnowledgeCache::new().with_template(blood_pressure());
        let class = cache
            .class_name_at(
                "vital_signs.v1",
                "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data[at0001]/events[at0006]/data[at0003]/items[at0004]/value",
            )
            .unwrap();
        assert_eq!(class.as_deref(), Some("DV_QUANTITY"));

        let paths = cache
            .containment_paths(
                "vital_signs.v1",
                &ContainmentRef {
                    class_name: "COMPOSITION".into(),
                    archetype_id: None,
                    symbol: "c".into(),
                },
            )
            .unwrap();
        assert_eq!(paths, vec![String::new()]);

        assert!(matches!(
            cache.class_name_at("nope", "/x"),
            Err(KnowledgeError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn test_mechanical_json_path() {
        let json = mechanical_json_path(&AqlPath::parse("items[at0002]/value/value"));
        assert_eq!(
            json.segments(),
            &[
                JsonSegment::Key("/items[at0002]".into()),
                JsonSegment::Key("/value".into()),
                JsonSegment::Key("value".into())
            ]
        );
        assert_eq!(json.to_string(), "{/items[at0002],/value,value}");
    }
}
