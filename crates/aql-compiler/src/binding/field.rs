//! Field binding: one path variable to one SQL expression, per template.
//!
//! COMPOSITION and EHR attributes resolve to relational columns; everything
//! else is located inside the entry document through the knowledge cache.
//! Multi-valued steps of a document path are unnested with lateral joins.

use std::collections::HashMap;

use super::attributes::{AttributeTarget, composition_attribute, ehr_attribute};
use super::join::{JoinGroup, JoinSetup};
use super::lateral::LateralJoins;
use crate::config::CompilerConfig;
use crate::containment::{Containment, ContainmentId, IdentifierMapper, Symbol};
use crate::definition::{PathVariable, Variable};
use crate::error::{CompileError, Result};
use crate::knowledge::{JsonPath, JsonSegment, KnowledgeCache, TemplateId, mechanical_json_path};
use crate::literal::quote;
use crate::path::AqlPath;
use crate::sql_builder::column_ref;

/// Casts applied to a data value attribute, by the class of its parent node.
const VALUE_CASTS: &[(&str, &str, &str)] = &[
    ("DV_QUANTITY", "magnitude", "numeric"),
    ("DV_PROPORTION", "numerator", "numeric"),
    ("DV_PROPORTION", "denominator", "numeric"),
    ("DV_COUNT", "magnitude", "bigint"),
    ("DV_ORDINAL", "value", "integer"),
    ("DV_BOOLEAN", "value", "boolean"),
];

/// A JSON-valued column and the location of a value inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentColumn {
    pub column: String,
    pub path: JsonPath,
    pub cast: Option<&'static str>,
    /// Select the JSON subtree instead of its text.
    pub whole_object: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    Relational { expression: String },
    Document(DocumentColumn),
    /// Known at compile time; already an SQL literal.
    Constant(String),
}

/// A bound variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBinding {
    pub variable: PathVariable,
    pub source: FieldSource,
    /// Final SQL expression, laterals applied.
    pub expression: String,
}

impl FieldBinding {
    pub fn document(&self) -> Option<&DocumentColumn> {
        match &self.source {
            FieldSource::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

/// True when binding `variable` needs a concrete template.
pub fn requires_template(variable: &Variable, mapper: &IdentifierMapper) -> bool {
    variable
        .path_variables()
        .into_iter()
        .any(|v| path_requires_template(v, mapper))
}

pub fn path_requires_template(variable: &PathVariable, mapper: &IdentifierMapper) -> bool {
    let Some((_, containment)) = mapper.containment_by_symbol(&variable.identifier) else {
        return false;
    };
    let path = variable.path.as_ref();
    if containment.is_composition() {
        return match path {
            None => false,
            Some(p) if p.names_start_with("content") => true,
            Some(p) => composition_attribute(Some(p)).is_none(),
        };
    }
    !(is_node_id(path) && containment.archetype_id.is_some())
}

fn is_node_id(path: Option<&AqlPath>) -> bool {
    path.is_some_and(|p| p.names() == "archetype_node_id")
}

/// Binds variables against one template (or none), collecting the joins and
/// laterals the bound expressions need.
///
/// Bindings are memoised by variable text, so a WHERE variable already
/// bound in the SELECT list reuses the SELECT binding.
pub struct TemplateBinder<'a> {
    config: &'a CompilerConfig,
    knowledge: &'a dyn KnowledgeCache,
    mapper: &'a IdentifierMapper,
    template: Option<TemplateId>,
    joins: JoinSetup,
    laterals: LateralJoins,
    bound: HashMap<String, FieldBinding>,
}

impl<'a> TemplateBinder<'a> {
    pub fn new(
        config: &'a CompilerConfig,
        knowledge: &'a dyn KnowledgeCache,
        mapper: &'a IdentifierMapper,
        template: Option<TemplateId>,
    ) -> Self {
        Self {
            config,
            knowledge,
            mapper,
            template,
            joins: JoinSetup::new(),
            laterals: LateralJoins::new(),
            bound: HashMap::new(),
        }
    }

    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn schema(&self) -> &str {
        &self.config.schema
    }

    pub fn require(&mut self, group: JoinGroup) {
        self.joins.require(group);
    }

    pub fn joins(&self) -> &JoinSetup {
        &self.joins
    }

    pub fn laterals(&self) -> &LateralJoins {
        &self.laterals
    }

    pub fn bind(&mut self, variable: &PathVariable) -> Result<FieldBinding> {
        let key = variable.text();
        if let Some(binding) = self.bound.get(&key) {
            return Ok(binding.clone());
        }

        let mapper = self.mapper;
        let source = match mapper.get(&variable.identifier) {
            None => {
                return Err(CompileError::InvalidQuery(format!(
                    "unknown identifier '{}'",
                    variable.identifier
                )));
            }
            Some(Symbol::Foreign(p)) => {
                return Err(CompileError::InvalidQuery(format!(
                    "{} sources cannot be projected",
                    p.class_name
                )));
            }
            Some(Symbol::Ehr(_)) => {
                let target = ehr_attribute(variable.path.as_ref())
                    .ok_or_else(|| self.unknown(variable))?;
                self.attribute(target)
            }
            Some(Symbol::Containment(id)) => self.containment_field(*id, variable)?,
        };

        let expression = match &source {
            FieldSource::Relational { expression } => expression.clone(),
            FieldSource::Constant(value) => value.clone(),
            FieldSource::Document(doc) => self.render_document(doc),
        };
        let binding = FieldBinding {
            variable: variable.clone(),
            source,
            expression,
        };
        self.bound.insert(key, binding.clone());
        Ok(binding)
    }

    fn unknown(&self, variable: &PathVariable) -> CompileError {
        CompileError::unknown_variable(variable.text(), self.template().unwrap_or("*"))
    }

    fn attribute(&mut self, target: AttributeTarget) -> FieldSource {
        let schema = self.config.schema.clone();
        match target {
            AttributeTarget::Column { group, column } => {
                self.require(group);
                FieldSource::Relational {
                    expression: group.column(&schema, column),
                }
            }
            AttributeTarget::CompositionUid => {
                self.require(JoinGroup::Composition);
                FieldSource::Relational {
                    expression: format!(
                        "{}::text || '::{}'",
                        column_ref("composition_join", "id"),
                        self.config.server_node_id.replace('\'', "''")
                    ),
                }
            }
            AttributeTarget::Nested {
                group,
                column,
                rest,
            } => {
                self.require(group);
                FieldSource::Document(DocumentColumn {
                    column: group.column(&schema, column),
                    whole_object: rest.last().is_none_or(|s| s.predicate.is_some()),
                    path: mechanical_json_path(&rest),
                    cast: None,
                })
            }
            AttributeTarget::WholeComposition => {
                self.require(JoinGroup::Composition);
                FieldSource::Relational {
                    expression: format!(
                        "\"{schema}\".js_composition({}, {})",
                        column_ref("composition_join", "id"),
                        quote(&self.config.server_node_id)
                    ),
                }
            }
            AttributeTarget::WholeEhr => {
                self.require(JoinGroup::Ehr);
                FieldSource::Relational {
                    expression: format!(
                        "\"{schema}\".js_ehr({}, {})",
                        column_ref("ehr_join", "id"),
                        quote(&self.config.server_node_id)
                    ),
                }
            }
        }
    }

    fn containment_field(
        &mut self,
        id: ContainmentId,
        variable: &PathVariable,
    ) -> Result<FieldSource> {
        let mapper = self.mapper;
        let containment = mapper.containment(id);
        let path = variable.path.as_ref();

        if containment.is_composition() {
            let in_content = path.is_some_and(|p| p.names_start_with("content"));
            if !in_content && let Some(target) = composition_attribute(path) {
                return Ok(self.attribute(target));
            }
        } else if is_node_id(path)
            && let Some(archetype_id) = &containment.archetype_id
        {
            return Ok(FieldSource::Constant(quote(archetype_id)));
        }

        let Some(template) = self.template.clone() else {
            return Err(self.unknown(variable));
        };
        let doc = self
            .document_field(&template, containment, path)?
            .ok_or_else(|| self.unknown(variable))?;
        self.require(JoinGroup::Entry);
        Ok(FieldSource::Document(doc))
    }

    /// Candidate node paths of a containment, restricted to those below the
    /// enclosing containment's nodes.
    fn node_paths(&self, template: &str, containment: &Containment) -> Result<Vec<AqlPath>> {
        let paths = self
            .knowledge
            .containment_paths(template, &containment.to_ref())?;
        let mut paths: Vec<AqlPath> = paths.iter().map(|p| AqlPath::parse(p)).collect();

        if let Some(enclosing) = containment.enclosing.map(|e| self.mapper.containment(e))
            && !enclosing.is_composition()
        {
            let outer: Vec<AqlPath> = self
                .knowledge
                .containment_paths(template, &enclosing.to_ref())?
                .iter()
                .map(|p| AqlPath::parse(p))
                .collect();
            paths.retain(|p| outer.iter().any(|o| p.len() > o.len() && p.starts_with(o)));
        }
        Ok(paths)
    }

    fn document_field(
        &self,
        template: &str,
        containment: &Containment,
        path: Option<&AqlPath>,
    ) -> Result<Option<DocumentColumn>> {
        let mut resolved = None;
        for node in self.node_paths(template, containment)? {
            let full = match path {
                Some(p) => node.join(p),
                None => node,
            };
            if let Some(json) = self
                .knowledge
                .resolve_json_path(template, &full.to_string())?
            {
                resolved = Some((full, json));
            }
        }
        let Some((full, json)) = resolved else {
            return Ok(None);
        };

        Ok(Some(DocumentColumn {
            column: JoinGroup::Entry.column(&self.config.schema, "entry"),
            cast: self.value_cast(template, &full)?,
            whole_object: path.is_none_or(|p| p.last().is_none_or(|s| s.predicate.is_some())),
            path: json,
        }))
    }

    fn value_cast(&self, template: &str, full: &AqlPath) -> Result<Option<&'static str>> {
        let (Some(last), Some(parent)) = (full.last(), full.parent()) else {
            return Ok(None);
        };
        let candidates: Vec<_> = VALUE_CASTS
            .iter()
            .filter(|(_, attribute, _)| *attribute == last.name)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        let class = self
            .knowledge
            .class_name_at(template, &parent.to_string())?;
        Ok(class.and_then(|class| {
            candidates
                .iter()
                .find(|(c, _, _)| *c == class)
                .map(|(_, _, cast)| *cast)
        }))
    }

    /// SQL for a document location, unnesting every multi-valued step.
    pub fn render_document(&mut self, doc: &DocumentColumn) -> String {
        let template = self.template.clone();
        let mut base = doc.column.clone();
        let mut path = doc.path.clone();

        while let Some((array, step, rest)) = path.split_iterate() {
            let array = json_access(&base, &array, true);
            let source = match step {
                JsonSegment::Named(name) => format!(
                    "jsonb_path_query({array}, '$[*] ? (@.\"/name\"[0].\"value\" == \"{}\")')",
                    name.replace('\\', "\\\\")
                        .replace('"', "\\\"")
                        .replace('\'', "''")
                ),
                _ => format!("jsonb_array_elements({array})"),
            };
            base = self.laterals.resolve(template.as_deref(), &source).reference();
            path = rest;
        }

        let expression = if path.is_empty() && doc.whole_object {
            base
        } else {
            json_access(&base, &path, doc.whole_object)
        };
        match doc.cast {
            Some(cast) => format!("({expression})::{cast}"),
            None => expression,
        }
    }
}

/// `base #>> '{"k1","k2"}'`, or `#>` for a JSON result.
pub fn json_access(base: &str, path: &JsonPath, as_json: bool) -> String {
    let operator = if as_json { "#>" } else { "#>>" };
    let elements: Vec<String> = path
        .segments()
        .iter()
        .map(|s| match s {
            JsonSegment::Key(k) => {
                format!("\"{}\"", k.replace('"', "\\\"").replace('\'', "''"))
            }
            JsonSegment::Index(i) => format!("\"{i}\""),
            JsonSegment::Iterate | JsonSegment::Named(_) => "\"*\"".to_string(),
        })
        .collect();
    format!("{base} {operator} '{{{}}}'", elements.join(","))
}
