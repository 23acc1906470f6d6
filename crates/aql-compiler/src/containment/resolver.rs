//! Pass 1: FROM/CONTAINS resolution.
//!
//! The walk is a fold: every visit takes the [`ResolverState`] by value and
//! returns the next one. Operands are appended to the innermost open set
//! (or the implicit root set). A parenthesized group, or the boolean right
//! hand side of a `CONTAINS`, opens a new set whose `enclosing` is the
//! containment it is nested in. Closing a set parents it to the next open
//! set and appends it there as a single operand.

use tracing::debug;

use super::{
    BoolOp, Containment, ContainmentId, ContainmentSet, EhrPredicate, ForeignDataPredicate,
    IdentifierMapper, PredicateCondition, SetId, SetItem,
};
use crate::error::{CompileError, Result};
use crate::literal::Literal;
use crate::parser::{ParseNode, Rule};

/// Identifier registered for an EHR source written without one.
pub const ANONYMOUS_EHR: &str = "__ehr";

/// Output of pass 1.
#[derive(Debug, Clone, Default)]
pub struct ContainmentResolution {
    pub mapper: IdentifierMapper,
    pub sets: Vec<ContainmentSet>,
    /// Sets in the order they were closed; children always precede parents
    /// and the root set comes last.
    pub closed: Vec<SetId>,
    pub root: Option<SetId>,
    pub has_contains: bool,
    pub requires_template_where_clause: bool,
}

impl ContainmentResolution {
    pub fn set(&self, id: SetId) -> &ContainmentSet {
        &self.sets[id.index()]
    }
}

/// State threaded through the pass 1 fold.
#[derive(Debug, Default)]
pub struct ResolverState {
    mapper: IdentifierMapper,
    sets: Vec<ContainmentSet>,
    open: Vec<(SetId, Option<usize>)>,
    root: Option<SetId>,
    closed: Vec<SetId>,
    pending: Vec<(SetId, BoolOp)>,
    opened_brackets: usize,
    closed_brackets: usize,
    has_contains: bool,
    anonymous: usize,
}

/// Run pass 1 over a parsed query (or a stand-alone CONTAINS fragment).
pub fn resolve(tree: &ParseNode) -> Result<ContainmentResolution> {
    let state = match tree.find(Rule::from_clause) {
        Some(from) => from
            .children
            .iter()
            .try_fold(ResolverState::default(), ResolverState::visit_from)?,
        None => {
            let expr = tree.find(Rule::contains_expr).ok_or_else(|| {
                CompileError::Syntax("query has neither FROM nor CONTAINS clause".to_string())
            })?;
            ResolverState::default().with_contains().visit_expr(expr, None)?
        }
    };
    state.finish()
}

impl ResolverState {
    fn visit_from(self, node: &ParseNode) -> Result<Self> {
        match node.rule {
            Rule::from_ehr => self.register_ehr(node),
            Rule::from_foreign => self.register_foreign(node),
            Rule::contains_expr => self.with_contains().visit_expr(node, None),
            _ => Ok(self),
        }
    }

    fn with_contains(self) -> Self {
        Self {
            has_contains: true,
            ..self
        }
    }

    fn visit_expr(self, expr: &ParseNode, enclosing: Option<ContainmentId>) -> Result<Self> {
        expr.children
            .iter()
            .try_fold(self, |state, child| match child.rule {
                Rule::contains_operand => state.visit_operand(child, enclosing),
                Rule::contains_bool_op => Ok(state.push_operator(child.text.parse()?)),
                Rule::contains_expr => state.visit_expr(child, enclosing),
                _ => Ok(state),
            })
    }

    fn visit_operand(self, operand: &ParseNode, enclosing: Option<ContainmentId>) -> Result<Self> {
        if let Some(class) = operand.child(Rule::class_expr) {
            let (state, id) = self.add_containment(class, enclosing)?;
            return match operand.child(Rule::contains_expr) {
                None => Ok(state),
                Some(nested) if nested.has(Rule::contains_bool_op) => state
                    .open_set(Some(id), None)
                    .visit_expr(nested, Some(id))?
                    .close_set(nested.span.1),
                Some(nested) => state.visit_expr(nested, Some(id)),
            };
        }

        match (
            operand.child(Rule::open_paren),
            operand.child(Rule::contains_expr),
        ) {
            (Some(open), Some(inner)) => {
                let close = operand
                    .child(Rule::close_paren)
                    .map_or(operand.span.1, |c| c.span.0);
                self.open_set(enclosing, Some(open.span.0))
                    .visit_expr(inner, enclosing)?
                    .close_set(close)
            }
            _ => Ok(self),
        }
    }

    fn add_containment(
        mut self,
        class: &ParseNode,
        enclosing: Option<ContainmentId>,
    ) -> Result<(Self, ContainmentId)> {
        let mut identifiers = class.children_of(Rule::identifier);
        let class_name = identifiers
            .next()
            .map(|n| n.text.to_ascii_uppercase())
            .ok_or_else(|| CompileError::Syntax(format!("missing class in '{}'", class.text)))?;
        let symbol = match identifiers.next() {
            Some(symbol) => symbol.text.clone(),
            None => {
                self.anonymous += 1;
                format!("__{}_{}", class_name.to_ascii_lowercase(), self.anonymous)
            }
        };
        let archetype_id = class.find(Rule::archetype_id).map(|n| n.text.clone());

        debug!(%class_name, %symbol, ?archetype_id, "containment");
        let id = self.mapper.register_containment(Containment {
            class_name,
            symbol,
            archetype_id,
            enclosing,
        })?;
        Ok((self.append_operand(SetItem::Containment(id)), id))
    }

    fn register_ehr(mut self, node: &ParseNode) -> Result<Self> {
        let identifier = node
            .child(Rule::identifier)
            .map_or_else(|| ANONYMOUS_EHR.to_string(), |n| n.text.clone());
        let condition = node.child(Rule::standard_predicate).map(predicate_condition);
        self.mapper.register_ehr(EhrPredicate {
            identifier,
            condition,
        })?;
        Ok(self)
    }

    fn register_foreign(mut self, node: &ParseNode) -> Result<Self> {
        let class_name = node
            .child(Rule::foreign_class)
            .map(|n| n.text.to_ascii_uppercase())
            .unwrap_or_default();
        let identifier = node
            .child(Rule::identifier)
            .map(|n| n.text.clone())
            .unwrap_or_default();
        let condition = node.child(Rule::standard_predicate).map(predicate_condition);
        self.mapper.register_foreign(ForeignDataPredicate {
            class_name,
            identifier,
            condition,
        })?;
        Ok(self)
    }

    /// The innermost open set, or the root set (created on first use).
    fn target(&mut self) -> SetId {
        if let Some((top, _)) = self.open.last() {
            return *top;
        }
        match self.root {
            Some(root) => root,
            None => {
                let root = self.new_set(None);
                self.root = Some(root);
                root
            }
        }
    }

    fn new_set(&mut self, enclosing: Option<ContainmentId>) -> SetId {
        let id = SetId::new(self.sets.len());
        self.sets.push(ContainmentSet::new(id, enclosing));
        id
    }

    fn append_operand(mut self, item: SetItem) -> Self {
        let target = self.target();
        let (deferred, pending): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|(set, _)| *set == target);
        self.pending = pending;

        let set = &mut self.sets[target.index()];
        set.items
            .extend(deferred.into_iter().map(|(_, op)| SetItem::Operator(op)));
        set.items.push(item);
        self
    }

    fn push_operator(mut self, op: BoolOp) -> Self {
        let target = self.target();
        let set = &mut self.sets[target.index()];
        if set.has_operand() {
            set.items.push(SetItem::Operator(op));
        } else {
            self.pending.push((target, op));
        }
        self
    }

    fn open_set(mut self, enclosing: Option<ContainmentId>, bracket: Option<usize>) -> Self {
        let id = self.new_set(enclosing);
        self.open.push((id, bracket));
        if bracket.is_some() {
            self.opened_brackets += 1;
        }
        self
    }

    fn close_set(mut self, position: usize) -> Result<Self> {
        let (id, bracket) = self.open.pop().ok_or(CompileError::UnbalancedGroup {
            symbol: ')',
            position,
        })?;
        if self.pending.iter().any(|(set, _)| *set == id) {
            return Err(CompileError::InvalidQuery(
                "boolean operator without operand in CONTAINS group".to_string(),
            ));
        }
        if bracket.is_some() {
            self.closed_brackets += 1;
        }

        let parent = self.target();
        self.sets[id.index()].parent = Some(parent);
        self.closed.push(id);
        Ok(self.append_operand(SetItem::Group(id)))
    }

    fn finish(mut self) -> Result<ContainmentResolution> {
        if let Some((_, bracket)) = self.open.last() {
            return Err(CompileError::UnbalancedGroup {
                symbol: '(',
                position: bracket.unwrap_or_default(),
            });
        }
        if self.opened_brackets != self.closed_brackets {
            return Err(CompileError::UnbalancedGroup {
                symbol: if self.opened_brackets > self.closed_brackets {
                    '('
                } else {
                    ')'
                },
                position: 0,
            });
        }
        if !self.pending.is_empty() {
            return Err(CompileError::InvalidQuery(
                "boolean operator without operand in CONTAINS clause".to_string(),
            ));
        }
        if let Some(root) = self.root
            && self.sets[root.index()].has_operand()
        {
            self.closed.push(root);
        }

        let requires_template_where_clause = self
            .mapper
            .containments()
            .any(|(_, c)| !c.is_composition() || c.archetype_id.is_some());

        Ok(ContainmentResolution {
            mapper: self.mapper,
            sets: self.sets,
            closed: self.closed,
            root: self.root,
            has_contains: self.has_contains,
            requires_template_where_clause,
        })
    }
}

fn predicate_condition(node: &ParseNode) -> PredicateCondition {
    PredicateCondition {
        path: node
            .child(Rule::predicate_path)
            .map(|n| n.text.clone())
            .unwrap_or_default(),
        operator: node
            .child(Rule::comparison_op)
            .map(|n| n.text.clone())
            .unwrap_or_else(|| "=".to_string()),
        value: node
            .child(Rule::literal)
            .map(|n| Literal::from_node(n).to_sql())
            .unwrap_or_else(|| "NULL".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containment::Symbol;
    use crate::parser::parse_query;

    fn resolve_text(text: &str) -> ContainmentResolution {
        resolve(&parse_query(text).unwrap()).unwrap()
    }

    #[test]
    fn test_chain_goes_into_root_set() {
        let res = resolve_text(
            "SELECT o FROM EHR e CONTAINS COMPOSITION c CONTAINS OBSERVATION o[openEHR-EHR-OBSERVATION.bp.v1]",
        );
        assert!(res.has_contains);
        assert!(res.requires_template_where_clause);
        assert_eq!(res.closed.len(), 1);
        let root = res.set(res.root.unwrap());
        assert_eq!(root.items.len(), 2);

        let (o, obs) = res.mapper.containment_by_symbol("o").unwrap();
        let (c, _) = res.mapper.containment_by_symbol("c").unwrap();
        assert_eq!(obs.enclosing, Some(c));
        assert_eq!(res.mapper.ancestry(o), vec![c, o]);
        assert!(matches!(res.mapper.get("e"), Some(Symbol::Ehr(_))));
    }

    #[test]
    fn test_parenthesized_group_is_closed_before_root() {
        let res = resolve_text(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c CONTAINS (OBSERVATION o AND EVALUATION v)",
        );
        assert_eq!(res.closed.len(), 2);
        let group = res.set(res.closed[0]);
        let (c, _) = res.mapper.containment_by_symbol("c").unwrap();
        assert_eq!(group.enclosing, Some(c));
        assert_eq!(group.parent, res.root);
        assert_eq!(group.items.len(), 3);
        assert_eq!(group.items[1], SetItem::Operator(BoolOp::And));

        let root = res.set(res.root.unwrap());
        assert_eq!(
            root.items,
            vec![
                SetItem::Containment(c),
                SetItem::Group(res.closed[0])
            ]
        );
        assert_eq!(*res.closed.last().unwrap(), res.root.unwrap());
    }

    #[test]
    fn test_boolean_contains_without_parentheses_opens_group() {
        let res = resolve_text(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c CONTAINS OBSERVATION o OR EVALUATION v",
        );
        assert_eq!(res.closed.len(), 2);
        let group = res.set(res.closed[0]);
        assert_eq!(group.items[1], SetItem::Operator(BoolOp::Or));
        let (_, v) = res.mapper.containment_by_symbol("v").unwrap();
        assert!(v.enclosing.is_some());
    }

    #[test]
    fn test_top_level_operator_stays_in_root() {
        let res = resolve_text("SELECT a FROM EHR e CONTAINS COMPOSITION a AND OBSERVATION b");
        let root = res.set(res.root.unwrap());
        assert_eq!(root.items.len(), 3);
        assert_eq!(root.items[1], SetItem::Operator(BoolOp::And));
    }

    #[test]
    fn test_bare_composition_needs_no_template_filter() {
        let res = resolve_text("SELECT c FROM EHR e CONTAINS COMPOSITION c");
        assert!(!res.requires_template_where_clause);
        let res = resolve_text("SELECT e/ehr_id/value FROM EHR e");
        assert!(!res.has_contains);
        assert!(res.closed.is_empty());
    }

    #[test]
    fn test_class_names_are_upper_cased_and_ids_kept() {
        let res = resolve_text(
            "SELECT o FROM EHR e CONTAINS observation o[openEHR-EHR-OBSERVATION.Blood_Pressure.v1]",
        );
        let (_, o) = res.mapper.containment_by_symbol("o").unwrap();
        assert_eq!(o.class_name, "OBSERVATION");
        assert_eq!(
            o.archetype_id.as_deref(),
            Some("openEHR-EHR-OBSERVATION.Blood_Pressure.v1")
        );
    }

    #[test]
    fn test_ehr_predicate_is_registered() {
        let res = resolve_text("SELECT c FROM EHR e[ehr_id/value='1234'] CONTAINS COMPOSITION c");
        let ehr = res.mapper.ehr_container().unwrap();
        assert_eq!(ehr.identifier, "e");
        let condition = ehr.condition.as_ref().unwrap();
        assert_eq!(condition.path, "ehr_id/value");
        assert_eq!(condition.value, "'1234'");
    }

    #[test]
    fn test_duplicate_symbols_fail() {
        let tree =
            parse_query("SELECT c FROM EHR e CONTAINS COMPOSITION c CONTAINS OBSERVATION c").unwrap();
        assert!(matches!(
            resolve(&tree),
            Err(CompileError::DuplicateIdentifier(_))
        ));
    }

    fn node(rule: Rule, text: &str, children: Vec<ParseNode>) -> ParseNode {
        ParseNode {
            rule,
            text: text.to_string(),
            span: (0, text.len()),
            children,
        }
    }

    #[test]
    fn test_operator_without_operand_fails() {
        let orphan = || node(Rule::contains_bool_op, "AND", vec![]);

        let root = node(Rule::contains_expr, "AND", vec![orphan()]);
        let err = resolve(&root).unwrap_err();
        assert!(matches!(err, CompileError::InvalidQuery(ref m) if m.ends_with("CONTAINS clause")));

        let group = node(
            Rule::contains_expr,
            "(AND)",
            vec![node(
                Rule::contains_operand,
                "(AND)",
                vec![
                    node(Rule::open_paren, "(", vec![]),
                    node(Rule::contains_expr, "AND", vec![orphan()]),
                    node(Rule::close_paren, ")", vec![]),
                ],
            )],
        );
        let err = resolve(&group).unwrap_err();
        assert!(matches!(err, CompileError::InvalidQuery(ref m) if m.ends_with("CONTAINS group")));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_brackets_are_balanced() {
        let res = resolve_text(
            "SELECT c FROM EHR e CONTAINS COMPOSITION c CONTAINS ((OBSERVATION o AND EVALUATION v) OR INSTRUCTION i)",
        );
        assert_eq!(res.closed.len(), 3);
        let inner = res.set(res.closed[0]);
        let outer = res.set(res.closed[1]);
        assert_eq!(inner.parent, Some(outer.id));
        assert_eq!(outer.items[0], SetItem::Group(inner.id));
        assert_eq!(outer.items[1], SetItem::Operator(BoolOp::Or));
    }
}
