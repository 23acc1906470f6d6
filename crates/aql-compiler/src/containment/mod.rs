//! Containment data model and the FROM-clause symbol table.
//!
//! Containments live in an arena owned by [`IdentifierMapper`] and refer to
//! each other through [`ContainmentId`]; boolean groups are kept as
//! [`ContainmentSet`]s indexed by [`SetId`].

mod resolver;

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;

pub use resolver::{ContainmentResolution, ResolverState, resolve};

use crate::error::{CompileError, Result};

/// Class name of the composition root.
pub const COMPOSITION: &str = "COMPOSITION";
/// Class name of the EHR source.
pub const EHR: &str = "EHR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainmentId(usize);

impl ContainmentId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetId(usize);

impl SetId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// One CONTAINS term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Containment {
    /// Upper-cased RM class name.
    pub class_name: String,
    pub symbol: String,
    pub archetype_id: Option<String>,
    /// The containment this one is nested inside.
    pub enclosing: Option<ContainmentId>,
}

impl Containment {
    pub fn is_composition(&self) -> bool {
        self.class_name == COMPOSITION
    }

    /// Materialized label: the archetype id with `-` and `.` replaced by
    /// `_`, or `<CLASS>%` for a bare class.
    pub fn label(&self) -> String {
        match &self.archetype_id {
            Some(id) => labelize(id),
            None => format!("{}%", self.class_name),
        }
    }

    pub fn to_ref(&self) -> ContainmentRef {
        ContainmentRef {
            class_name: self.class_name.clone(),
            archetype_id: self.archetype_id.clone(),
            symbol: self.symbol.clone(),
        }
    }
}

pub fn labelize(archetype_id: &str) -> String {
    archetype_id.replace(['-', '.'], "_")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOp {
    And,
    Or,
    Xor,
}

impl BoolOp {
    /// Binding strength when a set is reduced: AND over XOR over OR.
    pub fn precedence(self) -> u8 {
        match self {
            Self::And => 3,
            Self::Xor => 2,
            Self::Or => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
        }
    }
}

impl FromStr for BoolOp {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(Self::And),
            "OR" => Ok(Self::Or),
            "XOR" => Ok(Self::Xor),
            other => Err(CompileError::Syntax(format!(
                "unknown boolean operator '{other}'"
            ))),
        }
    }
}

impl fmt::Display for BoolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An element of a containment set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetItem {
    Containment(ContainmentId),
    Operator(BoolOp),
    /// A closed nested group standing as one operand.
    Group(SetId),
}

impl SetItem {
    pub fn is_operand(&self) -> bool {
        !matches!(self, Self::Operator(_))
    }
}

/// A parenthesized boolean group of containments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainmentSet {
    pub id: SetId,
    pub items: Vec<SetItem>,
    pub parent: Option<SetId>,
    pub enclosing: Option<ContainmentId>,
}

impl ContainmentSet {
    pub fn new(id: SetId, enclosing: Option<ContainmentId>) -> Self {
        Self {
            id,
            items: Vec::new(),
            parent: None,
            enclosing,
        }
    }

    pub fn has_operand(&self) -> bool {
        self.items.iter().any(SetItem::is_operand)
    }

    pub fn containments(&self) -> impl Iterator<Item = ContainmentId> + '_ {
        self.items.iter().filter_map(|item| match item {
            SetItem::Containment(id) => Some(*id),
            _ => None,
        })
    }
}

/// `FROM EHR e[ehr_id/value = '...']`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EhrPredicate {
    pub identifier: String,
    pub condition: Option<PredicateCondition>,
}

/// `FROM PERSON p[...]` and the other demographic sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignDataPredicate {
    pub class_name: String,
    pub identifier: String,
    pub condition: Option<PredicateCondition>,
}

/// `path op literal` inside a FROM predicate. The literal is kept in its SQL
/// form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateCondition {
    pub path: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    Containment(ContainmentId),
    Ehr(EhrPredicate),
    Foreign(ForeignDataPredicate),
}

/// Compile-time symbol table: identifier to FROM-clause definition.
#[derive(Debug, Clone, Default)]
pub struct IdentifierMapper {
    containments: Vec<Containment>,
    symbols: IndexMap<String, Symbol>,
}

impl IdentifierMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_containment(&mut self, containment: Containment) -> Result<ContainmentId> {
        if self.symbols.contains_key(&containment.symbol) {
            return Err(CompileError::DuplicateIdentifier(containment.symbol));
        }
        let id = ContainmentId(self.containments.len());
        self.symbols
            .insert(containment.symbol.clone(), Symbol::Containment(id));
        self.containments.push(containment);
        Ok(id)
    }

    pub fn register_ehr(&mut self, predicate: EhrPredicate) -> Result<()> {
        if self.symbols.contains_key(&predicate.identifier) {
            return Err(CompileError::DuplicateIdentifier(predicate.identifier));
        }
        self.symbols
            .insert(predicate.identifier.clone(), Symbol::Ehr(predicate));
        Ok(())
    }

    pub fn register_foreign(&mut self, predicate: ForeignDataPredicate) -> Result<()> {
        if self.symbols.contains_key(&predicate.identifier) {
            return Err(CompileError::DuplicateIdentifier(predicate.identifier));
        }
        self.symbols
            .insert(predicate.identifier.clone(), Symbol::Foreign(predicate));
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Option<&Symbol> {
        self.symbols.get(identifier)
    }

    pub fn containment(&self, id: ContainmentId) -> &Containment {
        &self.containments[id.0]
    }

    pub fn containments(&self) -> impl Iterator<Item = (ContainmentId, &Containment)> {
        self.containments
            .iter()
            .enumerate()
            .map(|(i, c)| (ContainmentId(i), c))
    }

    pub fn containment_by_symbol(&self, identifier: &str) -> Option<(ContainmentId, &Containment)> {
        match self.symbols.get(identifier) {
            Some(Symbol::Containment(id)) => Some((*id, self.containment(*id))),
            _ => None,
        }
    }

    /// RM class behind an identifier; `EHR` for the EHR source.
    pub fn class_name_of(&self, identifier: &str) -> Option<&str> {
        match self.symbols.get(identifier)? {
            Symbol::Containment(id) => Some(self.containment(*id).class_name.as_str()),
            Symbol::Ehr(_) => Some(EHR),
            Symbol::Foreign(p) => Some(p.class_name.as_str()),
        }
    }

    pub fn is_ehr(&self, identifier: &str) -> bool {
        matches!(self.symbols.get(identifier), Some(Symbol::Ehr(_)))
    }

    pub fn ehr_container(&self) -> Option<&EhrPredicate> {
        self.symbols.values().find_map(|s| match s {
            Symbol::Ehr(p) => Some(p),
            _ => None,
        })
    }

    /// The chain from the outermost containment down to `id`, inclusive.
    pub fn ancestry(&self, id: ContainmentId) -> Vec<ContainmentId> {
        let mut chain = vec![id];
        let mut current = self.containment(id).enclosing;
        while let Some(parent) = current {
            chain.push(parent);
            current = self.containment(parent).enclosing;
        }
        chain.reverse();
        chain
    }

    pub fn len(&self) -> usize {
        self.containments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containments.is_empty()
    }
}

/// Detached view of a containment handed to the knowledge cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainmentRef {
    pub class_name: String,
    pub archetype_id: Option<String>,
    pub symbol: String,
}

/// Boolean structure of a CONTAINS clause.
///
/// A chain lists containments from the outermost to the innermost, each
/// nested somewhere below the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainmentExpr {
    Chain(Vec<ContainmentRef>),
    Binary {
        op: BoolOp,
        left: Box<ContainmentExpr>,
        right: Box<ContainmentExpr>,
    },
}

impl ContainmentExpr {
    pub fn binary(op: BoolOp, left: ContainmentExpr, right: ContainmentExpr) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Every containment mentioned, in left-to-right order.
    pub fn refs(&self) -> Vec<&ContainmentRef> {
        match self {
            Self::Chain(chain) => chain.iter().collect(),
            Self::Binary { left, right, .. } => {
                let mut refs = left.refs();
                refs.extend(right.refs());
                refs
            }
        }
    }
}
