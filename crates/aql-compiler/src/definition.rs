//! SELECT / ORDER BY item definitions.

use std::fmt;

use crate::literal::Literal;
use crate::path::AqlPath;
use crate::sql_builder::SortOrder;

/// Functions accepted in a SELECT list.
pub const ALLOWED_FUNCTIONS: &[&str] = &[
    "COUNT",
    "MIN",
    "MAX",
    "AVG",
    "SUM",
    "SUBSTR",
    "STRPOS",
    "SPLIT_PART",
    "BTRIM",
    "CONCAT",
    "CONCAT_WS",
    "DECODE",
    "ENCODE",
    "FORMAT",
    "INITCAP",
    "LEFT",
    "LENGTH",
    "LPAD",
    "LTRIM",
    "REGEXP_MATCH",
    "REGEXP_REPLACE",
    "REGEXP_SPLIT_TO_ARRAY",
    "REGEXP_SPLIT_TO_TABLE",
    "REPEAT",
    "REPLACE",
    "REVERSE",
    "RIGHT",
    "RPAD",
    "RTRIM",
    "TRANSLATE",
    "CAST",
    "NOW",
];

/// Aggregates; their presence groups the super-query.
pub const AGGREGATE_FUNCTIONS: &[&str] = &["COUNT", "MIN", "MAX", "AVG", "SUM"];

/// A path rooted at a FROM identifier: `o/data[at0001]/events/time/value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathVariable {
    pub identifier: String,
    /// `None` selects the whole object.
    pub path: Option<AqlPath>,
    /// Alias written in the query.
    pub alias: Option<String>,
    /// Column name in the generated SQL.
    pub column: String,
    pub distinct: bool,
    pub hidden: bool,
    pub function_argument: bool,
}

impl PathVariable {
    pub fn new(identifier: impl Into<String>, path: Option<AqlPath>) -> Self {
        let identifier = identifier.into();
        let path = path.filter(|p| !p.is_empty());
        let column = text_of(&identifier, path.as_ref());
        Self {
            identifier,
            path,
            alias: None,
            column,
            distinct: false,
            hidden: false,
            function_argument: false,
        }
    }

    /// `identifier/path` as written.
    pub fn text(&self) -> String {
        text_of(&self.identifier, self.path.as_ref())
    }

    /// Same identifier and path, ignoring aliases and flags.
    pub fn same_target(&self, other: &PathVariable) -> bool {
        self.identifier == other.identifier && self.path == other.path
    }

    pub fn path_text(&self) -> String {
        self.path.as_ref().map(AqlPath::relative).unwrap_or_default()
    }
}

fn text_of(identifier: &str, path: Option<&AqlPath>) -> String {
    match path {
        Some(p) => format!("{identifier}/{}", p.relative()),
        None => identifier.to_string(),
    }
}

impl fmt::Display for PathVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionParameter {
    Variable(PathVariable),
    /// A literal, already in SQL form.
    Operand(String),
    /// Raw token: `*`, a cast target type.
    Identifier(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDefinition {
    /// Upper-cased function name.
    pub name: String,
    pub alias: String,
    pub parameters: Vec<FunctionParameter>,
}

impl FunctionDefinition {
    pub fn is_aggregate(&self) -> bool {
        AGGREGATE_FUNCTIONS.contains(&self.name.as_str())
    }

    pub fn arguments(&self) -> impl Iterator<Item = &PathVariable> {
        self.parameters.iter().filter_map(|p| match p {
            FunctionParameter::Variable(v) => Some(v),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantDefinition {
    pub value: Literal,
    pub alias: String,
}

/// Opaque expression handed through to the SQL verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDefinition {
    pub context: String,
    pub expression: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Path(PathVariable),
    Function(FunctionDefinition),
    Constant(ConstantDefinition),
    Extension(ExtensionDefinition),
}

impl Variable {
    /// Column name in the result set.
    pub fn column(&self) -> &str {
        match self {
            Self::Path(v) => &v.column,
            Self::Function(f) => &f.alias,
            Self::Constant(c) => &c.alias,
            Self::Extension(e) => &e.alias,
        }
    }

    /// Alias written in the query, if any.
    pub fn explicit_alias(&self) -> Option<&str> {
        match self {
            Self::Path(v) => v.alias.as_deref(),
            Self::Function(f) => Some(&f.alias),
            Self::Constant(c) => Some(&c.alias),
            Self::Extension(e) => Some(&e.alias),
        }
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self, Self::Path(v) if v.hidden)
    }

    pub fn is_distinct(&self) -> bool {
        matches!(self, Self::Path(v) if v.distinct)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    /// Path variables this item reads.
    pub fn path_variables(&self) -> Vec<&PathVariable> {
        match self {
            Self::Path(v) => vec![v],
            Self::Function(f) => f.arguments().collect(),
            Self::Constant(_) | Self::Extension(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopAttributes {
    pub count: usize,
    pub direction: Option<TopDirection>,
}

/// One ORDER BY entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAttribute {
    pub variable: PathVariable,
    pub order: SortOrder,
}
