//! Archetype Query Language compiler.
//!
//! Translates AQL text into SQL over a hybrid relational/JSONB clinical data
//! store. Compilation runs in passes over one parse tree:
//!
//! - [`containment`]: FROM/CONTAINS symbols and boolean containment sets
//! - [`projection`]: SELECT, TOP, ORDER BY, LIMIT/OFFSET
//! - [`where_clause`]: WHERE as a flat token list
//! - [`statements`]: post-processing of the above
//! - [`binding`]: fields, joins, laterals and containment sub-queries, per template
//!
//! The two external collaborators, a [`KnowledgeCache`] describing
//! templates and a [`TerminologyService`], are passed in by reference.
//!
//! ```
//! use aql_compiler::{AqlCompiler, CompilerConfig, DisabledTerminology, InMemoryKnowledgeCache, Parameters};
//!
//! let knowledge = InMemoryKnowledgeCache::new();
//! let compiler = AqlCompiler::new(CompilerConfig::default(), &knowledge, &DisabledTerminology);
//! let compiled = compiler
//!     .compile(
//!         "SELECT c/name/value FROM EHR e[ehr_id/value = $ehr] CONTAINS COMPOSITION c",
//!         &Parameters::new().with("ehr", "7d44b88c"),
//!     )
//!     .unwrap();
//!
//! assert!(compiled.sql.sql.contains("\"ehr_join\".\"id\" = '7d44b88c'"));
//! ```

pub mod binding;
pub mod compiler;
pub mod config;
pub mod containment;
pub mod definition;
pub mod error;
pub mod knowledge;
pub mod literal;
pub mod parameters;
pub mod parser;
pub mod path;
pub mod projection;
pub mod sql_builder;
pub mod statements;
pub mod terminology;
pub mod where_clause;

pub use binding::TemplateQuery;
pub use compiler::{AqlCompiler, CompiledQuery, ResultColumn};
pub use config::CompilerConfig;
pub use error::{CollaboratorError, CompileError, ErrorCategory, Result};
pub use knowledge::{InMemoryKnowledgeCache, KnowledgeCache, KnowledgeError, TemplateDefinition};
pub use parameters::{ParameterValue, Parameters};
pub use parser::{ParseNode, StartRule, parse_fragment, parse_query};
pub use terminology::{
    DisabledTerminology, StaticTerminology, TerminologyError, TerminologyService,
};
