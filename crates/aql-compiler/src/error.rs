//! Compiler error taxonomy.

use thiserror::Error;

use crate::knowledge::KnowledgeError;
use crate::sql_builder::SqlBuilderError;
use crate::terminology::TerminologyError;

/// Failures of the two external collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("knowledge cache: {0}")]
    Knowledge(#[from] KnowledgeError),

    #[error("terminology service: {0}")]
    Terminology(#[from] TerminologyError),
}

/// Errors raised while compiling an AQL query.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),

    #[error("Duplicate alias: {0}")]
    DuplicateAlias(String),

    #[error("Duplicate identifier in FROM clause: {0}")]
    DuplicateIdentifier(String),

    #[error("Unbalanced '{symbol}' at offset {position}")]
    UnbalancedGroup { symbol: char, position: usize },

    #[error("Cannot bind {variable} against template {template}")]
    UnknownVariable { variable: String, template: String },

    #[error("Unresolved query parameter: ${0}")]
    UnresolvedParameter(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("SQL generation failed: {0}")]
    Build(#[from] SqlBuilderError),
}

impl From<KnowledgeError> for CompileError {
    fn from(err: KnowledgeError) -> Self {
        Self::Collaborator(CollaboratorError::Knowledge(err))
    }
}

impl From<TerminologyError> for CompileError {
    fn from(err: TerminologyError) -> Self {
        Self::Collaborator(CollaboratorError::Terminology(err))
    }
}

impl CompileError {
    pub fn unknown_variable(variable: impl Into<String>, template: impl Into<String>) -> Self {
        Self::UnknownVariable {
            variable: variable.into(),
            template: template.into(),
        }
    }

    /// Check if this error is caused by the query text (bad request).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Syntax(_)
                | Self::UnsupportedFunction(_)
                | Self::DuplicateAlias(_)
                | Self::DuplicateIdentifier(_)
                | Self::UnbalancedGroup { .. }
                | Self::UnknownVariable { .. }
                | Self::UnresolvedParameter(_)
                | Self::InvalidQuery(_)
        )
    }

    /// Check if this error is caused by the server side (internal error).
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Collaborator(_) | Self::Build(_))
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Syntax(_) | Self::UnbalancedGroup { .. } => ErrorCategory::Syntax,
            Self::UnsupportedFunction(_)
            | Self::DuplicateAlias(_)
            | Self::DuplicateIdentifier(_)
            | Self::UnresolvedParameter(_)
            | Self::InvalidQuery(_) => ErrorCategory::Semantic,
            Self::UnknownVariable { .. } => ErrorCategory::Binding,
            Self::Collaborator(_) => ErrorCategory::Collaborator,
            Self::Build(_) => ErrorCategory::Internal,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Syntax,
    Semantic,
    Binding,
    Collaborator,
    Internal,
}

pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_and_server_boundary() {
        let err = CompileError::DuplicateAlias("x".into());
        assert!(err.is_client_error());
        assert!(!err.is_server_error());
        assert_eq!(err.category(), ErrorCategory::Semantic);

        let err: CompileError = TerminologyError::Unavailable("down".into()).into();
        assert!(err.is_server_error());
        assert_eq!(err.category(), ErrorCategory::Collaborator);
    }

    #[test]
    fn test_unbalanced_message_names_symbol() {
        let err = CompileError::UnbalancedGroup {
            symbol: '{',
            position: 12,
        };
        assert_eq!(err.to_string(), "Unbalanced '{' at offset 12");
    }
}
