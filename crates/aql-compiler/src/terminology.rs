//! Terminology collaborator used by `TERMINOLOGY(...)` calls in WHERE.
//!
//! The compiler calls the service synchronously while assembling the WHERE
//! clause and inlines the answer as literals:
//! - `expand` replaces the call by the quoted codes of a value set;
//! - `validate` replaces it by `true` or `false`.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The three string arguments of `TERMINOLOGY(operation, service_api, parameter)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminologyParam {
    pub operation: String,
    pub service_api: String,
    pub parameter: String,
}

impl TerminologyParam {
    pub fn new(
        operation: impl Into<String>,
        service_api: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            service_api: service_api.into(),
            parameter: parameter.into(),
        }
    }

    /// Value-set url of the parameter: the `url` form field, or the raw
    /// parameter when it carries no form fields.
    pub fn value_set_url(&self) -> String {
        self.form_field("url")
            .unwrap_or_else(|| self.parameter.trim().to_string())
    }

    /// Value of a `key=value&...` form field in the parameter.
    pub fn form_field(&self, key: &str) -> Option<String> {
        url::form_urlencoded::parse(self.parameter.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

/// One coded concept of an expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedText {
    pub code: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub terminology: String,
}

/// Errors from terminology operations.
#[derive(Debug, Error)]
pub enum TerminologyError {
    /// The code is not part of the value set.
    #[error("Code {code} is not a member of {value_set}")]
    ConstraintViolation { code: String, value_set: String },

    #[error("ValueSet not found: {0}")]
    UnknownValueSet(String),

    #[error("Terminology service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid terminology parameter: {0}")]
    InvalidParameter(String),
}

/// Synchronous terminology lookups.
pub trait TerminologyService: Send + Sync {
    fn expand(&self, param: &TerminologyParam) -> Result<Vec<CodedText>, TerminologyError>;

    /// `Ok(true)` for a valid code, `Err(ConstraintViolation)` for a code
    /// outside the value set.
    fn validate(&self, param: &TerminologyParam) -> Result<bool, TerminologyError>;
}

/// Value sets held in memory, keyed by url.
#[derive(Debug, Clone, Default)]
pub struct StaticTerminology {
    value_sets: Arc<DashMap<String, Vec<CodedText>>>,
}

impl StaticTerminology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON object mapping value-set urls to concept lists.
    pub fn from_json(value: serde_json::Value) -> Result<Self, TerminologyError> {
        let sets: std::collections::HashMap<String, Vec<CodedText>> =
            serde_json::from_value(value)
                .map_err(|e| TerminologyError::InvalidParameter(e.to_string()))?;
        let terminology = Self::new();
        for (url, concepts) in sets {
            terminology.insert(url, concepts);
        }
        Ok(terminology)
    }

    pub fn insert(&self, url: impl Into<String>, concepts: Vec<CodedText>) {
        self.value_sets.insert(url.into(), concepts);
    }

    pub fn len(&self) -> usize {
        self.value_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value_sets.is_empty()
    }
}

impl TerminologyService for StaticTerminology {
    fn expand(&self, param: &TerminologyParam) -> Result<Vec<CodedText>, TerminologyError> {
        let url = param.value_set_url();
        self.value_sets
            .get(&url)
            .map(|entry| entry.value().clone())
            .ok_or(TerminologyError::UnknownValueSet(url))
    }

    fn validate(&self, param: &TerminologyParam) -> Result<bool, TerminologyError> {
        let url = param
            .form_field("url")
            .ok_or_else(|| TerminologyError::InvalidParameter(param.parameter.clone()))?;
        let code = param
            .form_field("code")
            .ok_or_else(|| TerminologyError::InvalidParameter(param.parameter.clone()))?;

        let concepts = self
            .value_sets
            .get(&url)
            .ok_or_else(|| TerminologyError::UnknownValueSet(url.clone()))?;
        if concepts.iter().any(|c| c.code == code) {
            Ok(true)
        } else {
            Err(TerminologyError::ConstraintViolation {
                code,
                value_set: url,
            })
        }
    }
}

/// Service used when no terminology server is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTerminology;

impl TerminologyService for DisabledTerminology {
    fn expand(&self, _param: &TerminologyParam) -> Result<Vec<CodedText>, TerminologyError> {
        Err(TerminologyError::Unavailable(
            "terminology service is disabled".to_string(),
        ))
    }

    fn validate(&self, _param: &TerminologyParam) -> Result<bool, TerminologyError> {
        Err(TerminologyError::Unavailable(
            "terminology service is disabled".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminology() -> StaticTerminology {
        let terminology = StaticTerminology::new();
        terminology.insert(
            "http://snomed.info/sct?fhir_vs=isa/73211009",
            vec![
                CodedText {
                    code: "44054006".into(),
                    value: "Diabetes mellitus type 2".into(),
                    terminology: "SNOMED-CT".into(),
                },
                CodedText {
                    code: "46635009".into(),
                    value: "Diabetes mellitus type 1".into(),
                    terminology: "SNOMED-CT".into(),
                },
            ],
        );
        terminology
    }

    #[test]
    fn test_expand_known_value_set() {
        let param = TerminologyParam::new(
            "expand",
            "hl7.org/fhir/R4",
            "http://snomed.info/sct?fhir_vs=isa/73211009",
        );
        let codes = terminology().expand(&param).unwrap();
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].code, "44054006");
    }

    #[test]
    fn test_expand_unknown_value_set() {
        let param = TerminologyParam::new("expand", "hl7.org/fhir/R4", "http://nowhere");
        assert!(matches!(
            terminology().expand(&param),
            Err(TerminologyError::UnknownValueSet(_))
        ));
    }

    #[test]
    fn test_validate_form_encoded_parameter() {
        let url = "http%3A%2F%2Fsnomed.info%2Fsct%3Ffhir_vs%3Disa%2F73211009";
        let ok = TerminologyParam::new("validate", "hl7.org/fhir/R4", format!("url={url}&code=44054006"));
        assert!(terminology().validate(&ok).unwrap());

        let bad = TerminologyParam::new("validate", "hl7.org/fhir/R4", format!("url={url}&code=1"));
        assert!(matches!(
            terminology().validate(&bad),
            Err(TerminologyError::ConstraintViolation { .. })
        ));

        let missing = TerminologyParam::new("validate", "hl7.org/fhir/R4", "code=1");
        assert!(matches!(
            terminology().validate(&missing),
            Err(TerminologyError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_load_from_json() {
        let terminology = StaticTerminology::from_json(serde_json::json!({
            "urn:vs:colours": [{"code": "red"}, {"code": "blue", "value": "Blue"}]
        }))
        .unwrap();
        assert_eq!(terminology.len(), 1);
    }

    #[test]
    fn test_disabled_service_is_unavailable() {
        let param = TerminologyParam::new("expand", "x", "y");
        assert!(matches!(
            DisabledTerminology.expand(&param),
            Err(TerminologyError::Unavailable(_))
        ));
    }
}
