use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::statement::{one_or_many, Statement};
use super::PolicyError;

pub const POLICY_VERSION: &str = "2012-10-17";

/// A bucket policy as stored on the object store.
///
/// Always re-fetched before mutation; never cached between operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Left as found on existing documents, since a missing version selects
    /// the older policy language
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "Statement", deserialize_with = "one_or_many")]
    pub statement: Vec<Statement>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PolicyDocument {
    /// A new document holding a single statement
    pub fn new(statement: Statement) -> Self {
        Self {
            version: Some(POLICY_VERSION.to_string()),
            statement: vec![statement],
            extra: Map::new(),
        }
    }

    /// Parse a policy document, separating malformed JSON from JSON that is
    /// well-formed but not shaped like a policy.
    pub fn parse(json: &str) -> Result<Self, PolicyError> {
        serde_json::from_str(json).map_err(|e| match e.classify() {
            serde_json::error::Category::Data => PolicyError::Shape(e),
            _ => PolicyError::Parse(e),
        })
    }

    pub fn to_json(&self) -> Result<String, PolicyError> {
        serde_json::to_string(self).map_err(PolicyError::Serialize)
    }

    pub fn is_empty(&self) -> bool {
        self.statement.is_empty()
    }

    /// Whether any statement names a principal ending in `suffix`
    pub fn references_principal(&self, suffix: &str) -> bool {
        self.statement
            .iter()
            .any(|stmt| stmt.principal.aws.iter().any(|arn| arn.ends_with(suffix)))
    }

    /// Remove every principal ending in `suffix`.
    ///
    /// Statements left without any principal are dropped entirely. Fails with
    /// `PolicyError::PrincipalNotFound` when no statement referenced the suffix.
    pub fn without_principal(mut self, suffix: &str) -> Result<Self, PolicyError> {
        let mut removed = 0;
        self.statement.retain_mut(|stmt| {
            let matched = stmt.principal.remove_matching(suffix);
            removed += matched;
            matched == 0 || !stmt.principal.is_empty()
        });

        if removed == 0 {
            return Err(PolicyError::PrincipalNotFound(suffix.to_string()));
        }
        Ok(self)
    }
}

/// Append `statement` to an existing policy, or wrap it in a new document when
/// the bucket has no policy yet (`None` or an empty string).
pub fn merge_statement(
    existing: Option<&str>,
    statement: Statement,
) -> Result<PolicyDocument, PolicyError> {
    match existing.map(str::trim) {
        None | Some("") => Ok(PolicyDocument::new(statement)),
        Some(json) => {
            let mut document = PolicyDocument::parse(json)?;
            document.statement.push(statement);
            Ok(document)
        }
    }
}

/// Remove a principal from a raw policy document, see [`PolicyDocument::without_principal`]
pub fn remove_principal(
    document: &str,
    principal_suffix: &str,
) -> Result<PolicyDocument, PolicyError> {
    PolicyDocument::parse(document)?.without_principal(principal_suffix)
}
