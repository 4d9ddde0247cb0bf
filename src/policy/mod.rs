//! Bucket policy documents
//!
//! Pure construction, merge and principal removal over IAM-style JSON policies.
//! Nothing in here talks to the network; callers fetch the current document,
//! transform it and write it back.

mod document;
mod statement;

pub use document::{merge_statement, remove_principal, PolicyDocument, POLICY_VERSION};
pub use statement::{
    bucket_arn, bucket_objects_arn, build_statement, Effect, Permissions, Principal, Statement,
    READ_ONLY_PERMISSIONS_NAME, READ_WRITE_PERMISSIONS_NAME,
};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("malformed policy document: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("provided JSON was well-formed, but is not a policy document: {0}")]
    Shape(#[source] serde_json::Error),
    #[error("could not find a policy statement for principal {0}")]
    PrincipalNotFound(String),
    #[error("unknown permission name {0}")]
    UnknownPermissions(String),
    #[error("failed to serialize policy document: {0}")]
    Serialize(#[source] serde_json::Error),
}
