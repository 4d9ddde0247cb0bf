#[cfg(feature = "aws")]
pub mod aws;

use async_trait::async_trait;
use std::fmt;

pub type CloudResult<T> = Result<T, CloudError>;

/// Coarse classification of a provider error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// The bucket, policy, user or key does not exist
    NotFound,
    AccessDenied,
    AlreadyExists,
    Other,
}

impl CloudErrorKind {
    /// Classify a provider error code
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some(
                "NoSuchBucket"
                | "NoSuchBucketPolicy"
                | "NoSuchEntity"
                | "NoSuchTagSet"
                | "NoSuchPublicAccessBlockConfiguration"
                | "NotFound",
            ) => CloudErrorKind::NotFound,
            Some("AccessDenied") => CloudErrorKind::AccessDenied,
            Some("BucketAlreadyExists" | "BucketAlreadyOwnedByYou" | "EntityAlreadyExists") => {
                CloudErrorKind::AlreadyExists
            }
            _ => CloudErrorKind::Other,
        }
    }
}

/// Error returned by the object storage and IAM seams
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed ({}): {message}", .code.as_deref().unwrap_or("no error code"))]
pub struct CloudError {
    pub operation: &'static str,
    pub kind: CloudErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl CloudError {
    pub fn new(operation: &'static str, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            operation,
            kind: CloudErrorKind::from_code(code),
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            kind: CloudErrorKind::NotFound,
            code: None,
            message: message.into(),
        }
    }

    pub fn other(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            kind: CloudErrorKind::Other,
            code: None,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == CloudErrorKind::NotFound
    }

    /// Whether an IAM error means the user is absent.
    ///
    /// With path-restricted IAM permissions a user that does not exist has no
    /// path to qualify us to see it, so AccessDenied is indistinguishable from
    /// NoSuchEntity.
    pub fn is_absent_iam_entity(&self) -> bool {
        matches!(
            self.kind,
            CloudErrorKind::NotFound | CloudErrorKind::AccessDenied
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamUser {
    pub user_name: String,
    pub arn: String,
}

/// Parameters for creating an IAM user
#[derive(Debug, Clone)]
pub struct NewUser {
    pub user_name: String,
    pub path: String,
    pub tags: Vec<Tag>,
    pub permissions_boundary: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessKey {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKey")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Object storage calls made by the provisioner
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> CloudResult<()>;

    /// Succeeds once the bucket is visible, NotFound otherwise
    async fn head_bucket(&self, bucket: &str) -> CloudResult<()>;

    async fn delete_bucket(&self, bucket: &str) -> CloudResult<()>;

    /// Enable AES-256 server side encryption by default
    async fn put_bucket_encryption(&self, bucket: &str) -> CloudResult<()>;

    /// Block all public ACLs and policies
    async fn put_public_access_block(&self, bucket: &str) -> CloudResult<()>;

    async fn delete_public_access_block(&self, bucket: &str) -> CloudResult<()>;

    async fn put_bucket_tagging(&self, bucket: &str, tags: &[Tag]) -> CloudResult<()>;

    /// Fetch the bucket policy JSON; NotFound when the bucket has no policy
    async fn get_bucket_policy(&self, bucket: &str) -> CloudResult<String>;

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> CloudResult<()>;

    async fn delete_bucket_policy(&self, bucket: &str) -> CloudResult<()>;
}

/// IAM calls made by the provisioner
#[async_trait]
pub trait IdentityManager: Send + Sync {
    async fn create_user(&self, user: &NewUser) -> CloudResult<IamUser>;

    async fn get_user(&self, user_name: &str) -> CloudResult<IamUser>;

    async fn delete_user(&self, user_name: &str) -> CloudResult<()>;

    async fn create_access_key(&self, user_name: &str) -> CloudResult<AccessKey>;

    /// List the ids of all access keys of a user
    async fn list_access_keys(&self, user_name: &str) -> CloudResult<Vec<String>>;

    async fn delete_access_key(&self, user_name: &str, access_key_id: &str) -> CloudResult<()>;

    async fn attach_user_policy(&self, user_name: &str, policy_arn: &str) -> CloudResult<()>;

    /// List the ARNs of all managed policies attached to a user
    async fn list_attached_user_policies(&self, user_name: &str) -> CloudResult<Vec<String>>;

    async fn detach_user_policy(&self, user_name: &str, policy_arn: &str) -> CloudResult<()>;
}
