use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

use super::PolicyError;

pub const READ_ONLY_PERMISSIONS_NAME: &str = "read-only";
pub const READ_WRITE_PERMISSIONS_NAME: &str = "read-write";

/// Permission level granted to a principal on a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permissions {
    ReadOnly,
    ReadWrite,
    /// Anonymous object reads, used for public buckets
    PublicRead,
    None,
}

impl Permissions {
    /// Parse a permission name supplied as a bind parameter.
    ///
    /// Only `read-only` and `read-write` can be requested by users.
    pub fn from_name(name: &str) -> Result<Self, PolicyError> {
        match name {
            READ_ONLY_PERMISSIONS_NAME => Ok(Permissions::ReadOnly),
            READ_WRITE_PERMISSIONS_NAME => Ok(Permissions::ReadWrite),
            other => Err(PolicyError::UnknownPermissions(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Permissions::ReadOnly => READ_ONLY_PERMISSIONS_NAME,
            Permissions::ReadWrite => READ_WRITE_PERMISSIONS_NAME,
            Permissions::PublicRead => "public-read",
            Permissions::None => "none",
        }
    }

    /// S3 actions granted by this permission level, in policy order
    pub fn actions(&self) -> &'static [&'static str] {
        match self {
            Permissions::ReadOnly => &[
                "s3:GetBucketLocation",
                "s3:ListBucket",
                "s3:GetBucketCORS",
                "s3:GetObject",
            ],
            Permissions::ReadWrite => &[
                "s3:GetBucketLocation",
                "s3:ListBucket",
                "s3:GetBucketCORS",
                "s3:PutBucketCORS",
                "s3:GetObject",
                "s3:PutObject",
                "s3:DeleteObject",
            ],
            Permissions::PublicRead => &["s3:GetObject"],
            Permissions::None => &[],
        }
    }
}

impl FromStr for Permissions {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// A single statement of a bucket policy.
///
/// Fields this crate does not manage (`Sid`, `Condition`, ...) are kept in
/// `extra` so statements written by other tools survive a read-modify-write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(
        rename = "Principal",
        default,
        skip_serializing_if = "Principal::is_empty"
    )]
    pub principal: Principal,
    /// Empty for statements using `NotAction`, which is kept in `extra`
    #[serde(
        rename = "Action",
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub action: Vec<String>,
    #[serde(
        rename = "Resource",
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub resource: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `Principal` element of a statement.
///
/// AWS returns a single ARN as a bare string and several ARNs as a list; both
/// are accepted on read. On write a single ARN is emitted as a bare string and
/// anything else as a list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Principal {
    pub aws: Vec<String>,
    /// Non-AWS principal kinds (`Service`, `Federated`, ...), passed through untouched
    pub other: Map<String, Value>,
}

impl Principal {
    pub fn aws(arn: impl Into<String>) -> Self {
        Self {
            aws: vec![arn.into()],
            other: Map::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aws.is_empty() && self.other.is_empty()
    }

    /// Remove every AWS principal ending in `suffix`, returning how many were removed
    pub fn remove_matching(&mut self, suffix: &str) -> usize {
        let before = self.aws.len();
        self.aws.retain(|arn| !arn.ends_with(suffix));
        before - self.aws.len()
    }
}

impl Serialize for Principal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let aws_entries = usize::from(!self.aws.is_empty());
        let mut map = serializer.serialize_map(Some(aws_entries + self.other.len()))?;
        match self.aws.as_slice() {
            [] => {}
            [single] => map.serialize_entry("AWS", single)?,
            many => map.serialize_entry("AWS", many)?,
        }
        for (key, value) in &self.other {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Principal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            // `"Principal": "*"`
            Anonymous(String),
            Map {
                #[serde(rename = "AWS", default, deserialize_with = "one_or_many")]
                aws: Vec<String>,
                #[serde(flatten)]
                other: Map<String, Value>,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Anonymous(arn) => Principal::aws(arn),
            Repr::Map { aws, other } => Principal { aws, other },
        })
    }
}

/// Accept either a single value or a list of values
pub(crate) fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(values) => values,
        OneOrMany::One(value) => vec![value],
    })
}

pub fn bucket_arn(bucket_name: &str) -> String {
    format!("arn:aws:s3:::{}", bucket_name)
}

pub fn bucket_objects_arn(bucket_name: &str) -> String {
    format!("arn:aws:s3:::{}/*", bucket_name)
}

/// Build an `Allow` statement granting `principal_arn` the given permissions on a bucket
pub fn build_statement(
    bucket_name: &str,
    principal_arn: &str,
    permissions: Permissions,
) -> Statement {
    Statement {
        effect: Effect::Allow,
        principal: Principal::aws(principal_arn),
        action: permissions
            .actions()
            .iter()
            .map(|action| action.to_string())
            .collect(),
        resource: vec![bucket_arn(bucket_name), bucket_objects_arn(bucket_name)],
        extra: Map::new(),
    }
}
