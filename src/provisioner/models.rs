use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{BrokerError, BrokerResult};
use crate::policy::{Permissions, READ_WRITE_PERMISSIONS_NAME};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    /// User supplied parameters, e.g. `{"public_bucket": true}`
    #[serde(default)]
    pub raw_parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeprovisionRequest {
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindRequest {
    pub instance_id: String,
    pub binding_id: String,
    /// User supplied parameters, e.g. `{"permissions": "read-only"}`
    #[serde(default)]
    pub raw_parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvisionParams {
    #[serde(default)]
    pub public_bucket: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindParams {
    #[serde(default = "default_permissions")]
    pub permissions: String,
    #[serde(default)]
    pub allow_external_access: bool,
}

fn default_permissions() -> String {
    READ_WRITE_PERMISSIONS_NAME.to_string()
}

impl Default for BindParams {
    fn default() -> Self {
        Self {
            permissions: default_permissions(),
            allow_external_access: false,
        }
    }
}

impl BindParams {
    /// The requested permission level; only read-only and read-write can be bound
    pub fn permissions(&self) -> BrokerResult<Permissions> {
        Permissions::from_name(&self.permissions).map_err(|_| {
            BrokerError::validation(format!(
                "permissions must be one of read-only, read-write; got '{}'",
                self.permissions
            ))
        })
    }
}

/// Parse optional raw request parameters, falling back to defaults when absent
pub(crate) fn parse_params<T>(raw: Option<&Value>) -> BrokerResult<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match raw {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) if value.is_object() => T::deserialize(value)
            .map_err(|e| BrokerError::validation(format!("malformed parameters: {}", e))),
        Some(_) => Err(BrokerError::validation(
            "malformed parameters: expected a JSON object",
        )),
    }
}

/// Credentials handed to the application bound to a bucket
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCredentials {
    pub bucket_name: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_region: String,
}

impl fmt::Debug for BucketCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketCredentials")
            .field("bucket_name", &self.bucket_name)
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"<redacted>")
            .field("aws_region", &self.aws_region)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bind_params_defaults() {
        let params: BindParams = parse_params(None).unwrap();
        assert_eq!(params, BindParams::default());
        assert_eq!(params.permissions().unwrap(), Permissions::ReadWrite);

        let params: BindParams = parse_params(Some(&Value::Null)).unwrap();
        assert_eq!(params.permissions().unwrap(), Permissions::ReadWrite);

        // permissions stays read-write when only another parameter is given
        let raw = json!({"allow_external_access": true});
        let params: BindParams = parse_params(Some(&raw)).unwrap();
        assert!(params.allow_external_access);
        assert_eq!(params.permissions().unwrap(), Permissions::ReadWrite);
    }

    #[test]
    fn test_bind_params_invalid_permissions() {
        for permissions in ["", "admin", "public-read", "READ-ONLY"] {
            let raw = json!({ "permissions": permissions });
            let params: BindParams = parse_params(Some(&raw)).unwrap();
            assert!(params.permissions().unwrap_err().is_validation());
        }
    }

    #[test]
    fn test_malformed_params_are_validation_errors() {
        let raw = json!({"public_bucket": "yes please"});
        let err = parse_params::<ProvisionParams>(Some(&raw)).unwrap_err();
        assert!(err.is_validation());

        for raw in [json!(["read-only"]), json!([true]), json!("read-only"), json!(1)] {
            assert!(parse_params::<BindParams>(Some(&raw))
                .unwrap_err()
                .is_validation());
            assert!(parse_params::<ProvisionParams>(Some(&raw))
                .unwrap_err()
                .is_validation());
        }
    }

    #[test]
    fn test_credentials_wire_format() {
        let credentials = BucketCredentials {
            bucket_name: "paas-s3-broker-i1".to_string(),
            aws_access_key_id: "AKIA".to_string(),
            aws_secret_access_key: "secret".to_string(),
            aws_region: "eu-west-2".to_string(),
        };

        assert_eq!(
            serde_json::to_value(&credentials).unwrap(),
            json!({
                "bucket_name": "paas-s3-broker-i1",
                "aws_access_key_id": "AKIA",
                "aws_secret_access_key": "secret",
                "aws_region": "eu-west-2",
            })
        );
        assert!(!format!("{:?}", credentials).contains("secret\""));
    }
}
