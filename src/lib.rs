//! S3 service broker core
//!
//! Provisions one S3 bucket per service instance and one IAM user with an
//! access key per binding, granting bindings access through the bucket policy.
//! Lifecycle operations on an instance are serialized by an instance lock.

pub mod cloud;
pub mod error;
pub mod lock;
pub mod policy;
pub mod provisioner;
pub mod settings;

pub use error::{BrokerError, BrokerResult};
pub use provisioner::{
    BindRequest, BucketCredentials, BucketProvisioner, BucketProvisionerConfig,
    DeprovisionRequest, ProvisionRequest, UnbindRequest,
};
pub use settings::Settings;
