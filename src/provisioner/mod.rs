//! Service instance and binding lifecycle
//!
//! A service instance is one S3 bucket named `<prefix><instance id>`. A binding
//! is one IAM user named `<prefix><binding id>` with an access key, granted
//! access through a statement in the bucket policy. Every operation runs under
//! the instance lock and the operation deadline.

mod binding;
mod bucket;
#[cfg(test)]
mod fakes;
mod models;

pub use models::{
    BindParams, BindRequest, BucketCredentials, DeprovisionRequest, ProvisionParams,
    ProvisionRequest, UnbindRequest,
};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::cloud::{CloudResult, IdentityManager, ObjectStorage};
use crate::error::{BrokerError, BrokerResult};
use crate::lock::InstanceLocker;
use crate::settings::ProviderSettings;

/// Value of the `created_by` tag on buckets and users
pub const BROKER_NAME: &str = "paas-s3-broker";

const WAIT_MAX_ATTEMPTS: u32 = 15;
const WAIT_DELAY: Duration = Duration::from_secs(3);

pub struct BucketProvisionerConfig {
    pub storage: Arc<dyn ObjectStorage>,
    pub identity: Arc<dyn IdentityManager>,
    pub locker: InstanceLocker,
    pub settings: ProviderSettings,
}

#[derive(Clone)]
pub struct BucketProvisioner {
    storage: Arc<dyn ObjectStorage>,
    identity: Arc<dyn IdentityManager>,
    locker: InstanceLocker,
    settings: ProviderSettings,
}

impl BucketProvisioner {
    pub fn new(config: BucketProvisionerConfig) -> Self {
        Self {
            storage: config.storage,
            identity: config.identity,
            locker: config.locker,
            settings: config.settings,
        }
    }

    /// Build a provisioner talking to AWS, locking through Postgres when
    /// `locking.database_url` is set and in-process otherwise.
    #[cfg(feature = "aws")]
    pub async fn from_settings(settings: &crate::settings::Settings) -> anyhow::Result<Self> {
        use crate::lock::{LockService, MemoryLockService};

        let (storage, identity) =
            crate::cloud::aws::load_clients(&settings.provider.aws_region).await;

        let lock_service: Arc<dyn LockService> = match settings.locking.database_url {
            #[cfg(feature = "postgres")]
            Some(ref database_url) => {
                Arc::new(crate::lock::PostgresLockService::connect(database_url).await?)
            }
            #[cfg(not(feature = "postgres"))]
            Some(_) => {
                anyhow::bail!("locking.database_url is set but postgres support is disabled")
            }
            None => {
                warn!("No lock database configured, instance locks are local to this process");
                Arc::new(MemoryLockService::new())
            }
        };

        Ok(Self::new(BucketProvisionerConfig {
            storage: Arc::new(storage),
            identity: Arc::new(identity),
            locker: InstanceLocker::new(lock_service, &settings.locking),
            settings: settings.provider.clone(),
        }))
    }

    pub fn bucket_name(&self, instance_id: &str) -> String {
        format!("{}{}", self.settings.resource_prefix, instance_id)
    }

    pub fn username(&self, binding_id: &str) -> String {
        format!("{}{}", self.settings.resource_prefix, binding_id)
    }

    /// Run `operation` while holding the lock of `instance_id`.
    ///
    /// Lock acquisition and the operation share one deadline. The lock is
    /// released on every exit path, including expiry of the deadline.
    async fn with_instance_lock<T>(
        &self,
        instance_id: &str,
        operation: impl Future<Output = BrokerResult<T>>,
    ) -> BrokerResult<T> {
        let deadline = self.settings.operation_deadline();
        let expires_at = Instant::now() + deadline;

        let lock = match timeout_at(expires_at, self.locker.acquire(instance_id)).await {
            Ok(lock) => lock?,
            Err(_) => {
                warn!("Timed out acquiring lock for instance '{}'", instance_id);
                return Err(BrokerError::Timeout(deadline));
            }
        };

        let result = match timeout_at(expires_at, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Operation on instance '{}' exceeded deadline of {:?}",
                    instance_id, deadline
                );
                Err(BrokerError::Timeout(deadline))
            }
        };

        self.locker.release(&lock).await;
        result
    }

    /// Write a bucket policy, retrying until it is accepted or the policy
    /// write timeout has passed.
    ///
    /// Freshly created IAM users are not immediately usable as principals, so
    /// the first writes after a bind may be rejected. Every attempt is followed
    /// by a pause to let the write settle.
    async fn put_policy_with_timeout(&self, bucket_name: &str, policy: &str) -> CloudResult<()> {
        let give_up_at = Instant::now() + self.settings.policy_write_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self.storage.put_bucket_policy(bucket_name, policy).await;
            sleep(self.settings.policy_retry_interval()).await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() >= give_up_at => return Err(e),
                Err(e) => debug!(
                    "Policy write for bucket '{}' rejected (attempt {}), retrying: {}",
                    bucket_name, attempt, e
                ),
            }
        }
    }
}

/// Poll `probe` until it succeeds, retrying while it reports NotFound
async fn wait_until_exists<F, Fut>(resource: &str, mut probe: F) -> CloudResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CloudResult<()>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match probe().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() && attempt < WAIT_MAX_ATTEMPTS => {
                debug!("Waiting for '{}' to exist (attempt {})", resource, attempt);
                sleep(WAIT_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}
