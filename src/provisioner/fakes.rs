//! In-memory object storage and IAM for provisioner tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{BucketProvisioner, BucketProvisionerConfig, ProvisionRequest};
use crate::cloud::{
    AccessKey, CloudError, CloudResult, IamUser, IdentityManager, NewUser, ObjectStorage, Tag,
};
use crate::lock::{InstanceLocker, MemoryLockService};
use crate::settings::{LockSettings, ProviderSettings};

pub const IP_RESTRICTION_POLICY_ARN: &str = "arn:aws:iam::123456789012:policy/ip-restriction";

#[derive(Debug, Clone, Default)]
pub struct FakeBucket {
    pub policy: Option<String>,
    pub tags: Vec<Tag>,
    pub encrypted: bool,
    pub public_access_blocked: bool,
}

#[derive(Debug, Clone)]
pub struct FakeUser {
    pub path: String,
    pub arn: String,
    pub keys: Vec<String>,
    pub policies: Vec<String>,
    pub tags: Vec<Tag>,
    pub boundary: Option<String>,
}

struct Failure {
    code: String,
    remaining: Option<u32>,
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, FakeBucket>,
    users: HashMap<String, FakeUser>,
    failures: HashMap<&'static str, Failure>,
    hangs: HashSet<&'static str>,
    calls: Vec<&'static str>,
    next_key: u32,
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<State>,
}

impl FakeCloud {
    /// Fail every call of `operation` with the given error code
    pub fn fail(&self, operation: &'static str, code: &str) {
        self.state.lock().unwrap().failures.insert(
            operation,
            Failure {
                code: code.to_string(),
                remaining: None,
            },
        );
    }

    /// Fail the next `times` calls of `operation`
    pub fn fail_times(&self, operation: &'static str, code: &str, times: u32) {
        self.state.lock().unwrap().failures.insert(
            operation,
            Failure {
                code: code.to_string(),
                remaining: Some(times),
            },
        );
    }

    /// Never complete calls of `operation`
    pub fn hang(&self, operation: &'static str) {
        self.state.lock().unwrap().hangs.insert(operation);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|call| **call == operation).count()
    }

    pub fn bucket(&self, name: &str) -> Option<FakeBucket> {
        self.state.lock().unwrap().buckets.get(name).cloned()
    }

    pub fn bucket_policy(&self, name: &str) -> Option<String> {
        self.bucket(name).and_then(|bucket| bucket.policy)
    }

    pub fn user(&self, name: &str) -> Option<FakeUser> {
        self.state.lock().unwrap().users.get(name).cloned()
    }

    pub fn create_bucket_directly(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .insert(name.to_string(), FakeBucket::default());
    }

    pub fn set_bucket_policy(&self, name: &str, policy: &str) {
        if let Some(bucket) = self.state.lock().unwrap().buckets.get_mut(name) {
            bucket.policy = Some(policy.to_string());
        }
    }

    pub fn remove_bucket_policy_directly(&self, name: &str) {
        if let Some(bucket) = self.state.lock().unwrap().buckets.get_mut(name) {
            bucket.policy = None;
        }
    }

    pub fn remove_user_directly(&self, name: &str) {
        self.state.lock().unwrap().users.remove(name);
    }

    /// Record a call and apply injected failures and hangs
    async fn enter(&self, operation: &'static str) -> CloudResult<()> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(operation);

            if let Some(failure) = state.failures.get_mut(operation) {
                let code = failure.code.clone();
                match failure.remaining {
                    Some(0) => {}
                    Some(ref mut remaining) => {
                        *remaining -= 1;
                        return Err(CloudError::new(operation, Some(&code), "injected failure"));
                    }
                    None => {
                        return Err(CloudError::new(operation, Some(&code), "injected failure"))
                    }
                }
            }
            state.hangs.contains(operation)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn with_bucket<T>(
        &self,
        operation: &'static str,
        name: &str,
        f: impl FnOnce(&mut FakeBucket) -> CloudResult<T>,
    ) -> CloudResult<T> {
        let mut state = self.state.lock().unwrap();
        match state.buckets.get_mut(name) {
            Some(bucket) => f(bucket),
            None => Err(CloudError::new(
                operation,
                Some("NoSuchBucket"),
                "The specified bucket does not exist",
            )),
        }
    }

    fn with_user<T>(
        &self,
        operation: &'static str,
        name: &str,
        f: impl FnOnce(&mut FakeUser) -> CloudResult<T>,
    ) -> CloudResult<T> {
        let mut state = self.state.lock().unwrap();
        match state.users.get_mut(name) {
            Some(user) => f(user),
            None => Err(CloudError::new(
                operation,
                Some("NoSuchEntity"),
                format!("The user with name {} cannot be found.", name),
            )),
        }
    }
}

#[async_trait]
impl ObjectStorage for FakeCloud {
    async fn create_bucket(&self, bucket: &str) -> CloudResult<()> {
        self.enter("create-bucket").await?;
        let mut state = self.state.lock().unwrap();
        if state.buckets.contains_key(bucket) {
            return Err(CloudError::new(
                "create-bucket",
                Some("BucketAlreadyOwnedByYou"),
                "Your previous request to create the named bucket succeeded",
            ));
        }
        state
            .buckets
            .insert(bucket.to_string(), FakeBucket::default());
        Ok(())
    }

    async fn head_bucket(&self, bucket: &str) -> CloudResult<()> {
        self.enter("head-bucket").await?;
        self.with_bucket("head-bucket", bucket, |_| Ok(()))
            .map_err(|_| CloudError::not_found("head-bucket", "bucket not found"))
    }

    async fn delete_bucket(&self, bucket: &str) -> CloudResult<()> {
        self.enter("delete-bucket").await?;
        self.with_bucket("delete-bucket", bucket, |_| Ok(()))?;
        self.state.lock().unwrap().buckets.remove(bucket);
        Ok(())
    }

    async fn put_bucket_encryption(&self, bucket: &str) -> CloudResult<()> {
        self.enter("put-bucket-encryption").await?;
        self.with_bucket("put-bucket-encryption", bucket, |b| {
            b.encrypted = true;
            Ok(())
        })
    }

    async fn put_public_access_block(&self, bucket: &str) -> CloudResult<()> {
        self.enter("put-public-access-block").await?;
        self.with_bucket("put-public-access-block", bucket, |b| {
            b.public_access_blocked = true;
            Ok(())
        })
    }

    async fn delete_public_access_block(&self, bucket: &str) -> CloudResult<()> {
        self.enter("delete-public-access-block").await?;
        self.with_bucket("delete-public-access-block", bucket, |b| {
            b.public_access_blocked = false;
            Ok(())
        })
    }

    async fn put_bucket_tagging(&self, bucket: &str, tags: &[Tag]) -> CloudResult<()> {
        self.enter("put-bucket-tagging").await?;
        self.with_bucket("put-bucket-tagging", bucket, |b| {
            b.tags = tags.to_vec();
            Ok(())
        })
    }

    async fn get_bucket_policy(&self, bucket: &str) -> CloudResult<String> {
        self.enter("get-bucket-policy").await?;
        self.with_bucket("get-bucket-policy", bucket, |b| {
            b.policy.clone().ok_or_else(|| {
                CloudError::new(
                    "get-bucket-policy",
                    Some("NoSuchBucketPolicy"),
                    "The bucket policy does not exist",
                )
            })
        })
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> CloudResult<()> {
        self.enter("put-bucket-policy").await?;
        self.with_bucket("put-bucket-policy", bucket, |b| {
            b.policy = Some(policy.to_string());
            Ok(())
        })
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> CloudResult<()> {
        self.enter("delete-bucket-policy").await?;
        self.with_bucket("delete-bucket-policy", bucket, |b| {
            b.policy = None;
            Ok(())
        })
    }
}

#[async_trait]
impl IdentityManager for FakeCloud {
    async fn create_user(&self, user: &NewUser) -> CloudResult<IamUser> {
        self.enter("create-user").await?;
        let mut state = self.state.lock().unwrap();
        if state.users.contains_key(&user.user_name) {
            return Err(CloudError::new(
                "create-user",
                Some("EntityAlreadyExists"),
                format!("User with name {} already exists.", user.user_name),
            ));
        }

        let arn = format!(
            "arn:aws:iam::123456789012:user{}{}",
            user.path, user.user_name
        );
        state.users.insert(
            user.user_name.clone(),
            FakeUser {
                path: user.path.clone(),
                arn: arn.clone(),
                keys: Vec::new(),
                policies: Vec::new(),
                tags: user.tags.clone(),
                boundary: user.permissions_boundary.clone(),
            },
        );
        Ok(IamUser {
            user_name: user.user_name.clone(),
            arn,
        })
    }

    async fn get_user(&self, user_name: &str) -> CloudResult<IamUser> {
        self.enter("get-user").await?;
        self.with_user("get-user", user_name, |u| {
            Ok(IamUser {
                user_name: user_name.to_string(),
                arn: u.arn.clone(),
            })
        })
    }

    async fn delete_user(&self, user_name: &str) -> CloudResult<()> {
        self.enter("delete-user").await?;
        self.with_user("delete-user", user_name, |u| {
            if u.keys.is_empty() && u.policies.is_empty() {
                Ok(())
            } else {
                Err(CloudError::new(
                    "delete-user",
                    Some("DeleteConflict"),
                    "Cannot delete entity, must delete access keys and detach policies first.",
                ))
            }
        })?;
        self.state.lock().unwrap().users.remove(user_name);
        Ok(())
    }

    async fn create_access_key(&self, user_name: &str) -> CloudResult<AccessKey> {
        self.enter("create-access-key").await?;
        let key_number = {
            let mut state = self.state.lock().unwrap();
            state.next_key += 1;
            state.next_key
        };
        self.with_user("create-access-key", user_name, |u| {
            let access_key_id = format!("AKIAFAKE{:08}", key_number);
            u.keys.push(access_key_id.clone());
            Ok(AccessKey {
                access_key_id,
                secret_access_key: format!("secret-{}", key_number),
            })
        })
    }

    async fn list_access_keys(&self, user_name: &str) -> CloudResult<Vec<String>> {
        self.enter("list-access-keys").await?;
        self.with_user("list-access-keys", user_name, |u| Ok(u.keys.clone()))
    }

    async fn delete_access_key(&self, user_name: &str, access_key_id: &str) -> CloudResult<()> {
        self.enter("delete-access-key").await?;
        self.with_user("delete-access-key", user_name, |u| {
            u.keys.retain(|key| key != access_key_id);
            Ok(())
        })
    }

    async fn attach_user_policy(&self, user_name: &str, policy_arn: &str) -> CloudResult<()> {
        self.enter("attach-user-policy").await?;
        self.with_user("attach-user-policy", user_name, |u| {
            u.policies.push(policy_arn.to_string());
            Ok(())
        })
    }

    async fn list_attached_user_policies(&self, user_name: &str) -> CloudResult<Vec<String>> {
        self.enter("list-attached-user-policies").await?;
        self.with_user("list-attached-user-policies", user_name, |u| {
            Ok(u.policies.clone())
        })
    }

    async fn detach_user_policy(&self, user_name: &str, policy_arn: &str) -> CloudResult<()> {
        self.enter("detach-user-policy").await?;
        self.with_user("detach-user-policy", user_name, |u| {
            u.policies.retain(|policy| policy != policy_arn);
            Ok(())
        })
    }
}

/// Route logs to the test output, filtered by RUST_LOG
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A provisioner wired to a fake cloud and an in-process lock service
pub struct Harness {
    pub provisioner: BucketProvisioner,
    pub cloud: Arc<FakeCloud>,
    pub locks: Arc<MemoryLockService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(json!({}))
    }

    /// A harness whose instance `instance_id` already has a bucket
    pub fn with_bucket(instance_id: &str) -> Self {
        let harness = Self::new();
        let bucket_name = harness.provisioner.bucket_name(instance_id);
        harness.cloud.create_bucket_directly(&bucket_name);
        harness
    }

    /// A harness with `overrides` merged into the default provider settings
    pub fn with_settings(overrides: Value) -> Self {
        init_tracing();

        let mut settings = json!({
            "aws_region": "eu-west-2",
            "resource_prefix": "test-paas-s3-broker-",
            "iam_user_path": "test-paas-s3-broker",
            "deploy_env": "test",
            "iam_ip_restriction_policy_arn": IP_RESTRICTION_POLICY_ARN,
        });
        if let (Some(settings), Value::Object(overrides)) = (settings.as_object_mut(), overrides) {
            settings.extend(overrides);
        }
        let settings = ProviderSettings::from_json(settings.to_string().as_bytes()).unwrap();

        let cloud = Arc::new(FakeCloud::default());
        let locks = Arc::new(MemoryLockService::new());
        let provisioner = BucketProvisioner::new(BucketProvisionerConfig {
            storage: cloud.clone(),
            identity: cloud.clone(),
            locker: InstanceLocker::new(locks.clone(), &LockSettings::default()),
            settings,
        });

        Self {
            provisioner,
            cloud,
            locks,
        }
    }

    pub fn provision_request(instance_id: &str) -> ProvisionRequest {
        ProvisionRequest {
            instance_id: instance_id.to_string(),
            service_id: "service-guid".to_string(),
            plan_id: "plan-guid".to_string(),
            organization_guid: "org-guid".to_string(),
            space_guid: "space-guid".to_string(),
            raw_parameters: None,
        }
    }
}
