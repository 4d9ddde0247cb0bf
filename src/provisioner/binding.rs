use tracing::{debug, error, info, warn};

use super::models::parse_params;
use super::{
    wait_until_exists, BindParams, BindRequest, BucketCredentials, BucketProvisioner,
    UnbindRequest, BROKER_NAME,
};
use crate::cloud::{AccessKey, CloudError, IamUser, NewUser, Tag};
use crate::error::{BrokerError, BrokerResult};
use crate::policy::{build_statement, merge_statement, remove_principal, Permissions, PolicyError};

impl BucketProvisioner {
    /// Create an IAM user for a binding and grant it access to the instance bucket
    pub async fn bind(&self, request: &BindRequest) -> BrokerResult<BucketCredentials> {
        self.with_instance_lock(&request.instance_id, self.bind_locked(request))
            .await
    }

    async fn bind_locked(&self, request: &BindRequest) -> BrokerResult<BucketCredentials> {
        let params: BindParams = parse_params(request.raw_parameters.as_ref())?;
        let permissions = params.permissions()?;

        let bucket_name = self.bucket_name(&request.instance_id);
        let username = self.username(&request.binding_id);

        let new_user = NewUser {
            user_name: username.clone(),
            path: self.settings.iam_user_path().to_string(),
            tags: vec![
                Tag::new("service_instance_guid", &request.instance_id),
                Tag::new("created_by", BROKER_NAME),
                Tag::new("deploy_env", &self.settings.deploy_env),
            ],
            permissions_boundary: self.settings.permissions_boundary_arn.clone(),
        };

        info!(
            "Creating IAM user '{}' for bucket '{}'",
            username, bucket_name
        );
        let user = self.identity.create_user(&new_user).await.map_err(|e| {
            error!("Failed to create IAM user '{}': {}", username, e);
            e
        })?;

        match self
            .grant_bucket_access(&bucket_name, &user, &params, permissions)
            .await
        {
            Ok(access_key) => {
                info!(
                    "Bound IAM user '{}' to bucket '{}' with {} permissions",
                    username,
                    bucket_name,
                    permissions.name()
                );
                Ok(BucketCredentials {
                    bucket_name,
                    aws_access_key_id: access_key.access_key_id,
                    aws_secret_access_key: access_key.secret_access_key,
                    aws_region: self.settings.aws_region.clone(),
                })
            }
            Err(e) => Err(self.abort_bind(&username, e).await),
        }
    }

    /// Everything a bind does after the user exists; any error here rolls the user back
    async fn grant_bucket_access(
        &self,
        bucket_name: &str,
        user: &IamUser,
        params: &BindParams,
        permissions: Permissions,
    ) -> BrokerResult<AccessKey> {
        let username = user.user_name.as_str();

        let identity = &self.identity;
        wait_until_exists(username, || async move {
            identity.get_user(username).await.map(|_| ())
        })
        .await
        .map_err(|e| {
            error!("IAM user '{}' did not become available: {}", username, e);
            e
        })?;

        if let Some(ref policy_arn) = self.settings.common_user_policy_arn {
            info!("Attaching policy '{}' to IAM user '{}'", policy_arn, username);
            self.identity
                .attach_user_policy(username, policy_arn)
                .await?;
        }

        if !params.allow_external_access {
            let policy_arn = &self.settings.iam_ip_restriction_policy_arn;
            info!(
                "Restricting IAM user '{}' to allowed IPs with policy '{}'",
                username, policy_arn
            );
            self.identity
                .attach_user_policy(username, policy_arn)
                .await?;
        }

        info!("Creating access key for IAM user '{}'", username);
        let access_key = self.identity.create_access_key(username).await?;

        let current_policy = self.fetch_bucket_policy(bucket_name).await?;
        let statement = build_statement(bucket_name, &user.arn, permissions);
        let updated_policy = merge_statement(current_policy.as_deref(), statement)?.to_json()?;

        info!("Adding IAM user '{}' to policy of bucket '{}'", username, bucket_name);
        self.put_policy_with_timeout(bucket_name, &updated_policy)
            .await
            .map_err(|e| {
                error!(
                    "Failed to update policy of bucket '{}': {}",
                    bucket_name, e
                );
                e
            })?;

        Ok(access_key)
    }

    /// Delete the user of a failed bind and return the error that caused it.
    /// A failing cleanup is logged and never replaces that error.
    async fn abort_bind(&self, username: &str, primary: BrokerError) -> BrokerError {
        warn!(
            "Bind of IAM user '{}' failed, deleting user: {}",
            username, primary
        );
        if let Err(cleanup_err) = self.delete_user(username).await {
            error!(
                "Failed to delete IAM user '{}' after failed bind, suppressing: {}",
                username, cleanup_err
            );
        }
        primary
    }

    /// Fetch the bucket policy, `None` when the bucket has none
    async fn fetch_bucket_policy(&self, bucket_name: &str) -> BrokerResult<Option<String>> {
        match self.storage.get_bucket_policy(bucket_name).await {
            Ok(policy) => Ok(Some(policy)),
            Err(e) if e.is_not_found() => {
                debug!("Bucket '{}' has no policy", bucket_name);
                Ok(None)
            }
            Err(e) => {
                error!("Failed to get policy of bucket '{}': {}", bucket_name, e);
                Err(e.into())
            }
        }
    }

    /// Remove a binding's user from the bucket policy and delete the user.
    ///
    /// Succeeds if either the policy statement or the user existed. Returns
    /// NotFound if neither did.
    pub async fn unbind(&self, request: &UnbindRequest) -> BrokerResult<()> {
        self.with_instance_lock(&request.instance_id, self.unbind_locked(request))
            .await
    }

    async fn unbind_locked(&self, request: &UnbindRequest) -> BrokerResult<()> {
        let bucket_name = self.bucket_name(&request.instance_id);
        let username = self.username(&request.binding_id);
        let removed_statement = self.revoke_bucket_access(&bucket_name, &username).await?;

        info!("Deleting IAM user '{}'", username);
        let deleted_user = self.delete_user(&username).await.map_err(|e| {
            error!("Failed to delete IAM user '{}': {}", username, e);
            e
        })?;

        if !removed_statement && !deleted_user {
            return Err(BrokerError::not_found(format!(
                "neither IAM user {} nor a policy statement for it on bucket {} exist",
                username, bucket_name
            )));
        }

        info!("Unbound IAM user '{}' from bucket '{}'", username, bucket_name);
        Ok(())
    }

    /// Remove the user from the bucket policy, deleting the policy once empty.
    /// Returns whether the policy referenced the user.
    async fn revoke_bucket_access(&self, bucket_name: &str, username: &str) -> BrokerResult<bool> {
        let Some(current_policy) = self.fetch_bucket_policy(bucket_name).await? else {
            return Ok(false);
        };

        let principal_suffix = format!(":user{}{}", self.settings.iam_user_path(), username);
        info!(
            "Removing IAM user '{}' from policy of bucket '{}'",
            username, bucket_name
        );
        let updated_policy = match remove_principal(&current_policy, &principal_suffix) {
            Ok(policy) => policy,
            Err(PolicyError::PrincipalNotFound(_)) => {
                debug!(
                    "Policy of bucket '{}' has no statement for IAM user '{}'",
                    bucket_name, username
                );
                return Ok(false);
            }
            Err(e) => {
                error!("Failed to update policy of bucket '{}': {}", bucket_name, e);
                return Err(e.into());
            }
        };

        if updated_policy.is_empty() {
            info!("Deleting now empty policy of bucket '{}'", bucket_name);
            self.storage.delete_bucket_policy(bucket_name).await?;
        } else {
            debug!(
                "Policy of bucket '{}' keeps {} statements",
                bucket_name,
                updated_policy.statement.len()
            );
            self.put_policy_with_timeout(bucket_name, &updated_policy.to_json()?)
                .await?;
        }

        Ok(true)
    }

    /// Delete a user with its access keys and attached policies.
    ///
    /// A user that does not exist, or that we may not see, is treated as
    /// already deleted. Returns whether anything was deleted.
    pub(super) async fn delete_user(&self, username: &str) -> Result<bool, CloudError> {
        let mut had_effect = false;

        let keys = match self.identity.list_access_keys(username).await {
            Ok(keys) => keys,
            Err(e) if e.is_absent_iam_entity() => {
                debug!("No access keys to list for IAM user '{}': {}", username, e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let policies = match self.identity.list_attached_user_policies(username).await {
            Ok(policies) => policies,
            Err(e) if e.is_absent_iam_entity() => {
                debug!("No policies to list for IAM user '{}': {}", username, e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        for access_key_id in &keys {
            self.identity
                .delete_access_key(username, access_key_id)
                .await?;
            had_effect = true;
        }

        for policy_arn in &policies {
            self.identity
                .detach_user_policy(username, policy_arn)
                .await?;
            had_effect = true;
        }

        match self.identity.delete_user(username).await {
            Ok(()) => had_effect = true,
            Err(e) if e.is_absent_iam_entity() => {
                debug!("IAM user '{}' does not exist: {}", username, e);
            }
            Err(e) => return Err(e),
        }

        Ok(had_effect)
    }
}
