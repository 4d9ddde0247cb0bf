use anyhow::anyhow;
use tracing::{error, info};

use super::models::parse_params;
use super::{
    wait_until_exists, BucketProvisioner, DeprovisionRequest, ProvisionParams, ProvisionRequest,
    BROKER_NAME,
};
use crate::cloud::Tag;
use crate::error::{BrokerError, BrokerResult};
use crate::policy::{build_statement, Permissions, PolicyDocument};

impl BucketProvisioner {
    /// Create the bucket of a new service instance.
    ///
    /// The bucket is encrypted at rest and blocks all public access unless
    /// `public_bucket` is requested, in which case anyone may read its objects.
    pub async fn provision(&self, request: &ProvisionRequest) -> BrokerResult<()> {
        self.with_instance_lock(&request.instance_id, self.provision_locked(request))
            .await
    }

    async fn provision_locked(&self, request: &ProvisionRequest) -> BrokerResult<()> {
        let params: ProvisionParams = parse_params(request.raw_parameters.as_ref())?;
        let bucket_name = self.bucket_name(&request.instance_id);

        info!("Creating bucket '{}'", bucket_name);
        self.storage.create_bucket(&bucket_name).await.map_err(|e| {
            error!("Failed to create bucket '{}': {}", bucket_name, e);
            e
        })?;

        let storage = &self.storage;
        wait_until_exists(&bucket_name, || storage.head_bucket(&bucket_name))
            .await
            .map_err(|e| {
                error!("Bucket '{}' did not become available: {}", bucket_name, e);
                e
            })?;

        info!("Blocking public access to bucket '{}'", bucket_name);
        self.storage.put_public_access_block(&bucket_name).await?;

        info!("Enabling AES256 default encryption on bucket '{}'", bucket_name);
        self.storage.put_bucket_encryption(&bucket_name).await?;

        if params.public_bucket {
            self.make_bucket_public(&bucket_name).await?;
        }

        let tags = bucket_tags(request, &self.settings.deploy_env);
        info!("Tagging bucket '{}'", bucket_name);
        if let Err(tag_err) = self.storage.put_bucket_tagging(&bucket_name, &tags).await {
            error!("Failed to tag bucket '{}': {}", bucket_name, tag_err);

            info!("Deleting untagged bucket '{}'", bucket_name);
            return Err(match self.storage.delete_bucket(&bucket_name).await {
                Ok(()) => BrokerError::Internal(anyhow!(
                    "error while tagging S3 bucket {}: {}. Bucket has been deleted",
                    bucket_name,
                    tag_err
                )),
                Err(delete_err) => {
                    error!("Failed to delete bucket '{}': {}", bucket_name, delete_err);
                    BrokerError::Internal(anyhow!(
                        "error while tagging S3 bucket {}: {}. Additional error while deleting {}: {}",
                        bucket_name,
                        tag_err,
                        bucket_name,
                        delete_err
                    ))
                }
            });
        }

        info!("Provisioned bucket '{}'", bucket_name);
        Ok(())
    }

    async fn make_bucket_public(&self, bucket_name: &str) -> BrokerResult<()> {
        info!("Removing public access block from bucket '{}'", bucket_name);
        self.storage.delete_public_access_block(bucket_name).await?;

        let statement = build_statement(bucket_name, "*", Permissions::PublicRead);
        let policy = PolicyDocument::new(statement).to_json()?;

        info!("Making bucket '{}' publicly readable", bucket_name);
        self.put_policy_with_timeout(bucket_name, &policy)
            .await
            .map_err(|e| {
                error!("Failed to make bucket '{}' public: {}", bucket_name, e);
                e
            })?;
        Ok(())
    }

    /// Delete the bucket of a service instance
    pub async fn deprovision(&self, request: &DeprovisionRequest) -> BrokerResult<()> {
        self.with_instance_lock(&request.instance_id, self.deprovision_locked(request))
            .await
    }

    async fn deprovision_locked(&self, request: &DeprovisionRequest) -> BrokerResult<()> {
        let bucket_name = self.bucket_name(&request.instance_id);

        info!("Deleting bucket '{}'", bucket_name);
        match self.storage.delete_bucket(&bucket_name).await {
            Ok(()) => {
                info!("Deleted bucket '{}'", bucket_name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!("Bucket '{}' does not exist", bucket_name);
                Err(BrokerError::not_found(format!(
                    "bucket {} does not exist",
                    bucket_name
                )))
            }
            Err(e) => {
                error!("Failed to delete bucket '{}': {}", bucket_name, e);
                Err(e.into())
            }
        }
    }
}

fn bucket_tags(request: &ProvisionRequest, deploy_env: &str) -> Vec<Tag> {
    vec![
        Tag::new("service_instance_guid", &request.instance_id),
        Tag::new("org_guid", &request.organization_guid),
        Tag::new("space_guid", &request.space_guid),
        Tag::new("created_by", BROKER_NAME),
        Tag::new("plan_guid", &request.plan_id),
        Tag::new("deploy_env", deploy_env),
        Tag::new("tenant", &request.organization_guid),
        Tag::new("chargeable_entity", &request.instance_id),
    ]
}
