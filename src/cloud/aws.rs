use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_iam::Client as IamClient;
use aws_sdk_s3::error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client as S3Client;
use std::error::Error as StdError;
use std::fmt::Debug;

use super::{
    AccessKey, CloudError, CloudResult, IamUser, IdentityManager, NewUser, ObjectStorage, Tag,
};

/// Convert an SDK error, keeping the service error code for classification
fn sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    R: Debug,
{
    let code = err.code().map(str::to_string);
    CloudError::new(
        operation,
        code.as_deref(),
        DisplayErrorContext(&err).to_string(),
    )
}

fn build_error(operation: &'static str, err: BuildError) -> CloudError {
    CloudError::other(operation, format!("invalid request: {}", err))
}

/// Load S3 and IAM clients for `region` using the default credential chain
pub async fn load_clients(region: &str) -> (AwsObjectStorage, AwsIdentityManager) {
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await;

    (
        AwsObjectStorage::new(S3Client::new(&aws_config), region),
        AwsIdentityManager::new(IamClient::new(&aws_config)),
    )
}

#[derive(Clone)]
pub struct AwsObjectStorage {
    s3_client: S3Client,
    region: String,
}

impl AwsObjectStorage {
    pub fn new(s3_client: S3Client, region: &str) -> Self {
        Self {
            s3_client,
            region: region.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStorage for AwsObjectStorage {
    async fn create_bucket(&self, bucket: &str) -> CloudResult<()> {
        use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};

        let mut request = self.s3_client.create_bucket().bucket(bucket);

        // For regions other than us-east-1, need to specify location constraint
        if self.region != "us-east-1" {
            let constraint = BucketLocationConstraint::from(self.region.as_str());
            let config = CreateBucketConfiguration::builder()
                .location_constraint(constraint)
                .build();
            request = request.create_bucket_configuration(config);
        }

        request
            .send()
            .await
            .map_err(|e| sdk_error("create-bucket", e))?;
        Ok(())
    }

    async fn head_bucket(&self, bucket: &str) -> CloudResult<()> {
        match self.s3_client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                // HEAD responses carry no body, so there may be no error code to classify
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    return Err(CloudError::not_found(
                        "head-bucket",
                        format!("bucket {} not found", bucket),
                    ));
                }
                Err(sdk_error("head-bucket", err))
            }
        }
    }

    async fn delete_bucket(&self, bucket: &str) -> CloudResult<()> {
        self.s3_client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| sdk_error("delete-bucket", e))?;
        Ok(())
    }

    async fn put_bucket_encryption(&self, bucket: &str) -> CloudResult<()> {
        use aws_sdk_s3::types::{
            ServerSideEncryption, ServerSideEncryptionByDefault, ServerSideEncryptionConfiguration,
            ServerSideEncryptionRule,
        };

        let default_encryption = ServerSideEncryptionByDefault::builder()
            .sse_algorithm(ServerSideEncryption::Aes256)
            .build()
            .map_err(|e| build_error("put-bucket-encryption", e))?;

        let rule = ServerSideEncryptionRule::builder()
            .apply_server_side_encryption_by_default(default_encryption)
            .build();

        let config = ServerSideEncryptionConfiguration::builder()
            .rules(rule)
            .build()
            .map_err(|e| build_error("put-bucket-encryption", e))?;

        self.s3_client
            .put_bucket_encryption()
            .bucket(bucket)
            .server_side_encryption_configuration(config)
            .send()
            .await
            .map_err(|e| sdk_error("put-bucket-encryption", e))?;
        Ok(())
    }

    async fn put_public_access_block(&self, bucket: &str) -> CloudResult<()> {
        use aws_sdk_s3::types::PublicAccessBlockConfiguration;

        let pab_config = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .ignore_public_acls(true)
            .block_public_policy(true)
            .restrict_public_buckets(true)
            .build();

        self.s3_client
            .put_public_access_block()
            .bucket(bucket)
            .public_access_block_configuration(pab_config)
            .send()
            .await
            .map_err(|e| sdk_error("put-public-access-block", e))?;
        Ok(())
    }

    async fn delete_public_access_block(&self, bucket: &str) -> CloudResult<()> {
        self.s3_client
            .delete_public_access_block()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| sdk_error("delete-public-access-block", e))?;
        Ok(())
    }

    async fn put_bucket_tagging(&self, bucket: &str, tags: &[Tag]) -> CloudResult<()> {
        use aws_sdk_s3::types::{Tag as S3Tag, Tagging};

        let tag_set = tags
            .iter()
            .map(|tag| S3Tag::builder().key(&tag.key).value(&tag.value).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| build_error("put-bucket-tagging", e))?;

        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| build_error("put-bucket-tagging", e))?;

        self.s3_client
            .put_bucket_tagging()
            .bucket(bucket)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| sdk_error("put-bucket-tagging", e))?;
        Ok(())
    }

    async fn get_bucket_policy(&self, bucket: &str) -> CloudResult<String> {
        let output = self
            .s3_client
            .get_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| sdk_error("get-bucket-policy", e))?;

        Ok(output.policy().unwrap_or_default().to_string())
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> CloudResult<()> {
        self.s3_client
            .put_bucket_policy()
            .bucket(bucket)
            .policy(policy)
            .send()
            .await
            .map_err(|e| sdk_error("put-bucket-policy", e))?;
        Ok(())
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> CloudResult<()> {
        self.s3_client
            .delete_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| sdk_error("delete-bucket-policy", e))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct AwsIdentityManager {
    iam_client: IamClient,
}

impl AwsIdentityManager {
    pub fn new(iam_client: IamClient) -> Self {
        Self { iam_client }
    }
}

#[async_trait]
impl IdentityManager for AwsIdentityManager {
    async fn create_user(&self, user: &NewUser) -> CloudResult<IamUser> {
        use aws_sdk_iam::types::Tag as IamTag;

        let tags = user
            .tags
            .iter()
            .map(|tag| IamTag::builder().key(&tag.key).value(&tag.value).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| build_error("create-user", e))?;

        let mut create_user_req = self
            .iam_client
            .create_user()
            .user_name(&user.user_name)
            .path(&user.path)
            .set_tags(Some(tags));

        if let Some(ref boundary_arn) = user.permissions_boundary {
            create_user_req = create_user_req.permissions_boundary(boundary_arn);
        }

        let output = create_user_req
            .send()
            .await
            .map_err(|e| sdk_error("create-user", e))?;

        let created = output
            .user()
            .ok_or_else(|| CloudError::other("create-user", "no user in response"))?;

        Ok(IamUser {
            user_name: created.user_name().to_string(),
            arn: created.arn().to_string(),
        })
    }

    async fn get_user(&self, user_name: &str) -> CloudResult<IamUser> {
        let output = self
            .iam_client
            .get_user()
            .user_name(user_name)
            .send()
            .await
            .map_err(|e| sdk_error("get-user", e))?;

        let user = output
            .user()
            .ok_or_else(|| CloudError::other("get-user", "no user in response"))?;

        Ok(IamUser {
            user_name: user.user_name().to_string(),
            arn: user.arn().to_string(),
        })
    }

    async fn delete_user(&self, user_name: &str) -> CloudResult<()> {
        self.iam_client
            .delete_user()
            .user_name(user_name)
            .send()
            .await
            .map_err(|e| sdk_error("delete-user", e))?;
        Ok(())
    }

    async fn create_access_key(&self, user_name: &str) -> CloudResult<AccessKey> {
        let output = self
            .iam_client
            .create_access_key()
            .user_name(user_name)
            .send()
            .await
            .map_err(|e| sdk_error("create-access-key", e))?;

        let access_key = output
            .access_key()
            .ok_or_else(|| CloudError::other("create-access-key", "no access key in response"))?;

        Ok(AccessKey {
            access_key_id: access_key.access_key_id().to_string(),
            secret_access_key: access_key.secret_access_key().to_string(),
        })
    }

    async fn list_access_keys(&self, user_name: &str) -> CloudResult<Vec<String>> {
        let output = self
            .iam_client
            .list_access_keys()
            .user_name(user_name)
            .send()
            .await
            .map_err(|e| sdk_error("list-access-keys", e))?;

        Ok(output
            .access_key_metadata()
            .iter()
            .filter_map(|key| key.access_key_id().map(str::to_string))
            .collect())
    }

    async fn delete_access_key(&self, user_name: &str, access_key_id: &str) -> CloudResult<()> {
        self.iam_client
            .delete_access_key()
            .user_name(user_name)
            .access_key_id(access_key_id)
            .send()
            .await
            .map_err(|e| sdk_error("delete-access-key", e))?;
        Ok(())
    }

    async fn attach_user_policy(&self, user_name: &str, policy_arn: &str) -> CloudResult<()> {
        self.iam_client
            .attach_user_policy()
            .user_name(user_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| sdk_error("attach-user-policy", e))?;
        Ok(())
    }

    async fn list_attached_user_policies(&self, user_name: &str) -> CloudResult<Vec<String>> {
        let output = self
            .iam_client
            .list_attached_user_policies()
            .user_name(user_name)
            .send()
            .await
            .map_err(|e| sdk_error("list-attached-user-policies", e))?;

        Ok(output
            .attached_policies()
            .iter()
            .filter_map(|policy| policy.policy_arn().map(str::to_string))
            .collect())
    }

    async fn detach_user_policy(&self, user_name: &str, policy_arn: &str) -> CloudResult<()> {
        self.iam_client
            .detach_user_policy()
            .user_name(user_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| sdk_error("detach-user-policy", e))?;
        Ok(())
    }
}
