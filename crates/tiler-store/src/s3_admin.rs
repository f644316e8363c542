//! Bucket management for S3-compatible services
//!
//! `object_store` only addresses objects inside an existing bucket, so bucket
//! lookups and creation go through the AWS SDK instead.

use crate::{Result, StoreError};
use aws_sdk_s3::config::{BehaviorVersion, Builder, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::create_bucket::CreateBucketError;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use tracing::debug;

/// Region that takes no location constraint on bucket creation
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone)]
pub(crate) struct S3Buckets {
    client: Client,
    region: String,
}

impl S3Buckets {
    /// Path-style client with static credentials, as MinIO expects
    pub(crate) fn new(endpoint: &str, region: &str, access_key: &str, secret_key: &str) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "tiler-config");
        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
            region: region.to_string(),
        }
    }

    pub(crate) async fn exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StoreError::Service {
                        operation: format!("head bucket '{bucket}'"),
                        message: DisplayErrorContext(&err).to_string(),
                    })
                }
            }
        }
    }

    pub(crate) async fn create(&self, bucket: &str) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                debug!("Created bucket '{}'", bucket);
                Ok(())
            }
            Err(err) => creation_result(bucket, err.into_service_error()),
        }
    }
}

/// A bucket that already exists counts as created
fn creation_result(bucket: &str, err: CreateBucketError) -> Result<()> {
    if err.is_bucket_already_owned_by_you() || err.is_bucket_already_exists() {
        debug!("Bucket '{}' already exists", bucket);
        return Ok(());
    }

    Err(StoreError::Service {
        operation: format!("create bucket '{bucket}'"),
        message: DisplayErrorContext(&err).to_string(),
    })
}
