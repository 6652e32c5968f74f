//! S3-compatible blob store (MinIO locally, R2/S3 in production).
//!
//! Keys are opaque strings; the acceptor writes originals under
//! `users/{owner}/original/{job_id}/{filename}` and workers write artifacts
//! under `processed/{job_id}/{name}`. Puts are idempotent on key, which the
//! worker's crash-replay path relies on.

use s3::creds::Credentials;
use s3::{Bucket, BucketConfiguration, Region};

pub struct ObjectStorage {
    bucket: Box<Bucket>,
    bucket_name: String,
    region: Region,
    credentials: Credentials,
}

/// Object metadata from a HEAD request.
#[derive(Debug)]
pub struct ObjectInfo {
    pub size: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("storage configuration error: {0}")]
    Config(String),
}

impl ObjectStorage {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        // MinIO serves buckets path-style.
        let bucket = Bucket::new(bucket_name, region.clone(), credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            bucket_name: bucket_name.to_string(),
            region,
            credentials,
        })
    }

    /// Create the bucket if it does not exist yet. Idempotent.
    pub async fn ensure_bucket(&self) -> Result<(), StorageError> {
        if self.bucket.exists().await? {
            return Ok(());
        }
        Bucket::create_with_path_style(
            &self.bucket_name,
            self.region.clone(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        )
        .await?;
        Ok(())
    }

    /// Upload bytes under `key`, overwriting any existing object.
    pub async fn upload(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        Ok(())
    }

    /// Download the full object.
    pub async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| not_found_or(e, key))?;
        if response.status_code() == 404 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(response.to_vec())
    }

    /// Remove an object. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.bucket.delete_object(key).await?;
        Ok(())
    }

    /// Object metadata without the body.
    pub async fn stat(&self, key: &str) -> Result<ObjectInfo, StorageError> {
        let (head, _status) = self
            .bucket
            .head_object(key)
            .await
            .map_err(|e| not_found_or(e, key))?;
        Ok(ObjectInfo {
            size: head.content_length.unwrap_or(0).max(0) as u64,
            content_type: head.content_type,
        })
    }

    /// Storage connectivity probe for health checks.
    pub async fn health_check(&self) -> Result<(), StorageError> {
        self.bucket.exists().await?;
        Ok(())
    }
}

fn not_found_or(err: s3::error::S3Error, key: &str) -> StorageError {
    match err {
        s3::error::S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(key.to_string()),
        other => StorageError::S3(other),
    }
}
