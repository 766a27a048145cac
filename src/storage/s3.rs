//! # S3 Object Store
//!
//! Streamed multipart uploads into an S3 bucket through the AWS SDK.
//!
//! Uploads are created with the SHA-256 checksum algorithm. Every part is
//! sent with its `ChecksumSHA256`, which S3 verifies on receipt, and the
//! completion request lists each part's ETag and checksum again.
//!
//! Setting `storage.endpoint` points the client at an S3-compatible service
//! with path-style addressing.

use super::{sha256_base64, CompletedPart, ObjectStore, UploadResult, SOURCE_EXTENSION};
use crate::config::StorageConfig;
use crate::error::StorageError;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use bytes::Bytes;
use tracing::debug;

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(sdk_config: &SdkConfig, config: &StorageConfig) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }

    fn bucket(&self) -> Result<&str, StorageError> {
        if self.bucket.is_empty() {
            return Err(StorageError::NotConfigured("storage.bucket is empty".to_string()));
        }
        Ok(&self.bucket)
    }
}

fn service_error<E>(operation: &'static str, err: E) -> StorageError
where
    E: std::error::Error + 'static,
{
    StorageError::Service {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

fn missing_field(operation: &'static str, field: &str) -> StorageError {
    StorageError::Service {
        operation,
        message: format!("response has no {}", field),
    }
}

/// S3 part numbers are `i32` in the SDK and limited to 1..=10000.
fn s3_part_number(part_number: u32) -> Result<i32, StorageError> {
    match i32::try_from(part_number) {
        Ok(n) if (1..=10_000).contains(&n) => Ok(n),
        _ => Err(StorageError::Service {
            operation: "UploadPart",
            message: format!("part number {} is out of range", part_number),
        }),
    }
}

fn content_type(key: &str) -> &'static str {
    match key.rsplit_once('.') {
        Some((_, ext)) if ext == SOURCE_EXTENSION => "audio/wav",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket()?)
            .key(key)
            .content_type(content_type(key))
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send()
            .await
            .map_err(|e| service_error("CreateMultipartUpload", e))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| missing_field("CreateMultipartUpload", "upload id"))?;
        debug!(bucket = %self.bucket, key, upload_id, "S3 multipart upload created");
        Ok(upload_id.to_string())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        checksum_sha256: &str,
    ) -> Result<String, StorageError> {
        if sha256_base64(&body) != checksum_sha256 {
            return Err(StorageError::ChecksumMismatch { part_number });
        }

        let output = self
            .client
            .upload_part()
            .bucket(self.bucket()?)
            .key(key)
            .upload_id(upload_id)
            .part_number(s3_part_number(part_number)?)
            .checksum_sha256(checksum_sha256)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| service_error("UploadPart", e))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| missing_field("UploadPart", "ETag"))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<UploadResult, StorageError> {
        let parts = parts
            .iter()
            .map(|part| {
                Ok(S3CompletedPart::builder()
                    .part_number(s3_part_number(part.part_number)?)
                    .e_tag(&part.etag)
                    .checksum_sha256(&part.checksum_sha256)
                    .build())
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(self.bucket()?)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| service_error("CompleteMultipartUpload", e))?;

        let etag = output
            .e_tag()
            .ok_or_else(|| missing_field("CompleteMultipartUpload", "ETag"))?;

        Ok(UploadResult {
            key: key.to_string(),
            etag: etag.to_string(),
        })
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(self.bucket()?)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| service_error("AbortMultipartUpload", e))?;
        Ok(())
    }
}
