//! # Filesystem Object Store
//!
//! Bundled storage backend that keeps objects under
//! `<root>/<bucket>/<key>` and mimics the S3 multipart contract:
//!
//! - parts are staged in `<root>/.multipart/<upload id>/<part number>`
//! - every part's SHA-256 checksum is verified before it is accepted
//! - completion concatenates the parts in order and returns an S3-style
//!   multipart ETag: `"<digest of part digests>-<part count>"`

use super::{sha256_base64, sha256_hex, CompletedPart, ObjectStore, UploadResult};
use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

const STAGING_DIR: &str = ".multipart";

pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    fn bucket_dir(&self) -> Result<PathBuf, StorageError> {
        if self.bucket.is_empty() {
            return Err(StorageError::NotConfigured("bucket name is empty".to_string()));
        }
        Ok(self.root.join(&self.bucket))
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StorageError::NotConfigured(format!("invalid object key '{}'", key)));
        }
        Ok(self.bucket_dir()?.join(relative))
    }

    fn staging_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        // Upload ids are UUIDs minted by this store
        if Uuid::parse_str(upload_id).is_err() {
            return Err(StorageError::UnknownUpload(upload_id.to_string()));
        }
        Ok(self.root.join(STAGING_DIR).join(upload_id))
    }

    async fn existing_staging_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        let dir = self.staging_dir(upload_id)?;
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::UnknownUpload(upload_id.to_string()));
        }
        Ok(dir)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError> {
        // Reject bad keys and missing bucket before anything is staged
        self.object_path(key)?;

        let upload_id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.staging_dir(&upload_id)?).await?;
        debug!(key = %key, upload_id = %upload_id, "Staging directory created");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        checksum_sha256: &str,
    ) -> Result<String, StorageError> {
        let dir = self.existing_staging_dir(upload_id).await?;

        if sha256_base64(&body) != checksum_sha256 {
            return Err(StorageError::ChecksumMismatch { part_number });
        }

        fs::write(dir.join(part_number.to_string()), &body).await?;
        Ok(format!("\"{}\"", sha256_hex(&body)))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<UploadResult, StorageError> {
        let dir = self.existing_staging_dir(upload_id).await?;
        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut out = fs::File::create(&target).await?;
        let mut combined = Sha256::new();

        for part in parts {
            let body = fs::read(dir.join(part.part_number.to_string())).await?;
            if format!("\"{}\"", sha256_hex(&body)) != part.etag {
                return Err(StorageError::ChecksumMismatch { part_number: part.part_number });
            }
            combined.update(Sha256::digest(&body));
            out.write_all(&body).await?;
        }
        out.flush().await?;

        fs::remove_dir_all(&dir).await?;

        Ok(UploadResult {
            key: key.to_string(),
            etag: format!("\"{:x}-{}\"", combined.finalize(), parts.len()),
        })
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<(), StorageError> {
        let dir = self.existing_staging_dir(upload_id).await?;
        fs::remove_dir_all(dir).await?;
        Ok(())
    }
}
