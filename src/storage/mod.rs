//! # Object Storage
//!
//! The storage collaborator, seen through the operations a streamed multipart
//! upload needs, plus the object key conventions shared by the pipeline.
//!
//! ## Key Components:
//! - **ObjectStore**: trait implemented by storage backends (and test fakes)
//! - **UploadSink**: write sink that relays bytes as multipart parts (`relay.rs`)
//! - **S3ObjectStore**: S3 backend on the AWS SDK (`s3.rs`)
//! - **FsObjectStore**: filesystem backend for local development (`fs.rs`)
//!
//! ## Object Keys:
//! - Source recording: `streams/<streamId>/audio.wav`
//! - Transcoded artifact: `streams/<streamId>/<hash>.mp3`

pub mod fs;
pub mod relay;
pub mod s3;

pub use fs::FsObjectStore;
pub use relay::{UploadPolicy, UploadSink};
pub use s3::S3ObjectStore;

use crate::error::StorageError;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Extension of the uploaded source container.
pub const SOURCE_EXTENSION: &str = "wav";

/// Extension of the transcoded artifact.
pub const OUTPUT_EXTENSION: &str = "mp3";

/// Prefix under which everything for one stream is stored.
pub fn stream_prefix(stream_id: &str) -> String {
    format!("streams/{}/", stream_id)
}

/// Key of the uploaded source recording.
pub fn source_key(stream_id: &str) -> String {
    format!("{}audio.{}", stream_prefix(stream_id), SOURCE_EXTENSION)
}

/// File name of the transcoded artifact, relative to the stream prefix.
pub fn output_name(content_id: &str) -> String {
    format!("{}.{}", content_id, OUTPUT_EXTENSION)
}

/// Full key of the transcoded artifact.
pub fn output_key(stream_id: &str, content_id: &str) -> String {
    format!("{}{}", stream_prefix(stream_id), output_name(content_id))
}

/// Hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Base64 SHA-256 digest, the per-part checksum in S3's `ChecksumSHA256` encoding.
pub fn sha256_base64(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(Sha256::digest(data))
}

/// One uploaded part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    /// Base64 SHA-256 of the part body
    pub checksum_sha256: String,
}

/// Outcome of a finished upload, as reported by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub key: String,
    /// Entity tag as returned by the store, usually wrapped in double quotes
    pub etag: String,
}

impl UploadResult {
    /// The content identifier: the ETag without its surrounding quotes.
    pub fn content_id(&self) -> &str {
        self.etag.trim_matches('"')
    }
}

/// Multipart upload operations of the storage collaborator.
///
/// ## Contract:
/// - `upload_part` verifies `checksum_sha256` (base64 SHA-256) against the
///   body and rejects mismatches with `StorageError::ChecksumMismatch`
/// - `complete_multipart_upload` receives parts sorted by part number
/// - after `abort_multipart_upload` the upload id is no longer valid
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        checksum_sha256: &str,
    ) -> Result<String, StorageError>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<UploadResult, StorageError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;
}
