//! # Upload Relay
//!
//! A write sink that forwards bytes to the storage collaborator as a streamed
//! multipart upload, so a recording is uploaded while it is being produced.
//!
//! ## Memory and parallelism bounds:
//! - Bytes accumulate until `part_size` is reached, then that part is sent
//! - At most `queue_size` parts are in flight; a write that would start
//!   another one waits for a slot first. That wait is what pushes back on
//!   the session's ingest when storage is slower than the client.
//!
//! ## Failure policy:
//! Any failed part, failed completion or panicked part task fails the whole
//! upload. The multipart upload is aborted so no partial object is left
//! behind as if it had succeeded.

use super::{sha256_base64, CompletedPart, ObjectStore, UploadResult};
use crate::config::StorageConfig;
use crate::error::StorageError;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Part size and concurrency of one multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPolicy {
    pub part_size: usize,
    pub queue_size: usize,
}

impl UploadPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            part_size: config.part_size_bytes,
            queue_size: config.queue_size,
        }
    }
}

type PartTask = Result<CompletedPart, StorageError>;

/// Sink side of one streamed multipart upload.
pub struct UploadSink {
    store: Arc<dyn ObjectStore>,
    key: String,
    upload_id: String,
    policy: UploadPolicy,
    buffer: BytesMut,
    next_part: u32,
    in_flight: JoinSet<PartTask>,
    completed: Vec<CompletedPart>,
    bytes_written: u64,
}

impl UploadSink {
    /// Start a multipart upload for `key`.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        key: String,
        policy: UploadPolicy,
    ) -> Result<Self, StorageError> {
        let upload_id = store.create_multipart_upload(&key).await?;
        debug!(key = %key, upload_id = %upload_id, "Multipart upload started");

        Ok(Self {
            store,
            key,
            upload_id,
            policy,
            buffer: BytesMut::with_capacity(policy.part_size),
            next_part: 1,
            in_flight: JoinSet::new(),
            completed: Vec::new(),
            bytes_written: 0,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append bytes; full parts are dispatched as soon as they exist.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(data);

        while self.buffer.len() >= self.policy.part_size {
            let part = self.buffer.split_to(self.policy.part_size).freeze();
            self.dispatch(part).await?;
        }

        Ok(())
    }

    /// Flush the remainder, wait for every part and complete the upload.
    ///
    /// On failure the multipart upload is aborted before the error is returned.
    pub async fn close(mut self) -> Result<UploadResult, StorageError> {
        match self.finish().await {
            Ok(result) => {
                info!(
                    key = %result.key,
                    etag = %result.etag,
                    parts = self.completed.len(),
                    bytes = self.bytes_written,
                    "Upload completed"
                );
                Ok(result)
            }
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }

    /// Cancel outstanding parts and abort the multipart upload.
    pub async fn abort(mut self) {
        self.in_flight.shutdown().await;

        match self.store.abort_multipart_upload(&self.key, &self.upload_id).await {
            Ok(()) => warn!(key = %self.key, upload_id = %self.upload_id, "Multipart upload aborted"),
            Err(err) => warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                error = %err,
                "Failed to abort multipart upload"
            ),
        }
    }

    async fn finish(&mut self) -> Result<UploadResult, StorageError> {
        // The store needs at least one part, even for an empty object
        if !self.buffer.is_empty() || self.next_part == 1 {
            let rest = self.buffer.split().freeze();
            self.dispatch(rest).await?;
        }

        while !self.in_flight.is_empty() {
            self.reap_one().await?;
        }

        self.completed.sort_by_key(|part| part.part_number);
        self.store
            .complete_multipart_upload(&self.key, &self.upload_id, &self.completed)
            .await
    }

    async fn dispatch(&mut self, body: Bytes) -> Result<(), StorageError> {
        while self.in_flight.len() >= self.policy.queue_size {
            self.reap_one().await?;
        }

        let part_number = self.next_part;
        self.next_part += 1;

        let checksum = sha256_base64(&body);
        let store = self.store.clone();
        let key = self.key.clone();
        let upload_id = self.upload_id.clone();

        debug!(key = %key, part_number, size = body.len(), "Uploading part");

        self.in_flight.spawn(async move {
            let etag = store
                .upload_part(&key, &upload_id, part_number, body, &checksum)
                .await?;
            Ok(CompletedPart {
                part_number,
                etag,
                checksum_sha256: checksum,
            })
        });

        Ok(())
    }

    async fn reap_one(&mut self) -> Result<(), StorageError> {
        match self.in_flight.join_next().await {
            Some(Ok(Ok(part))) => {
                self.completed.push(part);
                Ok(())
            }
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(StorageError::Task(join_err.to_string())),
            None => Ok(()),
        }
    }
}
