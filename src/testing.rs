//! In-memory collaborators for tests.

use crate::error::{NotifyError, StorageError, TranscodeError};
use crate::notify::{Notification, ResultNotifier};
use crate::storage::{sha256_base64, sha256_hex, CompletedPart, ObjectStore, UploadResult};
use crate::transcode::{JobRequest, JobStatus, TranscodeService};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Object store keeping uploads and objects in memory.
#[derive(Default)]
pub struct MemoryStore {
    uploads: Mutex<HashMap<String, BTreeMap<u32, Bytes>>>,
    objects: Mutex<HashMap<String, Bytes>>,
    next_upload: AtomicU32,
    parts_uploaded: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    aborted: AtomicUsize,
    part_delay: Option<Duration>,
    fail_part: Option<u32>,
}

impl MemoryStore {
    pub fn with_part_delay(mut self, delay: Duration) -> Self {
        self.part_delay = Some(delay);
        self
    }

    pub fn failing_part(mut self, part_number: u32) -> Self {
        self.fail_part = Some(part_number);
        self
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn parts_uploaded(&self) -> usize {
        self.parts_uploaded.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn aborted_uploads(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_multipart_upload(&self, _key: &str) -> Result<String, StorageError> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst) + 1);
        self.uploads.lock().unwrap().insert(id.clone(), BTreeMap::new());
        Ok(id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        checksum_sha256: &str,
    ) -> Result<String, StorageError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.part_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_part == Some(part_number) {
            return Err(StorageError::Io(io::Error::new(io::ErrorKind::Other, "injected part failure")));
        }
        if sha256_base64(&body) != checksum_sha256 {
            return Err(StorageError::ChecksumMismatch { part_number });
        }

        let etag = format!("\"{}\"", sha256_hex(&body));
        let mut uploads = self.uploads.lock().unwrap();
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::UnknownUpload(upload_id.to_string()))?;
        parts.insert(part_number, body);
        self.parts_uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<UploadResult, StorageError> {
        let stored = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| StorageError::UnknownUpload(upload_id.to_string()))?;

        let mut object = BytesMut::new();
        for part in parts {
            let body = stored
                .get(&part.part_number)
                .ok_or_else(|| StorageError::UnknownUpload(format!("{}#{}", upload_id, part.part_number)))?;
            object.extend_from_slice(body);
        }
        let object = object.freeze();

        let digest = sha256_hex(&object);
        let etag = format!("\"{}\"", &digest[..32]);
        self.objects.lock().unwrap().insert(key.to_string(), object);

        Ok(UploadResult { key: key.to_string(), etag })
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.uploads.lock().unwrap().remove(upload_id);
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Job service answering status queries from a script.
///
/// Once the script runs out every query reports `Complete`.
#[derive(Default)]
pub struct ScriptedTranscoder {
    script: Mutex<VecDeque<Result<JobStatus, TranscodeError>>>,
    requests: Mutex<Vec<JobRequest>>,
    fail_submission: bool,
    submissions: AtomicU32,
    polls: AtomicU32,
}

impl ScriptedTranscoder {
    pub fn with_script(script: Vec<Result<JobStatus, TranscodeError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn completing() -> Self {
        Self::default()
    }

    pub fn failing_submission() -> Self {
        Self {
            fail_submission: true,
            ..Default::default()
        }
    }

    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<JobRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TranscodeService for ScriptedTranscoder {
    async fn create_job(&self, request: &JobRequest) -> Result<String, TranscodeError> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());

        if self.fail_submission {
            return Err(TranscodeError::Status {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        Ok(format!("job-{}", n))
    }

    async fn job_status(&self, _job_id: &str) -> Result<JobStatus, TranscodeError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(JobStatus::Complete))
    }
}

/// Notifier recording every call.
#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultNotifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.notifications.lock().unwrap().push(notification.clone());
        if self.fail {
            return Err(NotifyError::Status {
                status: 401,
                body: "unauthorized".to_string(),
            });
        }
        Ok(())
    }
}
