//! # Ingest Sessions
//!
//! Two pieces of session state live here:
//!
//! - **`IngestSession`**: owned by one WebSocket connection. It starts a
//!   pipeline on the first audio sub-stream and feeds every later sub-stream
//!   of that connection into the same pipeline.
//! - **`SessionRegistry`**: shared across connections. It tracks what each
//!   pipeline is doing (for the sessions API and health checks) and enforces
//!   the connection limit.
//!
//! ## Session Lifecycle:
//! 1. **Connected**: connection accepted, no pipeline yet
//! 2. **Receiving**: first sub-stream opened, encoder and upload sink exist
//! 3. **Uploading**: connection closed, upload being completed
//! 4. **Transcoding**: job submitted and being polled
//! 5. **Notifying**: downstream API being updated
//! 6. **Completed** / **Failed**: terminal, pruned after a retention period
//!
//! A connection that closes without ever opening a sub-stream never gets a
//! pipeline, so nothing is uploaded and no job is submitted.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Metadata carried by an audio sub-stream's open event.
///
/// Wire names are camelCase: `streamId`, `authToken`, `sampleRate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMeta {
    pub stream_id: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

impl StreamMeta {
    /// Check that the stream id can be used inside an object key.
    pub fn validate(&self) -> Result<(), String> {
        let id = self.stream_id.as_str();
        if id.is_empty() {
            return Err("streamId is required".to_string());
        }
        if id == "." || id == ".." || id.contains('/') || id.contains('\\') {
            return Err(format!("streamId '{}' is not a valid path segment", id));
        }
        if self.sample_rate == Some(0) {
            return Err("sampleRate must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn sample_rate_or(&self, default: u32) -> u32 {
        self.sample_rate.unwrap_or(default)
    }
}

/// Starts the pipeline for a session and returns the sender feeding it.
///
/// Implemented by the real pipeline and by test doubles.
pub trait PipelineLauncher: Send + Sync {
    fn launch(&self, connection_id: Uuid, meta: StreamMeta) -> mpsc::Sender<Bytes>;
}

/// What happened when a sub-stream was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstreamOpened {
    /// First sub-stream: the pipeline was started with this metadata
    Started,
    /// Later sub-stream: joined the existing pipeline, its metadata ignored
    Joined { stream_id: String },
}

/// Per-connection state: an optional, initialize-once pipeline handle.
pub struct IngestSession {
    connection_id: Uuid,
    meta: Option<StreamMeta>,
    audio: Option<mpsc::Sender<Bytes>>,
    substreams: u32,
    substream_open: bool,
    failed: bool,
}

impl IngestSession {
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            meta: None,
            audio: None,
            substreams: 0,
            substream_open: false,
            failed: false,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Metadata of the first sub-stream, once there is one.
    pub fn meta(&self) -> Option<&StreamMeta> {
        self.meta.as_ref()
    }

    pub fn substreams(&self) -> u32 {
        self.substreams
    }

    /// Open an audio sub-stream, starting the pipeline only the first time.
    pub fn open_substream(&mut self, meta: StreamMeta, launcher: &dyn PipelineLauncher) -> SubstreamOpened {
        self.substreams += 1;
        self.substream_open = true;

        if let Some(existing) = &self.meta {
            if existing.stream_id != meta.stream_id || existing.sample_rate != meta.sample_rate {
                debug!(
                    connection_id = %self.connection_id,
                    stream_id = %existing.stream_id,
                    ignored_stream_id = %meta.stream_id,
                    "Later sub-stream metadata ignored"
                );
            }
            return SubstreamOpened::Joined {
                stream_id: existing.stream_id.clone(),
            };
        }

        self.audio = Some(launcher.launch(self.connection_id, meta.clone()));
        self.meta = Some(meta);
        SubstreamOpened::Started
    }

    /// End the current sub-stream. The pipeline stays open for the next one.
    pub fn end_substream(&mut self) -> bool {
        std::mem::replace(&mut self.substream_open, false)
    }

    /// Sender for audio of the currently open sub-stream.
    pub fn audio_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        if !self.substream_open || self.failed {
            return None;
        }
        self.audio.clone()
    }

    /// The pipeline stopped accepting audio; drop the rest of this connection's data.
    pub fn mark_failed(&mut self) {
        self.failed = true;
        self.audio = None;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Connection closed: dropping the sender is the end-of-data signal.
    ///
    /// Returns true if a pipeline was running for this connection.
    pub fn close(&mut self) -> bool {
        self.substream_open = false;
        self.audio.take();
        self.meta.is_some()
    }
}

/// Stage of a session pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", content = "reason", rename_all = "snake_case")]
pub enum PipelineStage {
    Receiving,
    Uploading,
    Transcoding,
    Notifying,
    Completed,
    Failed(String),
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Receiving => "receiving",
            PipelineStage::Uploading => "uploading",
            PipelineStage::Transcoding => "transcoding",
            PipelineStage::Notifying => "notifying",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Completed | PipelineStage::Failed(_))
    }
}

/// What the registry knows about one session pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub stream_id: String,
    pub connection_id: Uuid,
    pub sample_rate: u32,
    #[serde(flatten)]
    pub stage: PipelineStage,
    pub bytes_received: u64,
    pub source_key: Option<String>,
    pub job_id: Option<String>,
    pub output_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(stream_id: String, connection_id: Uuid, sample_rate: u32) -> Self {
        let now = Utc::now();
        Self {
            stream_id,
            connection_id,
            sample_rate,
            stage: PipelineStage::Receiving,
            bytes_received: 0,
            source_key: None,
            job_id: None,
            output_key: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Counts reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub open_connections: usize,
    pub max_connections: usize,
    pub tracked_sessions: usize,
    pub stage_counts: HashMap<String, usize>,
    pub completed_total: u64,
    pub failed_total: u64,
}

/// Shared registry of session pipelines and open connections.
///
/// Records are keyed by session id (the connection id that launched the
/// pipeline). Two connections reusing one stream id get separate records;
/// lookups by stream id return the newest of them.
///
/// ## Thread Safety:
/// Records sit behind an `RwLock` (many readers from the HTTP API, one writer
/// per pipeline update); counters are atomics.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
    open_connections: AtomicUsize,
    max_connections: usize,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
}

impl SessionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            open_connections: AtomicUsize::new(0),
            max_connections,
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }

    /// Reserve a connection slot; false once the limit is reached.
    pub fn try_open_connection(&self) -> bool {
        self.open_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < self.max_connections).then_some(open + 1)
            })
            .is_ok()
    }

    pub fn close_connection(&self) {
        let _ = self
            .open_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| open.checked_sub(1));
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    pub fn register(&self, record: SessionRecord) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let running = sessions
            .values()
            .find(|previous| previous.stream_id == record.stream_id && !previous.stage.is_terminal());
        if let Some(previous) = running {
            warn!(
                stream_id = %record.stream_id,
                previous_connection = %previous.connection_id,
                connection_id = %record.connection_id,
                "Stream id reused while its previous session is still running"
            );
        }
        sessions.insert(record.connection_id, record);
    }

    pub fn set_stage(&self, session_id: Uuid, stage: PipelineStage) {
        match &stage {
            PipelineStage::Completed => {
                self.completed_total.fetch_add(1, Ordering::Relaxed);
            }
            PipelineStage::Failed(_) => {
                self.failed_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        self.update(session_id, |record| {
            if stage.is_terminal() {
                record.finished_at = Some(Utc::now());
            }
            record.stage = stage;
        });
    }

    pub fn add_bytes(&self, session_id: Uuid, bytes: u64) {
        self.update(session_id, |record| record.bytes_received += bytes);
    }

    pub fn set_source_key(&self, session_id: Uuid, key: &str) {
        self.update(session_id, |record| record.source_key = Some(key.to_string()));
    }

    pub fn set_job(&self, session_id: Uuid, job_id: &str, output_key: &str) {
        self.update(session_id, |record| {
            record.job_id = Some(job_id.to_string());
            record.output_key = Some(output_key.to_string());
        });
    }

    pub fn session(&self, session_id: Uuid) -> Option<SessionRecord> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(&session_id).cloned()
    }

    /// Newest session recorded for a stream id.
    pub fn get(&self, stream_id: &str) -> Option<SessionRecord> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .values()
            .filter(|record| record.stream_id == stream_id)
            .max_by_key(|record| record.created_at)
            .cloned()
    }

    /// All records, newest first.
    pub fn list(&self) -> Vec<SessionRecord> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<_> = sessions.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Drop terminal records that finished more than `retention` ago.
    pub fn prune_finished(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, record| match record.finished_at {
            Some(finished) => finished > cutoff,
            None => true,
        });
        before - sessions.len()
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);

        let mut stage_counts = HashMap::new();
        for record in sessions.values() {
            *stage_counts.entry(record.stage.as_str().to_string()).or_insert(0) += 1;
        }

        RegistrySummary {
            open_connections: self.open_connections(),
            max_connections: self.max_connections,
            tracked_sessions: sessions.len(),
            stage_counts,
            completed_total: self.completed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
        }
    }

    fn update(&self, session_id: Uuid, apply: impl FnOnce(&mut SessionRecord)) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = sessions.get_mut(&session_id) {
            apply(record);
            record.updated_at = Utc::now();
        }
    }
}
