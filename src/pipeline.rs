//! # Session Pipeline
//!
//! Drives one session from its first audio byte to the downstream update:
//!
//! ```text
//! audio channel -> WavEncoder -> UploadSink -> (storage)
//!                                   |
//!                          TranscodeOrchestrator -> (job service, polled)
//!                                   |
//!                              ResultNotifier -> (downstream API)
//! ```
//!
//! ## Key Rust Concepts:
//! - **Injected collaborators**: the store, job service and notifier are trait
//!   objects in `PipelineDeps`, so tests swap in in-memory fakes
//! - **Bounded channel**: the WebSocket actor feeds audio through an `mpsc`
//!   channel; a slow upload fills it and the actor waits
//! - **Detached task**: each pipeline runs in its own `tokio::spawn`ed task;
//!   closing the connection only ends the audio stream, the rest of the
//!   pipeline keeps going
//!
//! Every failure ends only the session that produced it. It is logged with
//! the stream id and recorded in the session registry.

use crate::audio::session::{PipelineLauncher, PipelineStage, SessionRecord, SessionRegistry, StreamMeta};
use crate::audio::wav::{WavEncoder, WavSpec};
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::notify::{Notification, ResultNotifier};
use crate::storage::{self, ObjectStore, UploadPolicy, UploadResult, UploadSink};
use crate::transcode::waiter::TranscodeOrchestrator;
use crate::transcode::TranscodeService;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything a session pipeline needs, shared by all sessions.
pub struct PipelineDeps {
    pub store: Arc<dyn ObjectStore>,
    pub orchestrator: TranscodeOrchestrator,
    pub notifier: Arc<dyn ResultNotifier>,
    pub registry: Arc<SessionRegistry>,
    pub upload_policy: UploadPolicy,
    pub default_sample_rate: u32,
    pub channel_capacity: usize,
}

impl PipelineDeps {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn ObjectStore>,
        transcoder: Arc<dyn TranscodeService>,
        notifier: Arc<dyn ResultNotifier>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            store,
            orchestrator: TranscodeOrchestrator::new(transcoder, config.transcoder.clone()),
            notifier,
            registry,
            upload_policy: UploadPolicy::from_config(&config.storage),
            default_sample_rate: config.ingest.default_sample_rate,
            channel_capacity: config.ingest.channel_capacity,
        }
    }
}

/// How a successful pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The downstream API now points at the artifact
    Notified { output_key: String },
    /// Transcoded, but the session had no token to notify with
    NotificationSkipped { output_key: String },
}

/// Starts session pipelines as background tasks.
#[derive(Clone)]
pub struct Pipeline {
    deps: Arc<PipelineDeps>,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps: Arc::new(deps) }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.deps.registry
    }

    /// Register the session and spawn its pipeline.
    ///
    /// Dropping every clone of the returned sender is the end-of-audio signal.
    pub fn spawn(
        &self,
        connection_id: Uuid,
        meta: StreamMeta,
    ) -> (mpsc::Sender<Bytes>, JoinHandle<Result<PipelineOutcome, PipelineError>>) {
        let (tx, rx) = mpsc::channel(self.deps.channel_capacity.max(1));

        let sample_rate = meta.sample_rate_or(self.deps.default_sample_rate);
        self.deps
            .registry
            .register(SessionRecord::new(meta.stream_id.clone(), connection_id, sample_rate));

        let deps = self.deps.clone();
        let handle = tokio::spawn(async move {
            run_session(&deps, connection_id, meta, ReceiverStream::new(rx)).await
        });

        (tx, handle)
    }
}

impl PipelineLauncher for Pipeline {
    fn launch(&self, connection_id: Uuid, meta: StreamMeta) -> mpsc::Sender<Bytes> {
        self.spawn(connection_id, meta).0
    }
}

/// Run one session to a terminal state and record that state.
pub async fn run_session<S>(
    deps: &PipelineDeps,
    connection_id: Uuid,
    meta: StreamMeta,
    audio: S,
) -> Result<PipelineOutcome, PipelineError>
where
    S: Stream<Item = Bytes> + Unpin,
{
    let stream_id = meta.stream_id.clone();
    let result = drive(deps, connection_id, &meta, audio).await;

    match &result {
        Ok(outcome) => {
            info!(
                stream_id = %stream_id,
                connection_id = %connection_id,
                outcome = ?outcome,
                "Session pipeline completed"
            );
            deps.registry.set_stage(connection_id, PipelineStage::Completed);
        }
        Err(err) => {
            error!(
                stream_id = %stream_id,
                connection_id = %connection_id,
                stage = err.stage(),
                error = %err,
                "Session pipeline failed"
            );
            deps.registry.set_stage(connection_id, PipelineStage::Failed(err.to_string()));
        }
    }

    result
}

async fn drive<S>(
    deps: &PipelineDeps,
    session_id: Uuid,
    meta: &StreamMeta,
    audio: S,
) -> Result<PipelineOutcome, PipelineError>
where
    S: Stream<Item = Bytes> + Unpin,
{
    let stream_id = meta.stream_id.as_str();
    let sample_rate = meta.sample_rate_or(deps.default_sample_rate);

    info!(stream_id = %stream_id, sample_rate, "Session pipeline started");

    let upload = encode_and_upload(deps, session_id, stream_id, sample_rate, audio).await?;
    deps.registry.set_source_key(session_id, &upload.key);

    deps.registry.set_stage(session_id, PipelineStage::Transcoding);
    let job = deps.orchestrator.submit(stream_id, &upload).await?;
    deps.registry.set_job(session_id, &job.job_id, &job.output_key);
    info!(stream_id = %stream_id, job_id = %job.job_id, "Transcode job submitted");

    deps.orchestrator.wait(&job).await?;

    let auth_token = match meta.auth_token.as_deref() {
        Some(token) if !token.is_empty() => token,
        _ => {
            warn!(
                stream_id = %stream_id,
                key = %job.output_key,
                "No auth token for session, downstream API not notified"
            );
            return Ok(PipelineOutcome::NotificationSkipped { output_key: job.output_key });
        }
    };

    deps.registry.set_stage(session_id, PipelineStage::Notifying);
    let notification = Notification {
        stream_id: stream_id.to_string(),
        audio_key: job.output_key.clone(),
        auth_token: auth_token.to_string(),
    };
    deps.notifier.notify(&notification).await?;

    Ok(PipelineOutcome::Notified { output_key: job.output_key })
}

/// Encode the audio stream into the upload sink until the stream ends.
///
/// Any encoder or storage failure aborts the multipart upload.
async fn encode_and_upload<S>(
    deps: &PipelineDeps,
    session_id: Uuid,
    stream_id: &str,
    sample_rate: u32,
    mut audio: S,
) -> Result<UploadResult, PipelineError>
where
    S: Stream<Item = Bytes> + Unpin,
{
    let mut encoder = WavEncoder::new(WavSpec::mono_16bit(sample_rate))?;
    let mut sink = UploadSink::open(deps.store.clone(), storage::source_key(stream_id), deps.upload_policy).await?;

    while let Some(chunk) = audio.next().await {
        deps.registry.add_bytes(session_id, chunk.len() as u64);

        let encoded = match encoder.push(&chunk) {
            Ok(encoded) => encoded,
            Err(err) => {
                sink.abort().await;
                return Err(err.into());
            }
        };

        if let Err(err) = sink.write(&encoded).await {
            sink.abort().await;
            return Err(err.into());
        }
    }

    deps.registry.set_stage(session_id, PipelineStage::Uploading);
    info!(
        stream_id = %stream_id,
        key = %sink.key(),
        audio_bytes = encoder.data_bytes(),
        "Audio stream ended, completing upload"
    );

    match encoder.finish() {
        Ok(Some(header)) => {
            if let Err(err) = sink.write(&header).await {
                sink.abort().await;
                return Err(err.into());
            }
        }
        Ok(None) => {}
        Err(err) => {
            sink.abort().await;
            return Err(err.into());
        }
    }

    Ok(sink.close().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::HEADER_LEN;
    use crate::storage::sha256_hex;
    use crate::testing::{MemoryStore, RecordingNotifier, ScriptedTranscoder};
    use crate::transcode::JobStatus;
    use byteorder::{ByteOrder, LittleEndian};

    struct Fixture {
        store: Arc<MemoryStore>,
        transcoder: Arc<ScriptedTranscoder>,
        notifier: Arc<RecordingNotifier>,
        pipeline: Pipeline,
    }

    fn fixture(transcoder: ScriptedTranscoder, store: MemoryStore, notifier: RecordingNotifier) -> Fixture {
        let mut config = AppConfig::default();
        config.storage.part_size_bytes = 16;
        config.storage.queue_size = 2;

        let store = Arc::new(store);
        let transcoder = Arc::new(transcoder);
        let notifier = Arc::new(notifier);
        let registry = Arc::new(SessionRegistry::new(10));
        let deps = PipelineDeps::new(&config, store.clone(), transcoder.clone(), notifier.clone(), registry);

        Fixture { store, transcoder, notifier, pipeline: Pipeline::new(deps) }
    }

    fn meta(stream_id: &str, sample_rate: Option<u32>) -> StreamMeta {
        StreamMeta {
            stream_id: stream_id.to_string(),
            auth_token: Some(format!("token-{}", stream_id)),
            sample_rate,
        }
    }

    async fn send_all(tx: mpsc::Sender<Bytes>, chunks: &[&'static [u8]]) {
        for chunk in chunks {
            tx.send(Bytes::from_static(chunk)).await.unwrap();
        }
    }

    fn expected_output_key(stream_id: &str, object: &[u8]) -> String {
        format!("streams/{}/{}.mp3", stream_id, &sha256_hex(object)[..32])
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_session_notifies_once() {
        let f = fixture(
            ScriptedTranscoder::with_script(vec![
                Ok(JobStatus::InProgress),
                Ok(JobStatus::InProgress),
                Ok(JobStatus::Complete),
            ]),
            MemoryStore::default(),
            RecordingNotifier::default(),
        );

        let (tx, handle) = f.pipeline.spawn(Uuid::new_v4(), meta("abc", Some(16000)));
        send_all(
            tx,
            &[
                &b"\x01\x00\x02\x00"[..],
                &b"\x03\x00\x04\x00\x05\x00\x06\x00\x07\x00\x08\x00\x09\x00\x0a\x00"[..],
            ],
        )
        .await;
        let outcome = handle.await.unwrap().unwrap();

        let object = f.store.object("streams/abc/audio.wav").unwrap();
        let key = expected_output_key("abc", &object);
        assert_eq!(outcome, PipelineOutcome::Notified { output_key: key.clone() });
        assert_eq!(f.transcoder.polls(), 3);
        assert_eq!(f.transcoder.submissions(), 1);

        let notifications = f.notifier.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].stream_id, "abc");
        assert_eq!(notifications[0].audio_key, key);
        assert_eq!(notifications[0].auth_token, "token-abc");

        let record = f.pipeline.registry().get("abc").unwrap();
        assert_eq!(record.stage, PipelineStage::Completed);
        assert_eq!(record.bytes_received, 20);
        assert_eq!(record.job_id.as_deref(), Some("job-1"));
        assert_eq!(record.output_key.as_deref(), Some(key.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_precedes_samples() {
        let f = fixture(ScriptedTranscoder::completing(), MemoryStore::default(), RecordingNotifier::default());

        let (tx, handle) = f.pipeline.spawn(Uuid::new_v4(), meta("abc", Some(22050)));
        send_all(tx, &[&b"\x10\x00"[..], &b"\x20\x00"[..]]).await;
        handle.await.unwrap().unwrap();

        let object = f.store.object("streams/abc/audio.wav").unwrap();
        assert_eq!(object.len(), HEADER_LEN + 4);
        assert_eq!(&object[0..4], b"RIFF");
        assert_eq!(LittleEndian::read_u16(&object[22..24]), 1);
        assert_eq!(LittleEndian::read_u32(&object[24..28]), 22050);
        assert_eq!(LittleEndian::read_u16(&object[34..36]), 16);
        assert_eq!(&object[HEADER_LEN..], b"\x10\x00\x20\x00");
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_sample_rate() {
        let f = fixture(ScriptedTranscoder::completing(), MemoryStore::default(), RecordingNotifier::default());

        let (tx, handle) = f.pipeline.spawn(Uuid::new_v4(), meta("abc", None));
        drop(tx);
        handle.await.unwrap().unwrap();

        let object = f.store.object("streams/abc/audio.wav").unwrap();
        assert_eq!(object.len(), HEADER_LEN);
        assert_eq!(LittleEndian::read_u32(&object[24..28]), 48000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_error_skips_notification() {
        let f = fixture(
            ScriptedTranscoder::with_script(vec![
                Ok(JobStatus::InProgress),
                Ok(JobStatus::Error("4000 bad input".to_string())),
            ]),
            MemoryStore::default(),
            RecordingNotifier::default(),
        );

        let (tx, handle) = f.pipeline.spawn(Uuid::new_v4(), meta("abc", None));
        send_all(tx, &[&b"\x00\x00"[..]]).await;
        let err = handle.await.unwrap().unwrap_err();

        assert_eq!(err.stage(), "transcode");
        assert!(f.notifier.notifications().is_empty());
        let summary = f.pipeline.registry().summary();
        assert_eq!(summary.failed_total, 1);
        assert_eq!(summary.completed_total, 0);
        assert!(matches!(
            f.pipeline.registry().get("abc").unwrap().stage,
            PipelineStage::Failed(ref reason) if reason.contains("4000 bad input")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_failure_skips_submission() {
        let f = fixture(
            ScriptedTranscoder::completing(),
            MemoryStore::default().failing_part(1),
            RecordingNotifier::default(),
        );

        let (tx, handle) = f.pipeline.spawn(Uuid::new_v4(), meta("abc", None));
        send_all(tx, &[&[0u8; 64][..]]).await;
        let err = handle.await.unwrap().unwrap_err();

        assert_eq!(err.stage(), "upload");
        assert_eq!(f.transcoder.submissions(), 0);
        assert!(f.store.object("streams/abc/audio.wav").is_none());
        assert_eq!(f.store.aborted_uploads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_failure_is_not_retried() {
        let f = fixture(
            ScriptedTranscoder::failing_submission(),
            MemoryStore::default(),
            RecordingNotifier::default(),
        );

        let (tx, handle) = f.pipeline.spawn(Uuid::new_v4(), meta("abc", None));
        drop(tx);
        let err = handle.await.unwrap().unwrap_err();

        assert_eq!(err.stage(), "submission");
        assert_eq!(f.transcoder.submissions(), 1);
        assert_eq!(f.transcoder.polls(), 0);
        assert!(f.notifier.notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_failure_is_not_retried() {
        let f = fixture(ScriptedTranscoder::completing(), MemoryStore::default(), RecordingNotifier::failing());

        let (tx, handle) = f.pipeline.spawn(Uuid::new_v4(), meta("abc", None));
        drop(tx);
        let err = handle.await.unwrap().unwrap_err();

        assert_eq!(err.stage(), "notify");
        assert_eq!(f.notifier.notifications().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_skips_notification() {
        let f = fixture(ScriptedTranscoder::completing(), MemoryStore::default(), RecordingNotifier::default());

        let mut no_token = meta("abc", None);
        no_token.auth_token = None;
        let (tx, handle) = f.pipeline.spawn(Uuid::new_v4(), no_token);
        drop(tx);

        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, PipelineOutcome::NotificationSkipped { .. }));
        assert!(f.notifier.notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sessions_are_independent() {
        let f = fixture(
            ScriptedTranscoder::with_script(vec![Ok(JobStatus::InProgress), Ok(JobStatus::InProgress)]),
            MemoryStore::default(),
            RecordingNotifier::default(),
        );

        let (tx_a, handle_a) = f.pipeline.spawn(Uuid::new_v4(), meta("a", Some(16000)));
        let (tx_b, handle_b) = f.pipeline.spawn(Uuid::new_v4(), meta("b", Some(44100)));

        // Interleave the two sessions' chunks
        tx_a.send(Bytes::from_static(b"\x01\x01")).await.unwrap();
        tx_b.send(Bytes::from_static(b"\x02\x02")).await.unwrap();
        tx_a.send(Bytes::from_static(b"\x03\x03")).await.unwrap();
        tx_b.send(Bytes::from_static(b"\x04\x04")).await.unwrap();
        drop(tx_a);
        drop(tx_b);

        handle_a.await.unwrap().unwrap();
        handle_b.await.unwrap().unwrap();

        let object_a = f.store.object("streams/a/audio.wav").unwrap();
        let object_b = f.store.object("streams/b/audio.wav").unwrap();
        assert_eq!(&object_a[HEADER_LEN..], b"\x01\x01\x03\x03");
        assert_eq!(&object_b[HEADER_LEN..], b"\x02\x02\x04\x04");
        assert_eq!(LittleEndian::read_u32(&object_a[24..28]), 16000);
        assert_eq!(LittleEndian::read_u32(&object_b[24..28]), 44100);

        let mut notifications = f.notifier.notifications();
        notifications.sort_by(|x, y| x.stream_id.cmp(&y.stream_id));
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].audio_key, expected_output_key("a", &object_a));
        assert_eq!(notifications[0].auth_token, "token-a");
        assert_eq!(notifications[1].audio_key, expected_output_key("b", &object_b));
        assert_eq!(notifications[1].auth_token, "token-b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_stream_id_records_each_session() {
        let f = fixture(ScriptedTranscoder::completing(), MemoryStore::default(), RecordingNotifier::default());

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let (tx_a, handle_a) = f.pipeline.spawn(first, meta("abc", None));
        let (tx_b, handle_b) = f.pipeline.spawn(second, meta("abc", None));

        tx_a.send(Bytes::from_static(b"\x01\x00")).await.unwrap();
        tx_b.send(Bytes::from_static(b"\x02\x00\x03\x00\x04\x00")).await.unwrap();
        drop(tx_a);
        drop(tx_b);
        handle_a.await.unwrap().unwrap();
        handle_b.await.unwrap().unwrap();

        let registry = f.pipeline.registry();
        assert_eq!(registry.session(first).unwrap().bytes_received, 2);
        assert_eq!(registry.session(second).unwrap().bytes_received, 6);
        assert_eq!(registry.summary().completed_total, 2);
        assert_eq!(registry.list().len(), 2);
    }
}
