//! # Transcode Orchestration and Completion Waiting
//!
//! After an upload completes, the orchestrator submits exactly one job and
//! then hands over to the completion waiter:
//!
//! ```text
//! Submitted --(create_job fails)--> Failed   (no resubmission)
//!     |
//!  Polling --(Complete)--> Done
//!     |    --(Error)-----> Failed            (service detail kept)
//!     |    --(other)-----> Polling           (after the poll interval)
//!     |    --(query error)-> Polling         (after a backoff delay)
//!     |    --(too many query errors in a row)--> Failed
//! ```
//!
//! Polling is a plain loop with a sleep between iterations; non-terminal
//! statuses are polled without any upper bound.

use super::{JobRequest, JobStatus, TranscodeService};
use crate::config::TranscoderConfig;
use crate::error::{PipelineError, TranscodeError};
use crate::storage::UploadResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing of the status polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Consecutive failed status queries tolerated before giving up
    pub max_consecutive_errors: u32,
    pub max_backoff: Duration,
}

impl PollPolicy {
    pub fn from_config(config: &TranscoderConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            max_consecutive_errors: config.max_poll_errors,
            max_backoff: config.max_poll_backoff(),
        }
    }

    /// Delay before the next query after `errors` consecutive failed queries.
    ///
    /// No errors: the plain interval. Otherwise the interval doubles per
    /// failure, capped at `max_backoff` (but never below the interval).
    pub fn next_delay(&self, errors: u32) -> Duration {
        if errors == 0 {
            return self.interval;
        }
        let backoff = self.interval.saturating_mul(1 << errors.min(16));
        backoff.min(self.max_backoff.max(self.interval))
    }
}

/// Successful end of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub job_id: String,
    pub polls: u32,
}

/// Polls one job until it reaches a terminal status.
pub struct CompletionWaiter {
    service: Arc<dyn TranscodeService>,
    policy: PollPolicy,
}

impl CompletionWaiter {
    pub fn new(service: Arc<dyn TranscodeService>, policy: PollPolicy) -> Self {
        Self { service, policy }
    }

    pub async fn wait(&self, job_id: &str) -> Result<JobCompletion, TranscodeError> {
        let mut polls = 0u32;
        let mut errors = 0u32;

        loop {
            tokio::time::sleep(self.policy.next_delay(errors)).await;
            polls += 1;

            match self.service.job_status(job_id).await {
                Ok(JobStatus::Complete) => {
                    info!(job_id = %job_id, polls, "Transcode job complete");
                    return Ok(JobCompletion { job_id: job_id.to_string(), polls });
                }
                Ok(JobStatus::Error(detail)) => {
                    return Err(TranscodeError::JobFailed {
                        job_id: job_id.to_string(),
                        detail,
                    });
                }
                Ok(status) => {
                    errors = 0;
                    debug!(job_id = %job_id, status = %status, polls, "Transcode job pending");
                }
                Err(err) => {
                    errors += 1;
                    if errors >= self.policy.max_consecutive_errors {
                        return Err(TranscodeError::PollingExhausted {
                            job_id: job_id.to_string(),
                            attempts: errors,
                            last_error: err.to_string(),
                        });
                    }
                    warn!(
                        job_id = %job_id,
                        error = %err,
                        consecutive_errors = errors,
                        "Job status query failed, retrying"
                    );
                }
            }
        }
    }
}

/// Submits the job for an upload and waits for it to finish.
pub struct TranscodeOrchestrator {
    service: Arc<dyn TranscodeService>,
    config: TranscoderConfig,
    waiter: CompletionWaiter,
}

/// Identifiers handed back once a job is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    pub output_key: String,
}

impl TranscodeOrchestrator {
    pub fn new(service: Arc<dyn TranscodeService>, config: TranscoderConfig) -> Self {
        let waiter = CompletionWaiter::new(service.clone(), PollPolicy::from_config(&config));
        Self { service, config, waiter }
    }

    /// Send the one job-creation request for this upload.
    pub async fn submit(&self, stream_id: &str, upload: &UploadResult) -> Result<SubmittedJob, PipelineError> {
        let request = JobRequest::for_upload(&self.config, stream_id, &upload.key, upload.content_id());
        let output_key = request.output_key().unwrap_or_default();

        info!(
            stream_id = %stream_id,
            input = %upload.key,
            output = %output_key,
            "Submitting transcode job"
        );

        let job_id = self
            .service
            .create_job(&request)
            .await
            .map_err(PipelineError::Submission)?;

        Ok(SubmittedJob { job_id, output_key })
    }

    pub async fn wait(&self, job: &SubmittedJob) -> Result<JobCompletion, PipelineError> {
        self.waiter.wait(&job.job_id).await.map_err(PipelineError::Transcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::testing::ScriptedTranscoder;
    use tokio::time::Instant;

    fn policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(1),
            max_consecutive_errors: 3,
            max_backoff: Duration::from_secs(30),
        }
    }

    fn query_error() -> TranscodeError {
        TranscodeError::Request("connection reset".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_complete_at_interval() {
        let service = Arc::new(ScriptedTranscoder::with_script(vec![
            Ok(JobStatus::InProgress),
            Ok(JobStatus::InProgress),
            Ok(JobStatus::Complete),
        ]));
        let waiter = CompletionWaiter::new(service.clone(), policy());

        let start = Instant::now();
        let completion = waiter.wait("job-1").await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(completion.polls, 3);
        assert_eq!(service.polls(), 3);
        assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3100), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_fails_once() {
        let service = Arc::new(ScriptedTranscoder::with_script(vec![
            Ok(JobStatus::Submitted),
            Ok(JobStatus::Error("4000 bad input".to_string())),
        ]));
        let waiter = CompletionWaiter::new(service.clone(), policy());

        let err = waiter.wait("job-1").await.unwrap_err();
        match err {
            TranscodeError::JobFailed { job_id, detail } => {
                assert_eq!(job_id, "job-1");
                assert_eq!(detail, "4000 bad input");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(service.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_query_errors_are_retried() {
        let service = Arc::new(ScriptedTranscoder::with_script(vec![
            Err(query_error()),
            Err(query_error()),
            Ok(JobStatus::InProgress),
            Err(query_error()),
            Ok(JobStatus::Complete),
        ]));
        let waiter = CompletionWaiter::new(service.clone(), policy());

        let completion = waiter.wait("job-1").await.unwrap();
        assert_eq!(completion.polls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_query_errors_exhaust() {
        let service = Arc::new(ScriptedTranscoder::with_script(vec![
            Err(query_error()),
            Err(query_error()),
            Err(query_error()),
            Ok(JobStatus::Complete),
        ]));
        let waiter = CompletionWaiter::new(service.clone(), policy());

        let start = Instant::now();
        let err = waiter.wait("job-1").await.unwrap_err();

        assert!(matches!(err, TranscodeError::PollingExhausted { attempts: 3, .. }));
        assert_eq!(service.polls(), 3);
        // 1s, then 2s and 4s of backoff
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = policy();
        assert_eq!(policy.next_delay(0), Duration::from_secs(1));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_submission_failure_is_terminal() {
        let service = Arc::new(ScriptedTranscoder::failing_submission());
        let orchestrator = TranscodeOrchestrator::new(service.clone(), AppConfig::default().transcoder);
        let upload = UploadResult { key: "streams/abc/audio.wav".into(), etag: "\"f00\"".into() };

        let err = orchestrator.submit("abc", &upload).await.unwrap_err();
        assert_eq!(err.stage(), "submission");
        assert_eq!(service.submissions(), 1);
        assert_eq!(service.polls(), 0);
    }

    #[tokio::test]
    async fn test_submit_derives_output_key() {
        let service = Arc::new(ScriptedTranscoder::completing());
        let orchestrator = TranscodeOrchestrator::new(service.clone(), AppConfig::default().transcoder);
        let upload = UploadResult { key: "streams/abc/audio.wav".into(), etag: "\"f00\"".into() };

        let job = orchestrator.submit("abc", &upload).await.unwrap();
        assert_eq!(job.output_key, "streams/abc/f00.mp3");
        assert_eq!(service.requests()[0].input.key, "streams/abc/audio.wav");
    }
}
