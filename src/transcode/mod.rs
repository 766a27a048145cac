//! # Transcoding Jobs
//!
//! The external job service turns an uploaded WAV recording into an MP3.
//! This module holds the job model, the `TranscodeService` trait the pipeline
//! talks to, its two clients (AWS SDK and plain HTTP) and the completion waiter.
//!
//! ## Job lifecycle as observed by polling:
//! ```text
//! Submitted -> InProgress -> Complete
//!                        \-> Error(detail)
//! ```

pub mod aws;
pub mod http;
pub mod waiter;

pub use aws::AwsTranscoder;
pub use http::HttpTranscoder;

use crate::config::TranscoderConfig;
use crate::error::TranscodeError;
use crate::storage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Input detection flags passed through unchanged to the job service.
pub const AUTO: &str = "auto";

/// Job status as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Submitted,
    InProgress,
    Complete,
    /// Failed or canceled, with the service-provided detail
    Error(String),
}

impl JobStatus {
    /// Map a service status string; unknown values count as still running.
    pub fn from_service(status: &str, detail: Option<&str>) -> Self {
        match status {
            "Submitted" => JobStatus::Submitted,
            "Progressing" | "InProgress" => JobStatus::InProgress,
            "Complete" => JobStatus::Complete,
            "Error" | "Canceled" => JobStatus::Error(
                detail
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("job status {}", status)),
            ),
            _ => JobStatus::InProgress,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error(_))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Error(detail) => write!(f, "error: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobInput {
    pub key: String,
    pub frame_rate: String,
    pub resolution: String,
    pub aspect_ratio: String,
    pub interlaced: String,
    pub container: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobOutput {
    pub key: String,
    pub preset_id: String,
}

/// A job-creation request, serialized in the service's PascalCase shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobRequest {
    pub pipeline_id: String,
    pub output_key_prefix: String,
    pub input: JobInput,
    pub outputs: Vec<JobOutput>,
}

impl JobRequest {
    /// Build the request for one uploaded recording.
    ///
    /// The output is named `<content id>.mp3` under `streams/<streamId>/`.
    pub fn for_upload(
        config: &TranscoderConfig,
        stream_id: &str,
        input_key: &str,
        content_id: &str,
    ) -> Self {
        Self {
            pipeline_id: config.pipeline_id.clone(),
            output_key_prefix: storage::stream_prefix(stream_id),
            input: JobInput {
                key: input_key.to_string(),
                frame_rate: AUTO.to_string(),
                resolution: AUTO.to_string(),
                aspect_ratio: AUTO.to_string(),
                interlaced: AUTO.to_string(),
                container: AUTO.to_string(),
            },
            outputs: vec![JobOutput {
                key: storage::output_name(content_id),
                preset_id: config.preset_id.clone(),
            }],
        }
    }

    /// Full storage key of the first (only) output.
    pub fn output_key(&self) -> Option<String> {
        self.outputs
            .first()
            .map(|output| format!("{}{}", self.output_key_prefix, output.key))
    }
}

/// The job service collaborator.
#[async_trait]
pub trait TranscodeService: Send + Sync {
    /// Submit a job; returns the service's job id.
    async fn create_job(&self, request: &JobRequest) -> Result<String, TranscodeError>;

    /// Query the current status of a job.
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, TranscodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_job_request_shape() {
        let mut config = AppConfig::default().transcoder;
        config.pipeline_id = "1111111111111-abcde1".to_string();
        config.preset_id = "1351620000001-300040".to_string();

        let request = JobRequest::for_upload(&config, "abc", "streams/abc/audio.wav", "d41d8cd9");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["PipelineId"], "1111111111111-abcde1");
        assert_eq!(json["OutputKeyPrefix"], "streams/abc/");
        assert_eq!(json["Input"]["Key"], "streams/abc/audio.wav");
        assert_eq!(json["Input"]["Container"], "auto");
        assert_eq!(json["Input"]["AspectRatio"], "auto");
        assert_eq!(json["Outputs"][0]["Key"], "d41d8cd9.mp3");
        assert_eq!(json["Outputs"][0]["PresetId"], "1351620000001-300040");
        assert_eq!(request.output_key().unwrap(), "streams/abc/d41d8cd9.mp3");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(JobStatus::from_service("Submitted", None), JobStatus::Submitted);
        assert_eq!(JobStatus::from_service("Progressing", None), JobStatus::InProgress);
        assert_eq!(JobStatus::from_service("Complete", None), JobStatus::Complete);
        assert_eq!(
            JobStatus::from_service("Error", Some("4000 bad input")),
            JobStatus::Error("4000 bad input".to_string())
        );
        assert!(JobStatus::from_service("Canceled", None).is_terminal());
        assert!(!JobStatus::from_service("Whatever", None).is_terminal());
    }
}
