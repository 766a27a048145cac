//! Unsigned HTTP client for an Elastic Transcoder style job service, for
//! emulators or a signing proxy configured as `transcoder.endpoint`.
//!
//! - `POST {endpoint}/2012-09-25/jobs` with a `JobRequest` body
//! - `GET {endpoint}/2012-09-25/jobs/{id}`
//!
//! Both answer with `{"Job": {"Id": ..., "Status": ..., "Output": {...}}}`.
//! Request signing is left to whatever sits in front of the endpoint.

use super::{JobRequest, JobStatus, TranscodeService};
use crate::config::TranscoderConfig;
use crate::error::TranscodeError;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

const API_VERSION: &str = "2012-09-25";

pub struct HttpTranscoder {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobEnvelope {
    job: JobBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobBody {
    id: String,
    status: String,
    output: Option<JobOutputStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobOutputStatus {
    status_detail: Option<String>,
}

impl HttpTranscoder {
    pub fn new(client: reqwest::Client, config: &TranscoderConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint(),
        }
    }

    fn jobs_url(&self) -> String {
        format!("{}/{}/jobs", self.endpoint, API_VERSION)
    }

    async fn read_job(response: reqwest::Response) -> Result<JobBody, TranscodeError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscodeError::Status { status: status.as_u16(), body });
        }

        let envelope: JobEnvelope = response
            .json()
            .await
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;
        Ok(envelope.job)
    }
}

#[async_trait]
impl TranscodeService for HttpTranscoder {
    async fn create_job(&self, request: &JobRequest) -> Result<String, TranscodeError> {
        let response = self.client.post(self.jobs_url()).json(request).send().await?;
        let job = Self::read_job(response).await?;
        debug!(job_id = %job.id, status = %job.status, "Job created");
        Ok(job.id)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, TranscodeError> {
        let url = format!("{}/{}", self.jobs_url(), job_id);
        let response = self.client.get(url).send().await?;
        let job = Self::read_job(response).await?;

        let detail = job.output.as_ref().and_then(|o| o.status_detail.as_deref());
        Ok(JobStatus::from_service(&job.status, detail))
    }
}
