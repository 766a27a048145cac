//! Elastic Transcoder client on the AWS SDK.
//!
//! `CreateJob` and `ReadJob` are signed with the credentials of the default
//! provider chain. `transcoder.endpoint` overrides the regional endpoint.

use super::{JobRequest, JobStatus, TranscodeService};
use crate::config::TranscoderConfig;
use crate::error::TranscodeError;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_elastictranscoder::error::DisplayErrorContext;
use aws_sdk_elastictranscoder::types::{CreateJobOutput, JobInput};
use tracing::debug;

pub struct AwsTranscoder {
    client: aws_sdk_elastictranscoder::Client,
}

impl AwsTranscoder {
    pub fn new(sdk_config: &SdkConfig, config: &TranscoderConfig) -> Self {
        let mut builder = aws_sdk_elastictranscoder::config::Builder::from(sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: aws_sdk_elastictranscoder::Client::from_conf(builder.build()),
        }
    }
}

fn service_error<E>(err: E) -> TranscodeError
where
    E: std::error::Error + 'static,
{
    TranscodeError::Request(DisplayErrorContext(err).to_string())
}

fn job_input(request: &JobRequest) -> JobInput {
    let input = &request.input;
    JobInput::builder()
        .key(&input.key)
        .frame_rate(&input.frame_rate)
        .resolution(&input.resolution)
        .aspect_ratio(&input.aspect_ratio)
        .interlaced(&input.interlaced)
        .container(&input.container)
        .build()
}

fn job_outputs(request: &JobRequest) -> Vec<CreateJobOutput> {
    request
        .outputs
        .iter()
        .map(|output| {
            CreateJobOutput::builder()
                .key(&output.key)
                .preset_id(&output.preset_id)
                .build()
        })
        .collect()
}

#[async_trait]
impl TranscodeService for AwsTranscoder {
    async fn create_job(&self, request: &JobRequest) -> Result<String, TranscodeError> {
        let response = self
            .client
            .create_job()
            .pipeline_id(&request.pipeline_id)
            .output_key_prefix(&request.output_key_prefix)
            .input(job_input(request))
            .set_outputs(Some(job_outputs(request)))
            .send()
            .await
            .map_err(service_error)?;

        let job = response
            .job()
            .ok_or_else(|| TranscodeError::Decode("CreateJob response has no job".to_string()))?;
        let job_id = job
            .id()
            .ok_or_else(|| TranscodeError::Decode("CreateJob response has no job id".to_string()))?;

        debug!(job_id, status = ?job.status(), "Job created");
        Ok(job_id.to_string())
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, TranscodeError> {
        let response = self
            .client
            .read_job()
            .id(job_id)
            .send()
            .await
            .map_err(service_error)?;

        let job = response
            .job()
            .ok_or_else(|| TranscodeError::Decode(format!("ReadJob response for {} has no job", job_id)))?;
        let status = job
            .status()
            .ok_or_else(|| TranscodeError::Decode(format!("job {} has no status", job_id)))?;
        let detail = job.output().and_then(|output| output.status_detail());

        Ok(JobStatus::from_service(status, detail))
    }
}
