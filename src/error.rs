//! # Error Handling
//!
//! Two layers of errors live in this service:
//!
//! - **`AppError`**: errors returned by the HTTP handlers (health, config,
//!   session lookup, WebSocket upgrade). They convert into JSON responses.
//! - **Pipeline errors** (`EncoderError`, `StorageError`, `TranscodeError`,
//!   `NotifyError`, `PipelineError`): errors of one session's pipeline. These
//!   never reach an HTTP client; they are logged and recorded in the session
//!   registry, and they stop only the session that produced them.
//!
//! ## Key Rust Concepts:
//! - **enum variants** carry the data needed to explain the failure
//! - **ResponseError** turns an `AppError` into an HTTP response
//! - **thiserror** derives `Display` and `Error` for the pipeline enums
//! - **#[from]** lets `?` lift a stage error into `PipelineError`

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **Unavailable**: Session limit reached (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON responses of the form:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "No session for stream 'abc'",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON errors come from client input, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Errors raised by the WAV container encoder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncoderError {
    #[error("encoder already finalized")]
    Finished,
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Errors raised by the storage collaborator or the upload relay.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is not configured: {0}")]
    NotConfigured(String),
    #[error("checksum mismatch for part {part_number}")]
    ChecksumMismatch { part_number: u32 },
    #[error("unknown multipart upload '{0}'")]
    UnknownUpload(String),
    #[error("upload task failed: {0}")]
    Task(String),
    #[error("{operation} failed: {message}")]
    Service { operation: &'static str, message: String },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while talking to the transcoding job service.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("job service request failed: {0}")]
    Request(String),
    #[error("job service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected job service response: {0}")]
    Decode(String),
    #[error("job {job_id} failed: {detail}")]
    JobFailed { job_id: String, detail: String },
    #[error("gave up on job {job_id} after {attempts} failed status queries: {last_error}")]
    PollingExhausted {
        job_id: String,
        attempts: u32,
        last_error: String,
    },
}

impl From<reqwest::Error> for TranscodeError {
    fn from(err: reqwest::Error) -> Self {
        TranscodeError::Request(err.to_string())
    }
}

/// Errors raised by the downstream notification call.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("downstream API is not configured")]
    NotConfigured,
    #[error("invalid downstream API endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("notification request failed: {0}")]
    Request(String),
    #[error("downstream API returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        NotifyError::Request(err.to_string())
    }
}

/// Terminal failure of one session pipeline, tagged with the stage that failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("encoding failed: {0}")]
    Encode(#[from] EncoderError),
    #[error("upload failed: {0}")]
    Upload(#[from] StorageError),
    #[error("transcode job submission failed: {0}")]
    Submission(TranscodeError),
    #[error("transcode failed: {0}")]
    Transcode(TranscodeError),
    #[error("notification failed: {0}")]
    Notify(#[from] NotifyError),
}

impl PipelineError {
    /// Short machine-readable stage name for logs and the session registry.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Encode(_) => "encode",
            PipelineError::Upload(_) => "upload",
            PipelineError::Submission(_) => "submission",
            PipelineError::Transcode(_) => "transcode",
            PipelineError::Notify(_) => "notify",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Unavailable("x".into()).status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(AppError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_error_response_body() {
        let response = AppError::NotFound("No session for stream 'abc'".into()).error_response();
        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "not_found");
        assert_eq!(json["error"]["message"], "No session for stream 'abc'");
    }

    #[test]
    fn test_pipeline_error_stage() {
        let err = PipelineError::Transcode(TranscodeError::JobFailed {
            job_id: "job-1".into(),
            detail: "bad input".into(),
        });
        assert_eq!(err.stage(), "transcode");
        assert_eq!(err.to_string(), "transcode failed: job job-1 failed: bad input");

        let err: PipelineError = StorageError::ChecksumMismatch { part_number: 2 }.into();
        assert_eq!(err.stage(), "upload");
    }
}
