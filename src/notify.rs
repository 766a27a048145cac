//! # Result Notifier
//!
//! Records the transcoded artifact's key against the stream resource of the
//! downstream API:
//!
//! ```text
//! PATCH {api endpoint}/streams/{streamId}
//! Authorization: Bearer {authToken}
//! {"stream": {"audio_s3_key": "streams/abc/<hash>.mp3"}}
//! ```
//!
//! One attempt per session. Success and failure are both final; failures are
//! logged by the caller and never retried.

use crate::config::ApiConfig;
use crate::error::NotifyError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

/// What the downstream API is told about a finished stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub stream_id: String,
    pub audio_key: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
}

#[async_trait]
pub trait ResultNotifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpNotifier {
    pub fn new(client: reqwest::Client, config: &ApiConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Build the partial-update request without sending it.
    pub fn build_request(&self, notification: &Notification) -> Result<reqwest::Request, NotifyError> {
        if self.endpoint.is_empty() {
            return Err(NotifyError::NotConfigured);
        }

        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| NotifyError::InvalidEndpoint(format!("{}: {}", self.endpoint, e)))?;
        // Pushed as an encoded segment so `#` or `?` in a stream id stays inside it
        url.path_segments_mut()
            .map_err(|_| NotifyError::InvalidEndpoint(self.endpoint.clone()))?
            .pop_if_empty()
            .push("streams")
            .push(&notification.stream_id);

        let body = json!({
            "stream": {
                "audio_s3_key": notification.audio_key
            }
        });

        Ok(self
            .client
            .patch(url)
            .bearer_auth(&notification.auth_token)
            .timeout(self.timeout)
            .json(&body)
            .build()?)
    }
}

#[async_trait]
impl ResultNotifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let request = self.build_request(notification)?;
        let response = self.client.execute(request).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status: status.as_u16(), body });
        }

        info!(
            stream_id = %notification.stream_id,
            key = %notification.audio_key,
            status = status.as_u16(),
            "Downstream API updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(endpoint: &str) -> HttpNotifier {
        let config = ApiConfig { endpoint: endpoint.to_string(), timeout_secs: 5 };
        HttpNotifier::new(reqwest::Client::new(), &config)
    }

    fn notification() -> Notification {
        Notification {
            stream_id: "abc".to_string(),
            audio_key: "streams/abc/f00.mp3".to_string(),
            auth_token: "secret-token".to_string(),
        }
    }

    #[test]
    fn test_builds_partial_update() {
        let request = notifier("https://api.example.com/v1/").build_request(&notification()).unwrap();

        assert_eq!(request.method(), reqwest::Method::PATCH);
        assert_eq!(request.url().as_str(), "https://api.example.com/v1/streams/abc");
        assert_eq!(
            request.headers().get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer secret-token"
        );

        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json, serde_json::json!({"stream": {"audio_s3_key": "streams/abc/f00.mp3"}}));
    }

    #[test]
    fn test_stream_id_is_one_path_segment() {
        let mut reserved = notification();
        reserved.stream_id = "rec#1?x=2".to_string();

        let request = notifier("https://api.example.com").build_request(&reserved).unwrap();
        assert_eq!(request.url().path(), "/streams/rec%231%3Fx=2");
        assert_eq!(request.url().fragment(), None);
        assert_eq!(request.url().query(), None);
    }

    #[test]
    fn test_invalid_endpoint() {
        let err = notifier("not a url").build_request(&notification()).unwrap_err();
        assert!(matches!(err, NotifyError::InvalidEndpoint(_)));
    }

    #[test]
    fn test_missing_endpoint_fails_at_call_time() {
        let err = notifier("").build_request(&notification()).unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured));
    }

    #[test]
    fn test_token_is_not_serialized() {
        let json = serde_json::to_string(&notification()).unwrap();
        assert!(!json.contains("secret-token"));
    }
}
