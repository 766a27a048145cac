//! # Configuration Management
//!
//! This module loads the service configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP__ prefix, sections separated by `__`)
//! - The plain environment names used by existing deployments
//!   (`AWS_REGION`, `AWS_S3_BUCKET_NAME`, `API_ENDPOINT`, ...)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: derive macros turn these structs into/from TOML and environment values
//! - **impl Default**: one place that documents every default
//! - **Result<T, E>**: loading fails early with a readable error
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Plain deployment variables (PORT, AWS_S3_BUCKET_NAME, ...)
//! 2. Prefixed environment variables (APP__SERVER__PORT, APP__STORAGE__BUCKET, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Collaborator settings are not validated here
//! Bucket, pipeline id, preset id and API endpoint default to empty strings.
//! A missing value makes the call to that collaborator fail when it happens,
//! and that failure is logged against the session that triggered it.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Minimum part size accepted by S3-compatible multipart uploads (5 MiB).
pub const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each collaborator (storage, job service, downstream API) gets its own
/// section so that its settings can be overridden independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub storage: StorageConfig,
    pub transcoder: TranscoderConfig,
    pub api: ApiConfig,
}

/// HTTP listener settings.
///
/// ## Fields:
/// - `host`: IP address to bind to ("0.0.0.0" in containers)
/// - `port`: TCP port for both the REST endpoints and the `/ws/audio` upgrade
/// - `max_concurrent_sessions`: open ingest connections allowed at once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_concurrent_sessions: usize,
}

/// Ingest connection behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Interval between keep-alive pings sent to the client
    pub keepalive_interval_secs: u64,
    /// A client silent for longer than this is disconnected
    pub client_timeout_secs: u64,
    /// Sample rate used when a sub-stream's metadata omits `sampleRate`
    pub default_sample_rate: u32,
    /// Audio chunks buffered between a connection and its pipeline
    pub channel_capacity: usize,
}

/// Which object store the pipeline uploads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Amazon S3 (or an S3-compatible `endpoint`)
    S3,
    /// Local directory tree under `root_dir`, for development
    Filesystem,
}

/// Which client talks to the transcoding job service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscoderBackend {
    /// Elastic Transcoder through the AWS SDK (signed requests)
    Aws,
    /// Plain JSON over HTTP, for emulators or a signing proxy at `endpoint`
    Http,
}

/// Object storage settings.
///
/// ## Fields:
/// - `backend`: `s3` or `filesystem`
/// - `region`: storage region (from `AWS_REGION`)
/// - `endpoint`: S3-compatible endpoint override (path-style addressing)
/// - `bucket`: target bucket (from `AWS_S3_BUCKET_NAME`)
/// - `root_dir`: base directory of the filesystem store
/// - `part_size_bytes`: multipart part size threshold (bounds memory per session)
/// - `queue_size`: parts uploaded concurrently per session (bounds parallelism)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub region: String,
    pub endpoint: Option<String>,
    pub bucket: String,
    pub root_dir: String,
    pub part_size_bytes: usize,
    pub queue_size: usize,
}

/// Transcoding job service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    pub backend: TranscoderBackend,
    pub region: String,
    /// Overrides the regional endpoint derived from `region`
    pub endpoint: Option<String>,
    pub pipeline_id: String,
    pub preset_id: String,
    pub poll_interval_ms: u64,
    /// Consecutive failed status queries tolerated before the wait fails
    pub max_poll_errors: u32,
    pub max_poll_backoff_ms: u64,
}

/// Downstream REST API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 3000,
                max_concurrent_sessions: 100,
            },
            ingest: IngestConfig {
                keepalive_interval_secs: 5,
                client_timeout_secs: 60,
                default_sample_rate: 48000,
                channel_capacity: 64,
            },
            storage: StorageConfig {
                backend: StorageBackend::S3,
                region: String::new(),
                endpoint: None,
                bucket: String::new(),
                root_dir: "./data".to_string(),
                part_size_bytes: MIN_PART_SIZE_BYTES,  // 5 MiB parts
                queue_size: 3,                         // 3 parts in flight
            },
            transcoder: TranscoderConfig {
                backend: TranscoderBackend::Aws,
                region: String::new(),
                endpoint: None,
                pipeline_id: String::new(),
                preset_id: String::new(),
                poll_interval_ms: 1000,
                max_poll_errors: 5,
                max_poll_backoff_ms: 30_000,
            },
            api: ApiConfig {
                endpoint: String::new(),
                timeout_secs: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3001`: Override the listen port
    /// - `APP__STORAGE__PART_SIZE_BYTES=10485760`: 10 MiB parts
    /// - `AWS_S3_BUCKET_NAME=recordings`: Bucket, as set by existing deployments
    /// - `APP__STORAGE__BACKEND=filesystem`: Keep recordings on local disk
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Prefixed environment variables; a double underscore keeps
            //    snake_case keys like `pipeline_id` intact
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        // Plain variables used by deployment platforms and the existing setup
        for (var, key) in LEGACY_ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        // AWS_REGION applies to both collaborators
        if let Ok(region) = env::var("AWS_REGION") {
            settings = settings
                .set_override("storage.region", region.clone())?
                .set_override("transcoder.region", region)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate the structural values the service depends on.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Session limit, part size, queue size and channel capacity are positive
    /// - Timer intervals are positive
    ///
    /// Collaborator identifiers are deliberately left alone (see module docs).
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.ingest.keepalive_interval_secs == 0 {
            return Err(anyhow::anyhow!("Keep-alive interval must be greater than 0"));
        }

        if self.ingest.client_timeout_secs <= self.ingest.keepalive_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must exceed the keep-alive interval ({}s)",
                self.ingest.client_timeout_secs,
                self.ingest.keepalive_interval_secs
            ));
        }

        if self.ingest.channel_capacity == 0 {
            return Err(anyhow::anyhow!("Ingest channel capacity must be greater than 0"));
        }

        if self.storage.part_size_bytes < MIN_PART_SIZE_BYTES {
            return Err(anyhow::anyhow!(
                "Part size must be at least {} bytes",
                MIN_PART_SIZE_BYTES
            ));
        }

        if self.storage.queue_size == 0 {
            return Err(anyhow::anyhow!("Upload queue size must be greater than 0"));
        }

        if self.transcoder.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Poll interval must be greater than 0"));
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Environment names from existing deployments and the config key each one sets.
const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("AWS_S3_BUCKET_NAME", "storage.bucket"),
    ("AWS_ELASTIC_TRANSCODER_PIPELINE_ID", "transcoder.pipeline_id"),
    ("AWS_ELASTIC_TRANSCODER_PRESET_ID", "transcoder.preset_id"),
    ("API_ENDPOINT", "api.endpoint"),
];

impl IngestConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl TranscoderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.max_poll_backoff_ms)
    }

    /// Regional REST endpoint unless one is configured explicitly.
    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://elastictranscoder.{}.amazonaws.com", self.region),
        }
    }
}
