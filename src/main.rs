//! # Stream Relay - Main Application Entry Point
//!
//! Accepts live audio over WebSocket, records it as a WAV file in object
//! storage while it streams in, has it transcoded to MP3 by an external job
//! service and tells a downstream API where the result lives.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection and pipeline is a task on the runtime
//! - **trait objects**: storage, job service and notifier are injected as
//!   `Arc<dyn Trait>` so tests can replace them
//! - **Result<T, E>**: startup errors bubble up with `?` via `anyhow`
//! - **static**: a global flag signals shutdown
//!
//! ## Application Architecture:
//! - **config**: configuration (defaults, TOML file, environment variables)
//! - **state**: shared state and request metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: request metrics
//! - **handlers**: config and session endpoints
//! - **websocket**: the `/ws/audio` ingest actor
//! - **audio**: ingest sessions and the WAV encoder
//! - **aws**: shared AWS SDK configuration
//! - **storage**: object store trait, upload relay, S3 and filesystem stores
//! - **transcode**: job model, AWS and HTTP job clients, completion waiter
//! - **notify**: downstream API notifier
//! - **pipeline**: drives one session through all of the above
//! - **error**: HTTP and pipeline error types

mod audio;
mod aws;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod notify;
mod pipeline;
mod state;
mod storage;
mod transcode;
mod websocket;

#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::session::SessionRegistry;
use config::{AppConfig, StorageBackend, TranscoderBackend};
use notify::HttpNotifier;
use pipeline::{Pipeline, PipelineDeps};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{FsObjectStore, ObjectStore, S3ObjectStore};
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcode::{AwsTranscoder, HttpTranscoder, TranscodeService};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// How often finished sessions are pruned from the registry.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// How long a finished session stays visible in the sessions API.
const SESSION_RETENTION_MINUTES: i64 = 60;

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the collaborators** (object store, job service, notifier)
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** on SIGTERM/SIGINT
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting stream-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        storage = ?config.storage.backend,
        transcoder = ?config.transcoder.backend,
        bucket = %config.storage.bucket,
        pipeline_id = %config.transcoder.pipeline_id,
        api_endpoint = %config.api.endpoint,
        "Configuration loaded"
    );
    warn_on_missing_collaborators(&config);

    let client = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let registry = Arc::new(SessionRegistry::new(config.server.max_concurrent_sessions));
    let deps = PipelineDeps::new(
        &config,
        build_store(&config).await,
        build_transcoder(&config, client.clone()).await,
        Arc::new(HttpNotifier::new(client, &config.api)),
        registry.clone(),
    );
    let app_state = AppState::new(config.clone(), registry.clone(), Arc::new(Pipeline::new(deps)));
    let bind_addr = config.bind_addr();

    setup_signal_handlers();
    spawn_registry_pruning(registry);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{stream_id}", web::get().to(handlers::get_session)),
            )
            .route("/ws/audio", web::get().to(websocket::audio_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` controls the filter; the default is
/// `stream_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Object store selected by `storage.backend`.
async fn build_store(config: &AppConfig) -> Arc<dyn ObjectStore> {
    match config.storage.backend {
        StorageBackend::S3 => {
            let sdk_config = aws::sdk_config(&config.storage.region).await;
            Arc::new(S3ObjectStore::new(&sdk_config, &config.storage))
        }
        StorageBackend::Filesystem => Arc::new(FsObjectStore::new(
            &config.storage.root_dir,
            config.storage.bucket.clone(),
        )),
    }
}

/// Job service client selected by `transcoder.backend`.
async fn build_transcoder(config: &AppConfig, client: reqwest::Client) -> Arc<dyn TranscodeService> {
    match config.transcoder.backend {
        TranscoderBackend::Aws => {
            let sdk_config = aws::sdk_config(&config.transcoder.region).await;
            Arc::new(AwsTranscoder::new(&sdk_config, &config.transcoder))
        }
        TranscoderBackend::Http => Arc::new(HttpTranscoder::new(client, &config.transcoder)),
    }
}

/// Collaborator identifiers are not validated at startup; calls fail when made.
fn warn_on_missing_collaborators(config: &AppConfig) {
    let missing = [
        ("storage.bucket (AWS_S3_BUCKET_NAME)", config.storage.bucket.is_empty()),
        ("transcoder.pipeline_id (AWS_ELASTIC_TRANSCODER_PIPELINE_ID)", config.transcoder.pipeline_id.is_empty()),
        ("transcoder.preset_id (AWS_ELASTIC_TRANSCODER_PRESET_ID)", config.transcoder.preset_id.is_empty()),
        ("api.endpoint (API_ENDPOINT)", config.api.endpoint.is_empty()),
    ];

    for (name, is_missing) in missing {
        if is_missing {
            warn!("{} is not set; sessions will fail when they reach that step", name);
        }
    }
}

/// Drop finished sessions from the registry once they are old enough.
fn spawn_registry_pruning(registry: Arc<SessionRegistry>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            let pruned = registry.prune_finished(chrono::Duration::minutes(SESSION_RETENTION_MINUTES));
            if pruned > 0 {
                debug!(pruned, "Pruned finished sessions");
            }
        }
    });
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown flag, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
