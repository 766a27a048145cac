//! # WebSocket Audio Ingest Handler
//!
//! Clients connect to `/ws/audio` and stream raw PCM for one recording.
//!
//! ## WebSocket Protocol:
//! 1. **Open a sub-stream**: `{"type":"stream","meta":{"streamId":"abc","authToken":"t","sampleRate":44100}}`
//! 2. **Audio**: binary frames of 16-bit little-endian mono PCM
//! 3. **End the sub-stream**: `{"type":"stream_end"}` (optional before close)
//! 4. **Close**: the connection close ends the recording
//!
//! A connection may open any number of sub-streams. The first one starts the
//! session pipeline with its metadata; the audio of later ones is appended to
//! the same recording.
//!
//! ## Server Messages:
//! - `{"type":"stream_accepted","streamId":..,"sampleRate":..,"first":true}`
//! - `{"type":"error","code":..,"message":..}`
//!
//! Messages may arrive fragmented; continuation frames are reassembled before
//! they are handled, so a fragmented binary message is one audio chunk.
//!
//! ## Actor Model:
//! Each connection is an independent actor. It owns its `IngestSession`, so
//! nothing about one connection is shared with another, and a protocol error
//! only stops the actor it happened on.

use crate::audio::session::{IngestSession, PipelineLauncher, SessionRegistry, StreamMeta, SubstreamOpened};
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound for one message reassembled from continuation frames.
const MAX_FRAGMENTED_MESSAGE_BYTES: usize = 1024 * 1024;

/// Messages sent by the client as text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open an audio sub-stream
    Stream { meta: StreamMeta },
    /// End the current audio sub-stream
    StreamEnd,
}

/// Messages sent to the client as text frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StreamAccepted {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        /// Whether this sub-stream started the session pipeline
        first: bool,
    },
    Error { code: String, message: String },
}

/// A fragmented message whose final frame has not arrived yet.
enum Fragmented {
    Text(BytesMut),
    Binary(BytesMut),
}

impl Fragmented {
    fn buffer(&mut self) -> &mut BytesMut {
        match self {
            Fragmented::Text(buf) | Fragmented::Binary(buf) => buf,
        }
    }
}

/// WebSocket actor for one ingest connection.
pub struct AudioWebSocket {
    session: IngestSession,
    launcher: Arc<dyn PipelineLauncher>,
    registry: Arc<SessionRegistry>,
    default_sample_rate: u32,
    keepalive_interval: Duration,
    client_timeout: Duration,
    /// Last time anything arrived from the client
    last_heartbeat: Instant,
    fragments: Option<Fragmented>,
}

impl AudioWebSocket {
    pub fn new(app_state: &AppState) -> Self {
        let config = app_state.get_config();
        Self {
            session: IngestSession::new(Uuid::new_v4()),
            launcher: app_state.launcher.clone(),
            registry: app_state.registry.clone(),
            default_sample_rate: config.ingest.default_sample_rate,
            keepalive_interval: config.ingest.keepalive_interval(),
            client_timeout: config.ingest.client_timeout(),
            last_heartbeat: Instant::now(),
            fragments: None,
        }
    }

    fn connection_id(&self) -> Uuid {
        self.session.connection_id()
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Stream { meta }) => self.open_stream(meta, ctx),
            Ok(ClientMessage::StreamEnd) => {
                if !self.session.end_substream() {
                    self.send_error(ctx, "no_stream", "No open stream to end");
                }
            }
            Err(err) => {
                self.send_error(ctx, "invalid_message", &format!("Invalid message: {}", err));
            }
        }
    }

    /// Collect continuation frames; the completed message is handled like an
    /// unfragmented one.
    fn handle_fragment(&mut self, item: Item, ctx: &mut ws::WebsocketContext<Self>) {
        let (data, last) = match item {
            Item::FirstText(data) => {
                self.fragments = Some(Fragmented::Text(BytesMut::new()));
                (data, false)
            }
            Item::FirstBinary(data) => {
                self.fragments = Some(Fragmented::Binary(BytesMut::new()));
                (data, false)
            }
            Item::Continue(data) => (data, false),
            Item::Last(data) => (data, true),
        };

        let Some(pending) = self.fragments.as_mut() else {
            self.send_error(ctx, "invalid_message", "Continuation frame without a first frame");
            return;
        };

        let buffer = pending.buffer();
        if buffer.len() + data.len() > MAX_FRAGMENTED_MESSAGE_BYTES {
            self.fragments = None;
            self.send_error(ctx, "message_too_large", "Fragmented message exceeds the size limit");
            ctx.close(Some(ws::CloseCode::Size.into()));
            ctx.stop();
            return;
        }
        buffer.extend_from_slice(&data);

        if !last {
            return;
        }

        match self.fragments.take() {
            Some(Fragmented::Binary(buf)) => self.forward_audio(buf.freeze(), ctx),
            Some(Fragmented::Text(buf)) => match std::str::from_utf8(&buf) {
                Ok(text) => self.handle_text(text, ctx),
                Err(_) => self.send_error(ctx, "invalid_message", "Text message is not valid UTF-8"),
            },
            None => {}
        }
    }

    fn open_stream(&mut self, meta: StreamMeta, ctx: &mut ws::WebsocketContext<Self>) {
        if let Err(reason) = meta.validate() {
            self.send_error(ctx, "invalid_meta", &reason);
            return;
        }

        let requested_id = meta.stream_id.clone();
        let opened = self.session.open_substream(meta, self.launcher.as_ref());

        let Some(active) = self.session.meta() else {
            return;
        };
        let stream_id = active.stream_id.clone();
        let sample_rate = active.sample_rate_or(self.default_sample_rate);

        let first = match opened {
            SubstreamOpened::Started => {
                info!(
                    connection_id = %self.connection_id(),
                    stream_id = %stream_id,
                    sample_rate,
                    "Audio stream opened, pipeline started"
                );
                true
            }
            SubstreamOpened::Joined { .. } => {
                debug!(
                    connection_id = %self.connection_id(),
                    stream_id = %stream_id,
                    requested_stream_id = %requested_id,
                    substream = self.session.substreams(),
                    "Audio sub-stream joined existing pipeline"
                );
                false
            }
        };

        self.send(ctx, &ServerMessage::StreamAccepted { stream_id, sample_rate, first });
    }

    /// Hand audio to the pipeline, in arrival order.
    ///
    /// When the pipeline's channel is full the actor waits for room before
    /// handling any further frame from this connection.
    fn forward_audio(&mut self, data: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(sender) = self.session.audio_sender() else {
            if self.session.is_failed() {
                self.send_error(ctx, "pipeline_failed", "The recording pipeline stopped; audio discarded");
            } else {
                self.send_error(ctx, "no_stream", "Binary audio received without an open stream");
            }
            return;
        };

        match sender.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(data)) => {
                let pending = async move { sender.send(data).await.is_ok() };
                ctx.wait(pending.into_actor(self).map(|delivered, act, ctx| {
                    // Frames were held back, not missing
                    act.last_heartbeat = Instant::now();
                    if !delivered {
                        act.pipeline_stopped(ctx);
                    }
                }));
            }
            Err(TrySendError::Closed(_)) => self.pipeline_stopped(ctx),
        }
    }

    fn pipeline_stopped(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        warn!(
            connection_id = %self.connection_id(),
            "Pipeline stopped accepting audio"
        );
        self.session.mark_failed();
        self.send_error(ctx, "pipeline_failed", "The recording pipeline stopped; audio discarded");
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize server message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(connection_id = %self.connection_id(), code, "{}", message);
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }
}

impl Actor for AudioWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id(), "WebSocket connection started");

        // Keep-alive pings; the interval dies with the actor
        ctx.run_interval(self.keepalive_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(connection_id = %act.connection_id(), "WebSocket client timed out, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let had_pipeline = self.session.close();
        self.registry.close_connection();

        match self.session.meta() {
            Some(meta) if had_pipeline => info!(
                connection_id = %self.connection_id(),
                stream_id = %meta.stream_id,
                substreams = self.session.substreams(),
                "WebSocket connection closed, recording finalized"
            ),
            _ => info!(
                connection_id = %self.connection_id(),
                "WebSocket connection closed without audio"
            ),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => self.forward_audio(data, ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(connection_id = %self.connection_id(), reason = ?reason, "Client closed WebSocket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(item)) => self.handle_fragment(item, ctx),
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id(), error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// Upgrades the request unless the connection limit is reached (503).
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "WebSocket connection request");

    let registry = app_state.registry.clone();
    if !registry.try_open_connection() {
        warn!(open = registry.open_connections(), "Connection limit reached, refusing WebSocket");
        return Err(AppError::Unavailable("Too many concurrent sessions".to_string()).into());
    }

    let websocket = AudioWebSocket::new(&app_state);
    ws::start(websocket, &req, stream).map_err(|err| {
        // The actor never started, so release its slot here
        registry.close_connection();
        err
    })
}
