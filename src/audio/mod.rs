//! # Audio Ingest Module
//!
//! Per-connection ingest state and the container encoding of the recorded PCM.
//!
//! ## Key Components:
//! - **WebSocket Handler**: accepts audio connections (`/ws/audio`, in `src/websocket.rs`)
//! - **Session**: lazy, initialize-once pipeline handle per connection plus the
//!   shared session registry (`session.rs`)
//! - **WAV Encoder**: wraps raw PCM in a streaming WAV container (`wav.rs`)
//!
//! ## Audio Format:
//! - **Sample Rate**: from the first sub-stream's metadata (default 48 kHz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod session; // Ingest sessions and registry
pub mod wav;     // Streaming WAV encoder
