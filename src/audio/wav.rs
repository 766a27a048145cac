//! # Streaming WAV Encoder
//!
//! Wraps raw PCM bytes into a RIFF/WAVE container while they arrive, without
//! ever holding the whole recording in memory.
//!
//! ## Streaming header
//! The final length of a live recording is unknown when the header goes out,
//! and the output is an append-only upload, so the header can't be patched
//! afterwards. The RIFF and `data` chunk sizes are therefore written as
//! `0xFFFFFFFF`, the usual marker for "length unknown, read to end of
//! stream". Decoders and transcoders treat it that way.
//!
//! ## Byte layout (44-byte header)
//! ```text
//! "RIFF" <riff size> "WAVE"
//! "fmt " 16 <format=1 PCM> <channels> <sample rate> <byte rate> <block align> <bits>
//! "data" <data size>
//! <sample frames...>
//! ```

use crate::error::EncoderError;
use byteorder::{LittleEndian, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the canonical PCM WAV header in bytes.
pub const HEADER_LEN: usize = 44;

/// Chunk size written while the final length is unknown.
const UNKNOWN_LENGTH: u32 = u32::MAX;

const PCM_FORMAT: u16 = 1;

/// Container parameters for one recording.
///
/// ## Rust Concepts:
/// - **Copy**: three small integers, cheap to pass around by value
/// - **Serialize/Deserialize**: exposed as-is in the session API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WavSpec {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavSpec {
    /// Mono, 16-bit PCM at the given sample rate (the ingest format).
    pub fn mono_16bit(sample_rate: u32) -> Self {
        Self {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
        }
    }

    pub fn block_align(&self) -> u16 {
        self.channels * (self.bits_per_sample / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * u32::from(self.block_align())
    }

    fn validate(&self) -> Result<(), EncoderError> {
        if self.channels == 0 {
            return Err(EncoderError::UnsupportedFormat("zero channels".to_string()));
        }
        if self.sample_rate == 0 {
            return Err(EncoderError::UnsupportedFormat("zero sample rate".to_string()));
        }
        if self.bits_per_sample == 0 || self.bits_per_sample % 8 != 0 {
            return Err(EncoderError::UnsupportedFormat(format!(
                "{} bits per sample",
                self.bits_per_sample
            )));
        }
        Ok(())
    }

    /// Encode the 44-byte header for this spec.
    pub fn header(&self) -> Bytes {
        let mut buf = Vec::with_capacity(HEADER_LEN);

        // Writes into a Vec cannot fail
        let _ = write_header(&mut buf, self);

        Bytes::from(buf)
    }
}

fn write_header(buf: &mut Vec<u8>, spec: &WavSpec) -> std::io::Result<()> {
    buf.extend_from_slice(b"RIFF");
    buf.write_u32::<LittleEndian>(UNKNOWN_LENGTH)?;
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.write_u32::<LittleEndian>(16)?;
    buf.write_u16::<LittleEndian>(PCM_FORMAT)?;
    buf.write_u16::<LittleEndian>(spec.channels)?;
    buf.write_u32::<LittleEndian>(spec.sample_rate)?;
    buf.write_u32::<LittleEndian>(spec.byte_rate())?;
    buf.write_u16::<LittleEndian>(spec.block_align())?;
    buf.write_u16::<LittleEndian>(spec.bits_per_sample)?;

    buf.extend_from_slice(b"data");
    buf.write_u32::<LittleEndian>(UNKNOWN_LENGTH)?;
    Ok(())
}

/// Incremental encoder: push PCM in, get container bytes out.
///
/// ## Lifecycle:
/// 1. First `push` (or `finish` on an empty recording) emits the header
/// 2. Every `push` passes sample bytes through in order
/// 3. `finish` closes the encoder; later pushes fail with `EncoderError::Finished`
pub struct WavEncoder {
    spec: WavSpec,
    header_emitted: bool,
    finished: bool,
    data_bytes: u64,
}

impl WavEncoder {
    pub fn new(spec: WavSpec) -> Result<Self, EncoderError> {
        spec.validate()?;
        Ok(Self {
            spec,
            header_emitted: false,
            finished: false,
            data_bytes: 0,
        })
    }

    /// Sample bytes accepted so far (header excluded).
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Append raw sample bytes, returning the container bytes to forward.
    ///
    /// The first call is prefixed with the header.
    pub fn push(&mut self, samples: &[u8]) -> Result<Bytes, EncoderError> {
        if self.finished {
            return Err(EncoderError::Finished);
        }

        self.data_bytes += samples.len() as u64;

        if self.header_emitted {
            return Ok(Bytes::copy_from_slice(samples));
        }

        self.header_emitted = true;
        let mut out = BytesMut::with_capacity(HEADER_LEN + samples.len());
        out.put(self.spec.header());
        out.put_slice(samples);
        Ok(out.freeze())
    }

    /// Close the encoder.
    ///
    /// Returns the header if nothing was ever pushed, so that an empty
    /// recording is still a well-formed container.
    pub fn finish(&mut self) -> Result<Option<Bytes>, EncoderError> {
        if self.finished {
            return Err(EncoderError::Finished);
        }
        self.finished = true;

        if self.header_emitted {
            Ok(None)
        } else {
            self.header_emitted = true;
            Ok(Some(self.spec.header()))
        }
    }
}
