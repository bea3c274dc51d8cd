//! # Audio Frame Codec
//!
//! Decodes and encodes the binary audio frames exchanged over the WebSocket.
//!
//! ## Layout:
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 4 | timestamp (u32, little-endian) |
//! | 4 | 4 | status flags (u32, little-endian) |
//! | 8 | 2·n | PCM16 little-endian samples |
//!
//! ## Key Rust Concepts:
//! - **ByteOrder trait**: `LittleEndian::read_u32` reads fixed-width integers from slices
//! - **Newtype pattern**: `StatusFlags(u32)` gives meaning to raw bits without losing them
//! - **Pure functions**: decoding never touches shared state, so it is trivially testable

use crate::audio::pcm;
use crate::error::FrameError;
use byteorder::{ByteOrder, LittleEndian};
use std::time::Duration;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Samples per frame the client nominally sends (and the server produces for TTS).
pub const NOMINAL_FRAME_SAMPLES: usize = 2048;

/// Status bits carried in every inbound frame.
///
/// Bits other than the two defined ones are reserved: they are preserved exactly
/// so a decode → encode cycle returns the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags(u32);

impl StatusFlags {
    /// Bit 0: the client measured voice energy in this chunk
    pub const VOICE_ENERGY: u32 = 1 << 0;
    /// Bit 1: the microphone is muted
    pub const MIC_MUTED: u32 = 1 << 1;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn voice_energy(self) -> bool {
        self.0 & Self::VOICE_ENERGY != 0
    }

    pub fn mic_muted(self) -> bool {
        self.0 & Self::MIC_MUTED != 0
    }
}

/// One timestamped chunk of PCM16 mono audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub timestamp: u32,
    pub status_flags: StatusFlags,
    /// Raw PCM16 little-endian bytes, always an even length
    pub payload: Vec<u8>,
}

impl AudioFrame {
    pub fn new(timestamp: u32, status_flags: StatusFlags, payload: Vec<u8>) -> Self {
        Self {
            timestamp,
            status_flags,
            payload,
        }
    }

    /// Build a frame from decoded samples (used by synthesizers and tests).
    pub fn from_samples(timestamp: u32, status_flags: StatusFlags, samples: &[i16]) -> Self {
        Self::new(timestamp, status_flags, pcm::samples_to_bytes(samples))
    }

    /// Decode a binary WebSocket message into a frame.
    ///
    /// ## Errors:
    /// - `FrameError::Truncated` when the message is shorter than the 8-byte header
    /// - `FrameError::OddPayload` when the payload cannot hold whole 16-bit samples
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated { len: bytes.len() });
        }

        let payload = &bytes[HEADER_LEN..];
        if payload.len() % 2 != 0 {
            return Err(FrameError::OddPayload { len: payload.len() });
        }

        Ok(Self {
            timestamp: LittleEndian::read_u32(&bytes[0..4]),
            status_flags: StatusFlags::from_bits(LittleEndian::read_u32(&bytes[4..8])),
            payload: payload.to_vec(),
        })
    }

    /// Encode the frame into its wire representation. Never fails.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + self.payload.len()];
        LittleEndian::write_u32(&mut out[0..4], self.timestamp);
        LittleEndian::write_u32(&mut out[4..8], self.status_flags.bits());
        out[HEADER_LEN..].copy_from_slice(&self.payload);
        out
    }

    /// Number of 16-bit samples in the payload.
    pub fn sample_count(&self) -> usize {
        self.payload.len() / 2
    }

    /// Audio time covered by this frame at the given sample rate.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        if sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.sample_count() as u64 * 1_000_000_000 / sample_rate as u64)
    }

    /// Decoded samples of the payload.
    pub fn samples(&self) -> Vec<i16> {
        pcm::bytes_to_samples(&self.payload)
    }
}
