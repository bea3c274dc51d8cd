//! # PCM Helpers
//!
//! Sample conversion, the voice-energy measure used by the turn detector, and a
//! re-chunker that turns an arbitrary byte stream into fixed-size frames.
//!
//! ## Key Functions:
//! - **bytes_to_samples / samples_to_bytes**: PCM16 little-endian conversion
//! - **normalized_energy**: Mean absolute amplitude of the leading samples, 0.0 to 1.0
//! - **PcmRechunker**: Splits streamed synthesizer output into 2048-sample frames

use crate::audio::frame::{AudioFrame, StatusFlags, NOMINAL_FRAME_SAMPLES};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Number of leading samples inspected when estimating voice energy.
pub const ENERGY_WINDOW_SAMPLES: usize = 50;

/// Convert raw PCM16 little-endian bytes to samples.
///
/// A trailing odd byte is ignored.
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);

    // Read each 16-bit sample (little-endian format)
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    samples
}

/// Convert samples to PCM16 little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Estimate voice energy of a PCM16 payload.
///
/// ## Calculation:
/// Mean absolute amplitude of the first 50 samples, scaled from the i16 range to `0.0..=1.0`.
/// An empty payload has zero energy.
pub fn normalized_energy(payload: &[u8]) -> f32 {
    let samples = bytes_to_samples(&payload[..payload.len().min(ENERGY_WINDOW_SAMPLES * 2)]);
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f32 = samples.iter().map(|&s| (s as f32).abs()).sum();
    (sum / samples.len() as f32 / 32768.0).min(1.0)
}

/// Re-chunks a stream of PCM bytes into frames of a fixed sample count.
///
/// ## Usage:
/// Speech synthesis APIs stream audio in arbitrary network-sized pieces (sometimes even
/// splitting a sample across two pieces). Outbound audio is sent in nominal frames instead.
/// Timestamps are milliseconds of audio produced so far.
pub struct PcmRechunker {
    pending: Vec<u8>,
    frame_bytes: usize,
    sample_rate: u32,
    samples_emitted: u64,
}

impl PcmRechunker {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_frame_samples(sample_rate, NOMINAL_FRAME_SAMPLES)
    }

    pub fn with_frame_samples(sample_rate: u32, frame_samples: usize) -> Self {
        Self {
            pending: Vec::new(),
            frame_bytes: frame_samples.max(1) * 2,
            sample_rate: sample_rate.max(1),
            samples_emitted: 0,
        }
    }

    /// Add bytes and return every complete frame now available.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_bytes {
            let chunk: Vec<u8> = self.pending.drain(..self.frame_bytes).collect();
            frames.push(self.make_frame(chunk));
        }
        frames
    }

    /// Emit the remaining whole samples as a final short frame, if any.
    pub fn finish(mut self) -> Option<AudioFrame> {
        let whole = self.pending.len() - self.pending.len() % 2;
        if whole == 0 {
            return None;
        }
        let chunk: Vec<u8> = self.pending.drain(..whole).collect();
        Some(self.make_frame(chunk))
    }

    fn make_frame(&mut self, payload: Vec<u8>) -> AudioFrame {
        let timestamp = (self.samples_emitted * 1000 / self.sample_rate as u64) as u32;
        self.samples_emitted += (payload.len() / 2) as u64;
        AudioFrame::new(timestamp, StatusFlags::default(), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_conversion() {
        let samples = vec![0i16, 16384, -16384, 32767, -32768];
        let bytes = samples_to_bytes(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes_to_samples(&bytes), samples);
    }

    #[test]
    fn test_energy_of_silence_and_loud_audio() {
        assert_eq!(normalized_energy(&[]), 0.0);
        assert_eq!(normalized_energy(&samples_to_bytes(&[0; 100])), 0.0);

        let loud = samples_to_bytes(&[16384; 100]);
        assert!((normalized_energy(&loud) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_energy_only_looks_at_leading_window() {
        let mut samples = vec![0i16; ENERGY_WINDOW_SAMPLES];
        samples.extend(std::iter::repeat(i16::MAX).take(500));
        assert_eq!(normalized_energy(&samples_to_bytes(&samples)), 0.0);
    }

    #[test]
    fn test_rechunker_handles_split_samples() {
        let mut rechunker = PcmRechunker::with_frame_samples(1000, 4);

        // 9 bytes: one full frame (8 bytes) and half a sample left over
        let frames = rechunker.push(&[1, 0, 2, 0, 3, 0, 4, 0, 5]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples(), vec![1, 2, 3, 4]);
        assert_eq!(frames[0].timestamp, 0);

        assert!(rechunker.push(&[0, 6, 0]).is_empty());

        let tail = rechunker.finish().unwrap();
        assert_eq!(tail.samples(), vec![5, 6]);
        assert_eq!(tail.timestamp, 4);
    }
}
