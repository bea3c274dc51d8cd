//! # Audio Buffers
//!
//! ## FrameBacklog
//! Holds inbound audio that arrives while the session is waiting for a final transcript.
//! When that transcript turns out to be empty, the backlog is replayed into the next
//! speech-to-text stage so the start of the user's next utterance is not lost.
//!
//! The backlog is bounded (`pipeline.transcribing_buffer_frames`). Once full, the newest
//! frames are dropped and counted; the oldest audio is the start of the next utterance
//! and matters most.
//!
//! ## UtteranceBuffer
//! Collects one utterance for providers that transcribe it in a single request. Silence
//! before the first voiced frame is kept only as a short lead-in, and the whole utterance
//! is capped, so a client that streams silence for minutes holds a fixed amount of memory.

use crate::audio::frame::AudioFrame;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug)]
pub struct FrameBacklog {
    frames: VecDeque<AudioFrame>,
    capacity: usize,
    dropped: u64,
}

impl FrameBacklog {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Queue a frame. Returns `false` when the backlog is full and the frame was dropped.
    pub fn push(&mut self, frame: AudioFrame) -> bool {
        if self.frames.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.frames.push_back(frame);
        true
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames dropped because the backlog was full, over the lifetime of the session.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Samples of one utterance, bounded in both lead-in and total length.
#[derive(Debug)]
pub struct UtteranceBuffer {
    lead_in: VecDeque<AudioFrame>,
    lead_in_samples: usize,
    max_lead_in_samples: usize,
    samples: Vec<i16>,
    max_samples: usize,
    voice_heard: bool,
    truncated: bool,
}

impl UtteranceBuffer {
    pub fn new(sample_rate: u32, max_lead_in: Duration, max_utterance: Duration) -> Self {
        let samples_for = |d: Duration| (d.as_millis() as u64 * sample_rate as u64 / 1000) as usize;
        Self {
            lead_in: VecDeque::new(),
            lead_in_samples: 0,
            max_lead_in_samples: samples_for(max_lead_in),
            samples: Vec::new(),
            max_samples: samples_for(max_utterance),
            voice_heard: false,
            truncated: false,
        }
    }

    /// Add a frame, with the caller's voice decision for it.
    pub fn push(&mut self, frame: AudioFrame, voiced: bool) {
        if !self.voice_heard && !voiced {
            self.lead_in_samples += frame.sample_count();
            self.lead_in.push_back(frame);
            while self.lead_in_samples > self.max_lead_in_samples {
                match self.lead_in.pop_front() {
                    Some(old) => self.lead_in_samples -= old.sample_count(),
                    None => break,
                }
            }
            return;
        }

        if !self.voice_heard {
            self.voice_heard = true;
            let lead_in: Vec<AudioFrame> = self.lead_in.drain(..).collect();
            self.lead_in_samples = 0;
            for earlier in &lead_in {
                self.append(earlier);
            }
        }
        self.append(&frame);
    }

    fn append(&mut self, frame: &AudioFrame) {
        let room = self.max_samples.saturating_sub(self.samples.len());
        let samples = frame.samples();
        if samples.len() > room {
            self.truncated = true;
        }
        self.samples.extend(samples.into_iter().take(room));
    }

    pub fn voice_heard(&self) -> bool {
        self.voice_heard
    }

    /// The utterance hit the length cap and later audio was dropped.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Samples held right now, lead-in included.
    pub fn held_samples(&self) -> usize {
        self.samples.len() + self.lead_in_samples
    }

    /// The collected utterance; empty when no voice was ever heard.
    pub fn finish(self) -> Vec<i16> {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::StatusFlags;

    fn frame(ts: u32) -> AudioFrame {
        AudioFrame::new(ts, StatusFlags::default(), vec![0, 0])
    }

    /// 100 samples with every sample set to `value`.
    fn block(value: i16) -> AudioFrame {
        AudioFrame::from_samples(0, StatusFlags::default(), &[value; 100])
    }

    #[test]
    fn test_backlog_drops_newest_when_full() {
        let mut backlog = FrameBacklog::new(2);
        assert!(backlog.push(frame(1)));
        assert!(backlog.push(frame(2)));
        assert!(!backlog.push(frame(3)));
        assert_eq!(backlog.dropped(), 1);

        let timestamps: Vec<u32> = backlog.drain().iter().map(|f| f.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2]);
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_clear_keeps_drop_count() {
        let mut backlog = FrameBacklog::new(1);
        backlog.push(frame(1));
        backlog.push(frame(2));
        backlog.clear();
        assert_eq!(backlog.len(), 0);
        assert_eq!(backlog.dropped(), 1);
    }

    // 1kHz: every 100-sample block is 100ms
    #[test]
    fn test_silence_before_voice_is_bounded() {
        let mut buffer =
            UtteranceBuffer::new(1000, Duration::from_millis(200), Duration::from_secs(10));
        for _ in 0..10_000 {
            buffer.push(block(0), false);
            assert!(buffer.held_samples() <= 200);
        }
        assert!(!buffer.voice_heard());

        buffer.push(block(7), true);
        let samples = buffer.finish();
        // Lead-in of two silent blocks, then the voiced one
        assert_eq!(samples.len(), 300);
        assert!(samples[..200].iter().all(|s| *s == 0));
        assert!(samples[200..].iter().all(|s| *s == 7));
    }

    #[test]
    fn test_utterance_capped() {
        let mut buffer =
            UtteranceBuffer::new(1000, Duration::from_millis(100), Duration::from_millis(250));
        for _ in 0..5 {
            buffer.push(block(1), true);
        }
        assert!(buffer.truncated());
        assert_eq!(buffer.finish().len(), 250);
    }

    #[test]
    fn test_no_voice_yields_nothing() {
        let mut buffer =
            UtteranceBuffer::new(1000, Duration::from_millis(300), Duration::from_secs(1));
        buffer.push(block(0), false);
        assert_eq!(buffer.held_samples(), 100);
        assert!(buffer.finish().is_empty());
    }
}
