//! # Turn Detector
//!
//! A debounced voice-activity edge detector. It watches inbound frames and reports when the
//! user's voice starts and when their turn is over.
//!
//! ## Voice Decision (per frame):
//! - Mic-muted frames are always silence
//! - The client's voice-energy flag marks the frame as voiced
//! - Otherwise, if `energy_threshold > 0`, the PCM energy of the frame is compared to it
//!
//! ## Debounce:
//! Silence is measured in audio time (payload samples / sample rate), not wall-clock time,
//! so a burst of delayed frames is judged the same as frames that arrived on schedule.
//! Voice-end fires once silence has lasted `voice_end_debounce` after voice was heard.
//! Any voiced frame resets the silence count.

use crate::audio::{pcm, AudioFrame};
use std::time::Duration;

/// Tunables for the turn detector.
#[derive(Debug, Clone)]
pub struct TurnDetectorConfig {
    pub sample_rate: u32,
    pub voice_end_debounce: Duration,
    /// Normalized energy threshold, 0 disables the energy check
    pub energy_threshold: f32,
    /// Continuous voice needed before `sustained_voice` reports true
    pub barge_in_min_voice: Duration,
}

/// Edges reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    VoiceStart,
    VoiceEnd,
}

#[derive(Debug)]
pub struct TurnDetector {
    config: TurnDetectorConfig,
    /// Voice was heard since the last voice-end
    armed: bool,
    /// The previous frame was voiced
    in_voice: bool,
    silence: Duration,
    voice_run: Duration,
}

impl TurnDetector {
    pub fn new(config: TurnDetectorConfig) -> Self {
        Self {
            config,
            armed: false,
            in_voice: false,
            silence: Duration::ZERO,
            voice_run: Duration::ZERO,
        }
    }

    /// Feed one frame and return the edge it produced, if any.
    pub fn observe(&mut self, frame: &AudioFrame) -> Option<TurnEvent> {
        let duration = frame.duration(self.config.sample_rate);

        if self.is_voiced(frame) {
            self.silence = Duration::ZERO;
            self.voice_run += duration;
            self.armed = true;
            if !self.in_voice {
                self.in_voice = true;
                return Some(TurnEvent::VoiceStart);
            }
            return None;
        }

        self.in_voice = false;
        self.voice_run = Duration::ZERO;

        if !self.armed {
            return None;
        }

        self.silence += duration;
        if self.silence >= self.config.voice_end_debounce {
            self.armed = false;
            self.silence = Duration::ZERO;
            return Some(TurnEvent::VoiceEnd);
        }
        None
    }

    /// A partial transcript proves the user spoke even if no frame was flagged as voiced.
    pub fn observe_partial(&mut self) {
        self.armed = true;
    }

    /// True while voice has been continuously present for at least `barge_in_min_voice`.
    pub fn sustained_voice(&self) -> bool {
        self.in_voice && self.voice_run >= self.config.barge_in_min_voice
    }

    pub fn reset(&mut self) {
        self.armed = false;
        self.in_voice = false;
        self.silence = Duration::ZERO;
        self.voice_run = Duration::ZERO;
    }

    fn is_voiced(&self, frame: &AudioFrame) -> bool {
        is_voiced(frame, self.config.energy_threshold)
    }
}

/// Per-frame voice decision shared by the detector and utterance collection.
pub fn is_voiced(frame: &AudioFrame, energy_threshold: f32) -> bool {
    let flags = frame.status_flags;
    if flags.mic_muted() {
        return false;
    }
    if flags.voice_energy() {
        return true;
    }
    energy_threshold > 0.0 && pcm::normalized_energy(&frame.payload) > energy_threshold
}
