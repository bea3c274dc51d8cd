//! # Scripted Providers
//!
//! Deterministic providers that run entirely in-process. They make the server usable with
//! no external services (`providers.* = "scripted"`) and act as the fakes in pipeline tests.
//!
//! ## Behaviour:
//! - **ScriptedStt**: a growing partial every N voiced frames, the configured transcript at end
//!   of input
//! - **ScriptedLlm**: a fixed reply (or an echo of the prompt), one word per token
//! - **ScriptedTts**: one 2048-sample frame per word of the segment
//!
//! Test hooks (`failing`, `with_cancel_delay`, ...) simulate provider errors and
//! providers that are slow to honour cancellation.

use crate::adapters::{
    AudioInput, ChatMessage, LlmProvider, LlmToken, StageStream, SttProvider, Transcript,
    TtsProvider,
};
use crate::audio::frame::NOMINAL_FRAME_SAMPLES;
use crate::audio::{AudioFrame, StatusFlags};
use crate::config::ScriptedConfig;
use crate::error::AdapterError;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::time::Duration;

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

// ---------------------------------------------------------------------------
// Speech-to-text
// ---------------------------------------------------------------------------

pub struct ScriptedStt {
    transcript: String,
    partial_every_frames: usize,
}

impl ScriptedStt {
    pub fn new(transcript: impl Into<String>, partial_every_frames: usize) -> Self {
        Self {
            transcript: transcript.into(),
            partial_every_frames,
        }
    }

    pub fn from_config(config: &ScriptedConfig) -> Self {
        Self::new(config.transcript.clone(), config.partial_every_frames)
    }
}

struct SttState {
    audio: AudioInput,
    words: Vec<String>,
    every: usize,
    frames: usize,
    partials: usize,
    done: bool,
}

#[async_trait]
impl SttProvider for ScriptedStt {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn start(&self, audio: AudioInput) -> Result<StageStream<Transcript>, AdapterError> {
        let state = SttState {
            audio,
            words: self.transcript.split_whitespace().map(str::to_string).collect(),
            every: self.partial_every_frames,
            frames: 0,
            partials: 0,
            done: false,
        };

        let stream = stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                match st.audio.next().await {
                    // Only frames the client flagged as voiced count towards partials
                    Some(frame) if !frame.status_flags.voice_energy() => {}
                    Some(_) => {
                        st.frames += 1;
                        if st.every > 0 && st.frames % st.every == 0 && st.partials < st.words.len() {
                            st.partials += 1;
                            let partial = st.words[..st.partials].join(" ");
                            return Some((Ok(Transcript::Partial(partial)), st));
                        }
                    }
                    None => {
                        st.done = true;
                        let text = st.words.join(" ");
                        return Some((Ok(Transcript::Final(text)), st));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

pub struct ScriptedLlm {
    reply: Option<String>,
    token_delay: Duration,
    fail_with: Option<String>,
}

impl ScriptedLlm {
    /// `reply = None` echoes the prompt back.
    pub fn new(reply: Option<String>) -> Self {
        Self {
            reply,
            token_delay: Duration::ZERO,
            fail_with: None,
        }
    }

    pub fn from_config(config: &ScriptedConfig) -> Self {
        Self::new(config.reply.clone()).with_token_delay(Duration::from_millis(config.token_delay_ms))
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Every job fails with a provider error instead of producing tokens.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn start(
        &self,
        prompt: String,
        _history: Vec<ChatMessage>,
    ) -> Result<StageStream<LlmToken>, AdapterError> {
        let delay = self.token_delay;

        if let Some(message) = self.fail_with.clone() {
            let failure = async move {
                pause(delay).await;
                Err::<LlmToken, _>(AdapterError::Provider(message))
            };
            return Ok(stream::once(failure).boxed());
        }

        let reply = self
            .reply
            .clone()
            .unwrap_or_else(|| format!("You said: {}", prompt));
        let words: Vec<String> = reply.split_whitespace().map(str::to_string).collect();
        let last = words.len().saturating_sub(1);

        let tokens = stream::iter(words.into_iter().enumerate())
            .then(move |(i, word)| async move {
                pause(delay).await;
                let text = if i == last { word } else { format!("{} ", word) };
                Ok(LlmToken::text(text))
            })
            .chain(stream::once(async { Ok(LlmToken::done()) }));

        Ok(tokens.boxed())
    }
}

// ---------------------------------------------------------------------------
// Speech synthesis
// ---------------------------------------------------------------------------

pub struct ScriptedTts {
    frame_delay: Duration,
    cancel_delay: Duration,
}

impl ScriptedTts {
    pub fn new() -> Self {
        Self {
            frame_delay: Duration::ZERO,
            cancel_delay: Duration::ZERO,
        }
    }

    pub fn from_config(config: &ScriptedConfig) -> Self {
        Self::new().with_frame_delay(Duration::from_millis(config.frame_delay_ms))
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Make `cancel()` take this long, as a remote synthesizer might.
    pub fn with_cancel_delay(mut self, delay: Duration) -> Self {
        self.cancel_delay = delay;
        self
    }
}

impl Default for ScriptedTts {
    fn default() -> Self {
        Self::new()
    }
}

/// A quiet sawtooth so scripted audio is audible but unmistakably synthetic.
fn tone_frame(index: u32, word_len: usize) -> AudioFrame {
    let period = 32 + (word_len % 8) * 8;
    let samples: Vec<i16> = (0..NOMINAL_FRAME_SAMPLES)
        .map(|i| ((i % period) as i16 - period as i16 / 2) * 64)
        .collect();
    AudioFrame::from_samples(index, StatusFlags::default(), &samples)
}

#[async_trait]
impl TtsProvider for ScriptedTts {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn synthesize(&self, text: String) -> Result<StageStream<AudioFrame>, AdapterError> {
        let delay = self.frame_delay;
        let words: Vec<usize> = text.split_whitespace().map(str::len).collect();

        let frames = stream::iter(words.into_iter().enumerate()).then(move |(i, len)| async move {
            pause(delay).await;
            Ok(tone_frame(i as u32, len))
        });

        Ok(frames.boxed())
    }

    async fn cancel(&self) {
        pause(self.cancel_delay).await;
    }
}
