//! # Streaming Adapters
//!
//! The three provider capabilities the pipeline drives: speech-to-text, the language model
//! and speech synthesis. Each one is "start a streaming job, receive incremental results,
//! cancel". Concrete providers live in submodules and are chosen by name when a session
//! is created.
//!
//! ## Provider Families:
//! - **scripted**: Deterministic in-process providers for development and tests
//! - **openai**: OpenAI-compatible HTTP APIs
//!
//! ## Key Rust Concepts:
//! - **async_trait**: Async methods on object-safe traits (`Arc<dyn SttProvider>`)
//! - **BoxStream**: A heap-allocated, type-erased `Stream` that can cross task boundaries
//! - **Default trait methods**: `cancel()` is a no-op unless a provider has remote work to abort

pub mod openai;
pub mod scripted;

use crate::audio::AudioFrame;
use crate::config::AppConfig;
use crate::error::AdapterError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;

/// Results streamed back from a provider job.
pub type StageStream<T> = BoxStream<'static, Result<T, AdapterError>>;

/// Audio handed to a speech-to-text job. The end of this stream means "end of input".
pub type AudioInput = BoxStream<'static, AudioFrame>;

/// Incremental speech-to-text result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transcript {
    /// Provisional text, may still change
    Partial(String),
    /// Stable text for the whole utterance
    Final(String),
}

/// One streamed piece of a language model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmToken {
    pub text: String,
    /// Set on the last item of the reply
    pub done: bool,
}

impl LlmToken {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            text: String::new(),
            done: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Speech-to-text capability.
///
/// A job yields zero or more partials followed by exactly one final, unless it is cancelled.
#[async_trait]
pub trait SttProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self, audio: AudioInput) -> Result<StageStream<Transcript>, AdapterError>;

    /// Abort remote work. Idempotent; may race with production.
    async fn cancel(&self) {}
}

/// Language model capability.
///
/// `history` is everything before `prompt`, system prompt included.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(
        &self,
        prompt: String,
        history: Vec<ChatMessage>,
    ) -> Result<StageStream<LlmToken>, AdapterError>;

    async fn cancel(&self) {}
}

/// Speech synthesis capability. One call per text segment.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn synthesize(&self, text: String) -> Result<StageStream<AudioFrame>, AdapterError>;

    async fn cancel(&self) {}
}

/// The provider set a session is constructed with.
#[derive(Clone)]
pub struct Providers {
    pub stt: Arc<dyn SttProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
}

impl Providers {
    /// Select providers by the names in `providers.stt`, `providers.llm` and `providers.tts`.
    pub fn from_config(config: &AppConfig) -> Result<Self, AdapterError> {
        let providers = &config.providers;
        let sample_rate = config.pipeline.sample_rate;

        // Only build an HTTP client when an OpenAI provider is actually selected
        let uses_openai = [&providers.stt, &providers.llm, &providers.tts]
            .iter()
            .any(|name| name.as_str() == "openai");
        let client = if uses_openai {
            Some(openai::OpenAiClient::new(&providers.openai)?)
        } else {
            None
        };
        let openai_client = || {
            client
                .clone()
                .ok_or_else(|| AdapterError::Configuration("OpenAI client unavailable".into()))
        };

        let scripted = &providers.scripted;

        let stt: Arc<dyn SttProvider> = match providers.stt.as_str() {
            "scripted" => Arc::new(scripted::ScriptedStt::from_config(scripted)),
            "openai" => Arc::new(openai::OpenAiStt::new(
                openai_client()?,
                &providers.openai,
                &config.pipeline,
            )),
            other => return Err(unknown("stt", other)),
        };

        let llm: Arc<dyn LlmProvider> = match providers.llm.as_str() {
            "scripted" => Arc::new(scripted::ScriptedLlm::from_config(scripted)),
            "openai" => Arc::new(openai::OpenAiLlm::new(openai_client()?, &providers.openai)),
            other => return Err(unknown("llm", other)),
        };

        let tts: Arc<dyn TtsProvider> = match providers.tts.as_str() {
            "scripted" => Arc::new(scripted::ScriptedTts::from_config(scripted)),
            "openai" => Arc::new(openai::OpenAiTts::new(
                openai_client()?,
                &providers.openai,
                sample_rate,
            )),
            other => return Err(unknown("tts", other)),
        };

        Ok(Self { stt, llm, tts })
    }

    /// Provider names, for logs and the session inspection endpoints.
    pub fn describe(&self) -> String {
        format!(
            "stt={} llm={} tts={}",
            self.stt.name(),
            self.llm.name(),
            self.tts.name()
        )
    }
}

fn unknown(stage: &str, name: &str) -> AdapterError {
    AdapterError::Configuration(format!("unknown {} provider '{}'", stage, name))
}
