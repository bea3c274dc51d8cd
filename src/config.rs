//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (HOST, PORT, OPENAI_API_KEY, OPENAI_BASE_URL)
//! 2. Environment variables (APP_SERVER__PORT, APP_PIPELINE__VOICE_END_DEBOUNCE_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! ## Sections:
//! - **server**: Bind address
//! - **session**: Session limits and idle expiry
//! - **pipeline**: Turn detection, buffering, cancellation and history tunables
//! - **providers**: Which STT / LLM / TTS implementation each new session uses
//! - **websocket**: Heartbeat settings for the duplex connection

use crate::pipeline::PipelineSettings;
use crate::turn::TurnDetectorConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub pipeline: PipelineConfig,
    pub providers: ProvidersConfig,
    pub websocket: WebSocketConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of simultaneous conversations
    pub max_concurrent_sessions: usize,
    /// A session with no inbound activity for this long is closed
    pub idle_timeout_secs: u64,
    /// How often the idle sweeper runs
    pub cleanup_interval_secs: u64,
}

/// Pipeline tunables.
///
/// ## Policy constants:
/// `voice_end_debounce_ms` and `transcribing_buffer_frames` are deliberately
/// configuration rather than fixed behaviour; different microphones and
/// network conditions want different values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Sample rate of inbound and outbound PCM16 mono audio
    pub sample_rate: u32,
    /// Silence needed after speech before the user's turn is considered over
    pub voice_end_debounce_ms: u64,
    /// Normalized PCM energy above which a frame counts as voiced (0 disables)
    pub energy_threshold: f32,
    /// Whether sustained voice while the agent is thinking or speaking interrupts it
    pub barge_in_enabled: bool,
    /// Continuous voice needed to trigger a barge-in
    pub barge_in_min_voice_ms: u64,
    /// Frames kept while waiting for a final transcript
    pub transcribing_buffer_frames: usize,
    /// Inbound audio queue between the gateway and the orchestrator
    pub audio_channel_capacity: usize,
    /// Queue between stage tasks and the orchestrator
    pub stage_channel_capacity: usize,
    /// Queue between the orchestrator and the connection writer
    pub outbound_channel_capacity: usize,
    /// How long a cancelled stage may take before it is abandoned
    pub cancel_timeout_ms: u64,
    /// Deadline for a final transcript or the first LLM token
    pub response_timeout_ms: u64,
    /// Conversation history kept for the language model (messages, not turns)
    pub max_history_messages: usize,
    /// System prompt sent with every LLM request
    pub system_prompt: String,
}

/// Provider selection.
///
/// ## Provider names:
/// - `"scripted"`: Deterministic in-process providers for development and tests
/// - `"openai"`: Any OpenAI-compatible HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub stt: String,
    pub llm: String,
    pub tts: String,
    pub openai: OpenAiConfig,
    pub scripted: ScriptedConfig,
}

/// Settings for the OpenAI-compatible provider family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub transcription_model: String,
    pub speech_model: String,
    pub voice: String,
    #[serde(default)]
    pub language: Option<String>,
    pub request_timeout_secs: u64,
    /// Longest utterance uploaded for transcription; later audio is dropped
    pub max_utterance_secs: u64,
}

/// Settings for the scripted provider family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedConfig {
    /// Final transcript produced for every utterance
    pub transcript: String,
    /// Fixed reply; when absent the LLM echoes the prompt
    #[serde(default)]
    pub reply: Option<String>,
    /// Emit a partial transcript every N voiced frames (0 disables partials)
    pub partial_every_frames: usize,
    pub token_delay_ms: u64,
    pub frame_delay_ms: u64,
}

/// WebSocket heartbeat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    pub ping_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8000,
            },
            session: SessionConfig {
                max_concurrent_sessions: 32,
                idle_timeout_secs: 600,
                cleanup_interval_secs: 60,
            },
            pipeline: PipelineConfig::default(),
            providers: ProvidersConfig {
                stt: "scripted".to_string(),
                llm: "scripted".to_string(),
                tts: "scripted".to_string(),
                openai: OpenAiConfig {
                    api_key: None,
                    base_url: "https://api.openai.com/v1".to_string(),
                    chat_model: "gpt-4o-mini".to_string(),
                    transcription_model: "whisper-1".to_string(),
                    speech_model: "tts-1".to_string(),
                    voice: "alloy".to_string(),
                    language: None,
                    request_timeout_secs: 30,
                    max_utterance_secs: 60,
                },
                scripted: ScriptedConfig {
                    transcript: "hello there".to_string(),
                    reply: None,
                    partial_every_frames: 4,
                    token_delay_ms: 40,
                    frame_delay_ms: 20,
                },
            },
            websocket: WebSocketConfig {
                ping_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,             // 24kHz mono PCM16 on the wire
            voice_end_debounce_ms: 800,
            energy_threshold: 0.05,
            barge_in_enabled: true,
            barge_in_min_voice_ms: 300,
            transcribing_buffer_frames: 32,  // ~2.7s of audio at 2048 samples per frame
            audio_channel_capacity: 64,
            stage_channel_capacity: 64,
            outbound_channel_capacity: 256,
            cancel_timeout_ms: 500,
            response_timeout_ms: 30_000,
            max_history_messages: 20,
            system_prompt: "You are an intelligent voice assistant. Please provide concise, conversational answers."
                .to_string(),
        }
    }
}

impl PipelineConfig {
    /// Build the runtime settings a new session orchestrator is created with.
    pub fn to_pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            detector: self.to_detector_config(),
            barge_in_enabled: self.barge_in_enabled,
            transcribing_buffer_frames: self.transcribing_buffer_frames,
            audio_channel_capacity: self.audio_channel_capacity,
            stage_channel_capacity: self.stage_channel_capacity,
            outbound_channel_capacity: self.outbound_channel_capacity,
            cancel_timeout: Duration::from_millis(self.cancel_timeout_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            max_history_messages: self.max_history_messages,
            system_prompt: self.system_prompt.clone(),
        }
    }

    /// Build the turn detector tunables.
    pub fn to_detector_config(&self) -> TurnDetectorConfig {
        TurnDetectorConfig {
            sample_rate: self.sample_rate,
            voice_end_debounce: Duration::from_millis(self.voice_end_debounce_ms),
            energy_threshold: self.energy_threshold,
            barge_in_min_voice: Duration::from_millis(self.barge_in_min_voice_ms),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_PROVIDERS__LLM=openai`: Use the OpenAI-compatible language model
    /// - `APP_PIPELINE__VOICE_END_DEBOUNCE_MS=600`: Shorter end-of-speech debounce
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    /// - `OPENAI_API_KEY` / `OPENAI_BASE_URL`: Conventional OpenAI variables
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections so field names can keep their own underscores
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("providers.openai.api_key", key)?;
        }

        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            settings = settings.set_override("providers.openai.base_url", base_url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Session limits and intervals are non-zero
    /// - Channel capacities are non-zero (tokio panics on zero-capacity channels)
    /// - Provider names are known, and OpenAI providers have an API key
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.cleanup_interval_secs == 0 {
            return Err(anyhow::anyhow!("Session cleanup interval must be greater than 0"));
        }

        if self.pipeline.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.pipeline.audio_channel_capacity == 0
            || self.pipeline.stage_channel_capacity == 0
            || self.pipeline.outbound_channel_capacity == 0
        {
            return Err(anyhow::anyhow!("Pipeline channel capacities must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.pipeline.energy_threshold) {
            return Err(anyhow::anyhow!("Energy threshold must be between 0.0 and 1.0"));
        }

        if self.providers.openai.max_utterance_secs == 0 {
            return Err(anyhow::anyhow!("Max utterance length must be greater than 0"));
        }

        if self.websocket.ping_interval_secs == 0
            || self.websocket.client_timeout_secs <= self.websocket.ping_interval_secs
        {
            return Err(anyhow::anyhow!(
                "WebSocket client timeout must be longer than a non-zero ping interval"
            ));
        }

        for (stage, name) in [
            ("stt", &self.providers.stt),
            ("llm", &self.providers.llm),
            ("tts", &self.providers.tts),
        ] {
            match name.as_str() {
                "scripted" => {}
                "openai" => {
                    if self.providers.openai.api_key.as_deref().map_or(true, str::is_empty) {
                        return Err(anyhow::anyhow!(
                            "OpenAI API key missing: OPENAI_API_KEY required for {}",
                            stage
                        ));
                    }
                }
                other => {
                    return Err(anyhow::anyhow!("Unknown {} provider: {}", stage, other));
                }
            }
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed, for example
    /// `{"pipeline": {"voice_end_debounce_ms": 500}}`. Pipeline and provider
    /// changes apply to sessions created after the update.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} out of range", port))?;
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(max) = session.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.session.max_concurrent_sessions = max as usize;
            }
            if let Some(idle) = session.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.idle_timeout_secs = idle;
            }
        }

        if let Some(pipeline) = partial_config.get("pipeline") {
            if let Some(ms) = pipeline.get("voice_end_debounce_ms").and_then(|v| v.as_u64()) {
                self.pipeline.voice_end_debounce_ms = ms;
            }
            if let Some(threshold) = pipeline.get("energy_threshold").and_then(|v| v.as_f64()) {
                self.pipeline.energy_threshold = threshold as f32;
            }
            if let Some(enabled) = pipeline.get("barge_in_enabled").and_then(|v| v.as_bool()) {
                self.pipeline.barge_in_enabled = enabled;
            }
            if let Some(ms) = pipeline.get("barge_in_min_voice_ms").and_then(|v| v.as_u64()) {
                self.pipeline.barge_in_min_voice_ms = ms;
            }
            if let Some(frames) = pipeline.get("transcribing_buffer_frames").and_then(|v| v.as_u64()) {
                self.pipeline.transcribing_buffer_frames = frames as usize;
            }
            if let Some(ms) = pipeline.get("cancel_timeout_ms").and_then(|v| v.as_u64()) {
                self.pipeline.cancel_timeout_ms = ms;
            }
            if let Some(ms) = pipeline.get("response_timeout_ms").and_then(|v| v.as_u64()) {
                self.pipeline.response_timeout_ms = ms;
            }
            if let Some(prompt) = pipeline.get("system_prompt").and_then(|v| v.as_str()) {
                self.pipeline.system_prompt = prompt.to_string();
            }
        }

        if let Some(providers) = partial_config.get("providers") {
            if let Some(stt) = providers.get("stt").and_then(|v| v.as_str()) {
                self.providers.stt = stt.to_string();
            }
            if let Some(llm) = providers.get("llm").and_then(|v| v.as_str()) {
                self.providers.llm = llm.to_string();
            }
            if let Some(tts) = providers.get("tts").and_then(|v| v.as_str()) {
                self.providers.tts = tts.to_string();
            }
        }

        self.validate()?;
        Ok(())
    }

    /// JSON view of the configuration with secrets removed.
    pub fn redacted_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(key) = value.pointer_mut("/providers/openai/api_key") {
            if !key.is_null() {
                *key = serde_json::Value::String("***".to_string());
            }
        }
        value
    }
}
