//! # Session Pipeline
//!
//! The per-session coordinator that turns microphone audio into spoken replies.
//!
//! ## Data Flow:
//! ```text
//! inbound frames ──► turn detector ──► STT stage ──(final)──► LLM stage ──► TTS stage ──► outbound
//!        ▲                                                                             │
//! control messages ──► orchestrator (owns the turn state, preempts any stage) ◄────────┘
//! ```
//!
//! ## Modules:
//! - **events**: JSON control messages and server events
//! - **outbound**: Ordered event/audio queue towards the connection, with flush generations
//! - **stage**: Stage runner, handles, epochs and bounded teardown
//! - **orchestrator**: The turn state machine

pub mod events;
pub mod orchestrator;
pub mod outbound;
pub mod stage;

pub use events::{parse_control, ControlMessage, ServerEvent};
pub use orchestrator::{spawn_pipeline, PipelineCommand, PipelineHandle};
pub use outbound::{Outbound, OutboundReceiver};

use crate::turn::TurnDetectorConfig;
use std::time::Duration;

/// Runtime settings a session pipeline is created with.
///
/// Built from `PipelineConfig::to_pipeline_settings`; later configuration updates do not
/// affect sessions that already exist.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub detector: TurnDetectorConfig,
    pub barge_in_enabled: bool,
    pub transcribing_buffer_frames: usize,
    pub audio_channel_capacity: usize,
    pub stage_channel_capacity: usize,
    pub outbound_channel_capacity: usize,
    pub cancel_timeout: Duration,
    pub response_timeout: Duration,
    pub max_history_messages: usize,
    pub system_prompt: String,
}
