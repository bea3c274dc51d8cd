//! # Voice Sessions
//!
//! A session is one WebSocket connection's conversation. The connection talks to it through a
//! [`SessionHandle`]: control commands and audio frames go in, a [`SessionSnapshot`] can be read
//! at any time, and outbound traffic comes back on the receiver returned at creation.
//!
//! ## Key Rust Concepts:
//! - **watch channel**: The pipeline publishes its latest snapshot; readers never block it
//! - **Atomics**: `last_activity` is updated from the connection without a lock
//! - **try_send**: Audio is never awaited on, a full queue drops the frame instead

pub mod registry;

pub use registry::SessionRegistry;

use crate::audio::AudioFrame;
use crate::error::FrameError;
use crate::pipeline::{ControlMessage, PipelineCommand, PipelineHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Where a session is in its conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Not started, or stopped
    #[default]
    Idle,
    /// Streaming audio into speech-to-text
    Listening,
    /// Voice ended, waiting for the final transcript
    Transcribing,
    /// Waiting for the first token of the reply
    Thinking,
    /// Reply is being synthesized and streamed out
    Speaking,
    /// Tearing the current reply down
    Interrupting,
}

/// Point-in-time view of a session, published by its pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: TurnState,
    /// Audio frames received
    pub inbound_seq: u64,
    /// Transcripts and audio frames sent
    pub outbound_seq: u64,
    pub turns_completed: u64,
}

/// Session summary for the management API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub providers: String,
    pub idle_seconds: u64,
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
}

/// The connection's side of a running session.
pub struct SessionHandle {
    pub id: String,
    pub created_at: DateTime<Utc>,
    providers: String,
    commands: mpsc::UnboundedSender<PipelineCommand>,
    audio: mpsc::Sender<AudioFrame>,
    snapshot: watch::Receiver<SessionSnapshot>,
    /// Unix millis of the last inbound message
    last_activity: AtomicI64,
}

impl SessionHandle {
    pub fn new(id: String, providers: String, pipeline: PipelineHandle) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            providers,
            commands: pipeline.commands,
            audio: pipeline.audio,
            snapshot: pipeline.snapshot,
            last_activity: AtomicI64::new(now.timestamp_millis()),
        }
    }

    /// Queue a control command. Never blocks; the pipeline handles it before pending audio.
    pub fn handle_control(&self, message: ControlMessage) {
        self.touch();
        if self.commands.send(PipelineCommand::Control(message)).is_err() {
            debug!(session_id = %self.id, "Pipeline gone, control message dropped");
        }
    }

    /// Queue an inbound audio frame, dropping it if the pipeline is behind.
    pub fn handle_inbound_audio(&self, frame: AudioFrame) {
        self.touch();
        match self.audio.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.id, "Inbound audio queue full, dropping frame")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.id, "Pipeline gone, audio frame dropped")
            }
        }
    }

    /// Decode a binary WebSocket message and forward it. Malformed frames are rejected
    /// without affecting the session.
    pub fn handle_binary(&self, data: &[u8]) -> Result<(), FrameError> {
        let frame = AudioFrame::decode(data)?;
        self.handle_inbound_audio(frame);
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            created_at: self.created_at,
            providers: self.providers.clone(),
            idle_seconds: self.idle_for().as_secs(),
            snapshot: self.snapshot(),
        }
    }

    /// Ask the pipeline to cancel everything and exit.
    pub fn shutdown(&self) {
        let _ = self.commands.send(PipelineCommand::Shutdown);
    }

    /// Time since the last inbound message.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}
