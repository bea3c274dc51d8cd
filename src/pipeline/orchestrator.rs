//! # Pipeline Orchestrator
//!
//! One tokio task per session. It is the only consumer of the session's inputs (control
//! commands, inbound audio, stage results) and the only writer of the turn state, so every
//! transition happens in one place and in one order.
//!
//! ## Turn State Machine:
//! | From | Trigger | To |
//! |---|---|---|
//! | Idle | `start` | Listening |
//! | Listening | voice end | Transcribing |
//! | Listening / Transcribing | final transcript | Thinking |
//! | Thinking | first token | Speaking |
//! | Speaking | speech finished | Listening |
//! | any non-Idle | `interrupt` / barge-in | Interrupting → Listening |
//! | any | `stop` / `reset` / stage failure | Idle |
//!
//! ## Input Priority:
//! The main loop polls with `biased;` in this order: control commands, stage results,
//! inbound audio, the response deadline. A `stop` or `interrupt` is therefore handled
//! before any audio or stage output that is already queued.

use crate::adapters::{ChatMessage, LlmToken, Providers, Role, Transcript};
use crate::audio::{AudioFrame, FrameBacklog};
use crate::error::AdapterError;
use crate::pipeline::events::{ControlMessage, ServerEvent, SessionStatus};
use crate::pipeline::outbound::{self, OutboundReceiver, OutboundSink};
use crate::pipeline::stage::{
    self, SpeechChunk, StageEvent, StageHandle, StageKind, StagePayload, Teardown,
};
use crate::pipeline::PipelineSettings;
use crate::session::{SessionSnapshot, TurnState};
use crate::text::SentenceSplitter;
use crate::turn::{TurnDetector, TurnEvent};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Format tag announced in `tts_start`.
const TTS_FORMAT: &str = "pcm";

/// Commands accepted by a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineCommand {
    Control(ControlMessage),
    /// Cancel everything and end the task
    Shutdown,
}

/// Senders and observers of a running pipeline.
pub struct PipelineHandle {
    pub commands: mpsc::UnboundedSender<PipelineCommand>,
    pub audio: mpsc::Sender<AudioFrame>,
    pub snapshot: watch::Receiver<SessionSnapshot>,
    pub task: JoinHandle<()>,
}

/// Spawn the orchestrator task for a new session.
pub fn spawn_pipeline(
    session_id: String,
    settings: PipelineSettings,
    providers: Providers,
) -> (PipelineHandle, OutboundReceiver) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (audio_tx, audio_rx) = mpsc::channel(settings.audio_channel_capacity);
    let (stage_tx, stage_rx) = mpsc::channel(settings.stage_channel_capacity);
    let (sink, outbound_rx) = outbound::channel(settings.outbound_channel_capacity);
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

    let orchestrator = Orchestrator {
        detector: TurnDetector::new(settings.detector.clone()),
        backlog: FrameBacklog::new(settings.transcribing_buffer_frames),
        session_id,
        settings,
        providers,
        outbound: sink,
        snapshot: snapshot_tx,
        stage_tx,
        state: TurnState::Idle,
        stt: None,
        llm: None,
        tts: None,
        next_epoch: 0,
        deadline: None,
        inbound_seq: 0,
        outbound_seq: 0,
        turns_completed: 0,
        history: VecDeque::new(),
        reply: Reply::default(),
    };

    let task = tokio::spawn(orchestrator.run(command_rx, audio_rx, stage_rx));

    (
        PipelineHandle {
            commands: command_tx,
            audio: audio_tx,
            snapshot: snapshot_rx,
            task,
        },
        outbound_rx,
    )
}

/// The reply currently being generated.
#[derive(Default)]
struct Reply {
    text: String,
    splitter: SentenceSplitter,
    /// The language model has finished (or was cut off)
    complete: bool,
}

struct Orchestrator {
    session_id: String,
    settings: PipelineSettings,
    providers: Providers,
    outbound: OutboundSink,
    snapshot: watch::Sender<SessionSnapshot>,
    stage_tx: mpsc::Sender<StageEvent>,

    state: TurnState,
    detector: TurnDetector,
    backlog: FrameBacklog,
    stt: Option<StageHandle<mpsc::Sender<AudioFrame>>>,
    llm: Option<StageHandle>,
    tts: Option<StageHandle<mpsc::UnboundedSender<String>>>,
    next_epoch: u64,
    deadline: Option<Instant>,

    inbound_seq: u64,
    outbound_seq: u64,
    turns_completed: u64,
    history: VecDeque<ChatMessage>,
    reply: Reply,
}

/// Shut a stage down (if present), logging abandonment.
async fn teardown<I>(
    session_id: &str,
    handle: Option<StageHandle<I>>,
    timeout: Duration,
) -> Teardown {
    let Some(handle) = handle else {
        return Teardown::Confirmed;
    };
    let (kind, epoch) = (handle.kind, handle.epoch);
    let outcome = handle.shutdown(timeout).await;
    if outcome == Teardown::Abandoned {
        warn!(
            session_id,
            stage = %kind,
            epoch,
            "Stage did not stop within {:?}, abandoned",
            timeout
        );
    }
    outcome
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Orchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PipelineCommand>,
        mut audio: mpsc::Receiver<AudioFrame>,
        mut stage_events: mpsc::Receiver<StageEvent>,
    ) {
        info!(session_id = %self.session_id, providers = %self.providers.describe(), "Pipeline started");

        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(PipelineCommand::Control(message)) => self.handle_control(message).await,
                    Some(PipelineCommand::Shutdown) | None => break,
                },
                Some(event) = stage_events.recv() => self.handle_stage_event(event).await,
                Some(frame) = audio.recv() => self.handle_audio(frame).await,
                _ = sleep_until(deadline) => self.handle_deadline().await,
            }

            if self.outbound.is_closed() {
                debug!(session_id = %self.session_id, "Connection gone, ending pipeline");
                break;
            }
            self.publish();
        }

        self.cancel_all().await;
        self.state = TurnState::Idle;
        self.publish();
        info!(
            session_id = %self.session_id,
            turns = self.turns_completed,
            "Pipeline stopped"
        );
    }

    // ----- control -------------------------------------------------------

    async fn handle_control(&mut self, message: ControlMessage) {
        info!(session_id = %self.session_id, command = ?message, state = ?self.state, "Control message");

        match message {
            ControlMessage::Start => {
                if self.state == TurnState::Idle {
                    self.open_listening(true).await;
                } else {
                    self.send_status(SessionStatus::Listening).await;
                }
            }
            ControlMessage::Stop => self.stop(false).await,
            ControlMessage::Reset => self.stop(true).await,
            ControlMessage::Interrupt => {
                if self.state == TurnState::Idle {
                    let event = ServerEvent::InterruptAcknowledged {
                        session_id: self.session_id.clone(),
                    };
                    self.send(event).await;
                } else {
                    self.interrupt().await;
                }
            }
        }
    }

    /// `stop` and `reset`: everything back to Idle.
    async fn stop(&mut self, reset: bool) {
        let confirmed = self.cancel_all().await;
        self.clear_turn();
        self.state = TurnState::Idle;

        if reset {
            self.inbound_seq = 0;
            self.outbound_seq = 0;
            self.turns_completed = 0;
            self.history.clear();
        }

        self.send_status(SessionStatus::Stopped).await;
        if !reset {
            if !confirmed {
                warn!(session_id = %self.session_id, "Stop acknowledged with abandoned stages");
            }
            let event = ServerEvent::StopAcknowledged {
                session_id: self.session_id.clone(),
                message: "All processing stopped".to_string(),
                queues_cleared: true,
            };
            self.send(event).await;
        }
    }

    /// Cut the agent off and go back to listening.
    async fn interrupt(&mut self) {
        info!(session_id = %self.session_id, from = ?self.state, "Interrupting");
        self.state = TurnState::Interrupting;
        self.publish();

        // Speech first, so nothing more is queued once tts_stop is sent
        let tts = self.tts.take();
        teardown(&self.session_id, tts, self.settings.cancel_timeout).await;
        self.outbound.discard_pending_audio();
        let event = ServerEvent::TtsStop {
            session_id: self.session_id.clone(),
        };
        self.send(event).await;

        let (llm, stt) = (self.llm.take(), self.stt.take());
        let timeout = self.settings.cancel_timeout;
        tokio::join!(
            teardown(&self.session_id, llm, timeout),
            teardown(&self.session_id, stt, timeout)
        );

        // Keep what the user actually heard so the history stays alternating
        if !self.reply.complete && !self.reply.text.trim().is_empty() {
            let partial = self.reply.text.trim().to_string();
            self.push_history(ChatMessage::new(Role::Assistant, partial));
        }
        self.reply = Reply::default();
        self.deadline = None;

        let event = ServerEvent::InterruptAcknowledged {
            session_id: self.session_id.clone(),
        };
        self.send(event).await;
        self.open_listening(false).await;
    }

    // ----- audio ---------------------------------------------------------

    async fn handle_audio(&mut self, frame: AudioFrame) {
        self.inbound_seq += 1;

        match self.state {
            TurnState::Listening => self.listen(frame),
            TurnState::Transcribing => {
                if !self.backlog.push(frame) {
                    debug!(
                        session_id = %self.session_id,
                        dropped = self.backlog.dropped(),
                        "Transcribing backlog full, dropping frame"
                    );
                }
            }
            TurnState::Thinking | TurnState::Speaking => {
                if !self.settings.barge_in_enabled {
                    return;
                }
                self.detector.observe(&frame);
                if self.detector.sustained_voice() {
                    info!(session_id = %self.session_id, "Sustained voice while responding, barging in");
                    self.interrupt().await;
                }
            }
            TurnState::Idle | TurnState::Interrupting => {}
        }
    }

    /// Forward a frame to speech-to-text and watch for the end of the utterance.
    fn listen(&mut self, frame: AudioFrame) {
        let edge = self.detector.observe(&frame);

        if let Some(input) = self.stt.as_ref().and_then(|stt| stt.input()) {
            match input.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(session_id = %self.session_id, "Speech-to-text input full, dropping frame")
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %self.session_id, "Speech-to-text input closed")
                }
            }
        }

        match edge {
            Some(TurnEvent::VoiceStart) => debug!(session_id = %self.session_id, "Voice start"),
            Some(TurnEvent::VoiceEnd) => {
                debug!(session_id = %self.session_id, "Voice end, awaiting final transcript");
                if let Some(stt) = self.stt.as_mut() {
                    stt.close_input();
                }
                self.state = TurnState::Transcribing;
                self.deadline = Some(Instant::now() + self.settings.response_timeout);
            }
            None => {}
        }
    }

    // ----- stage results -------------------------------------------------

    fn is_current(&self, kind: StageKind, epoch: u64) -> bool {
        let current = match kind {
            StageKind::Stt => self.stt.as_ref().map(|h| h.epoch),
            StageKind::Llm => self.llm.as_ref().map(|h| h.epoch),
            StageKind::Tts => self.tts.as_ref().map(|h| h.epoch),
        };
        current == Some(epoch)
    }

    async fn handle_stage_event(&mut self, event: StageEvent) {
        if !self.is_current(event.kind, event.epoch) {
            debug!(
                session_id = %self.session_id,
                stage = %event.kind,
                epoch = event.epoch,
                "Dropping result from stale stage"
            );
            return;
        }

        match event.payload {
            StagePayload::Failed(err) => self.fail_turn(event.kind, err).await,
            StagePayload::Transcript(Transcript::Partial(text)) => self.on_partial(text).await,
            StagePayload::Transcript(Transcript::Final(text)) => self.on_final(text).await,
            StagePayload::Token(token) => self.on_token(token).await,
            StagePayload::Speech(chunk) => self.on_speech(chunk).await,
            StagePayload::Finished => match event.kind {
                StageKind::Stt => {
                    let err = AdapterError::Provider("stream ended without a final transcript".into());
                    self.fail_turn(StageKind::Stt, err).await;
                }
                StageKind::Llm => self.finish_reply().await,
                StageKind::Tts => self.on_speech_finished().await,
            },
        }
    }

    async fn on_partial(&mut self, text: String) {
        if !matches!(self.state, TurnState::Listening | TurnState::Transcribing) {
            return;
        }
        self.detector.observe_partial();
        self.outbound_seq += 1;
        let event = ServerEvent::PartialTranscript {
            session_id: self.session_id.clone(),
            content: text,
            seq: self.outbound_seq,
        };
        self.send(event).await;
    }

    async fn on_final(&mut self, text: String) {
        if !matches!(self.state, TurnState::Listening | TurnState::Transcribing) {
            return;
        }

        let stt = self.stt.take();
        teardown(&self.session_id, stt, self.settings.cancel_timeout).await;
        self.deadline = None;

        let text = text.trim().to_string();
        if text.is_empty() {
            debug!(session_id = %self.session_id, "Empty final transcript, listening again");
            self.open_listening(false).await;
            return;
        }

        info!(session_id = %self.session_id, transcript = %text, "Final transcript");
        self.outbound_seq += 1;
        let event = ServerEvent::FinalTranscript {
            session_id: self.session_id.clone(),
            content: text.clone(),
            seq: self.outbound_seq,
        };
        self.send(event).await;
        let event = ServerEvent::LlmStatus {
            session_id: self.session_id.clone(),
            status: "processing".to_string(),
        };
        self.send(event).await;

        // Audio heard while transcribing predates the reply
        if !self.backlog.is_empty() {
            debug!(
                session_id = %self.session_id,
                frames = self.backlog.len(),
                "Discarding transcribing backlog"
            );
            self.backlog.clear();
        }

        let history = self.llm_history();
        self.push_history(ChatMessage::new(Role::User, text.clone()));
        self.reply = Reply::default();
        self.detector.reset();

        let previous = self.llm.take();
        teardown(&self.session_id, previous, self.settings.cancel_timeout).await;
        let epoch = self.next_epoch();
        self.llm = Some(stage::spawn_llm(
            self.providers.llm.clone(),
            epoch,
            self.stage_tx.clone(),
            text,
            history,
        ));
        self.state = TurnState::Thinking;
        self.deadline = Some(Instant::now() + self.settings.response_timeout);
    }

    async fn on_token(&mut self, token: LlmToken) {
        if !matches!(self.state, TurnState::Thinking | TurnState::Speaking) || self.reply.complete {
            return;
        }

        if !token.text.is_empty() {
            if self.state == TurnState::Thinking {
                self.state = TurnState::Speaking;
                self.deadline = None;
                let previous = self.tts.take();
                teardown(&self.session_id, previous, self.settings.cancel_timeout).await;
                let epoch = self.next_epoch();
                self.tts = Some(stage::spawn_tts(
                    self.providers.tts.clone(),
                    epoch,
                    self.stage_tx.clone(),
                ));
            }

            self.reply.text.push_str(&token.text);
            let event = ServerEvent::Subtitle {
                session_id: self.session_id.clone(),
                content: self.reply.text.clone(),
                is_complete: false,
            };
            self.send(event).await;

            let segments = self.reply.splitter.push(&token.text);
            self.queue_speech(segments).await;

            let event = ServerEvent::LlmResponse {
                session_id: self.session_id.clone(),
                content: self.reply.text.clone(),
                is_complete: false,
            };
            self.send(event).await;
        }

        if token.done {
            self.finish_reply().await;
        }
    }

    /// Caption each finished sentence and hand it to speech synthesis.
    async fn queue_speech(&self, segments: Vec<String>) {
        for segment in segments {
            let event = ServerEvent::Subtitle {
                session_id: self.session_id.clone(),
                content: segment.clone(),
                is_complete: true,
            };
            self.send(event).await;

            let Some(input) = self.tts.as_ref().and_then(|tts| tts.input()) else {
                continue;
            };
            if input.send(segment).is_err() {
                debug!(session_id = %self.session_id, "Speech synthesis input closed");
            }
        }
    }

    async fn finish_reply(&mut self) {
        if self.reply.complete || !matches!(self.state, TurnState::Thinking | TurnState::Speaking) {
            return;
        }
        self.reply.complete = true;

        let llm = self.llm.take();
        teardown(&self.session_id, llm, self.settings.cancel_timeout).await;

        if let Some(rest) = self.reply.splitter.flush() {
            self.queue_speech(vec![rest]).await;
        }

        let full = self.reply.text.trim().to_string();
        let event = ServerEvent::LlmResponse {
            session_id: self.session_id.clone(),
            content: full.clone(),
            is_complete: true,
        };
        self.send(event).await;
        if !full.is_empty() {
            self.push_history(ChatMessage::new(Role::Assistant, full));
        }

        match self.tts.as_mut() {
            // Speech finishes once the queued segments are spoken
            Some(tts) => tts.close_input(),
            None => {
                debug!(session_id = %self.session_id, "Empty reply, nothing to speak");
                self.turns_completed += 1;
                self.open_listening(true).await;
            }
        }
    }

    async fn on_speech(&mut self, chunk: SpeechChunk) {
        if self.state != TurnState::Speaking {
            return;
        }

        match chunk {
            SpeechChunk::SegmentStarted { text, is_first } => {
                let event = ServerEvent::TtsStart {
                    session_id: self.session_id.clone(),
                    format: TTS_FORMAT.to_string(),
                    is_first,
                    text,
                };
                self.send(event).await;
            }
            SpeechChunk::Audio(frame) => {
                self.outbound_seq += 1;
                if !self.outbound.audio(frame.payload).await {
                    debug!(session_id = %self.session_id, "Outbound closed while sending audio");
                }
            }
            SpeechChunk::SegmentFinished => {
                let event = ServerEvent::TtsEnd {
                    session_id: self.session_id.clone(),
                };
                self.send(event).await;
            }
        }
    }

    async fn on_speech_finished(&mut self) {
        if self.state != TurnState::Speaking {
            return;
        }
        let tts = self.tts.take();
        teardown(&self.session_id, tts, self.settings.cancel_timeout).await;

        self.turns_completed += 1;
        info!(session_id = %self.session_id, turns = self.turns_completed, "Turn complete");
        self.open_listening(true).await;
    }

    // ----- failures ------------------------------------------------------

    async fn handle_deadline(&mut self) {
        self.deadline = None;
        let kind = match self.state {
            TurnState::Transcribing => StageKind::Stt,
            TurnState::Thinking => StageKind::Llm,
            _ => return,
        };
        self.fail_turn(kind, AdapterError::Timeout(format!("{} response", kind)))
            .await;
    }

    /// Abort the turn after a stage error: cancel everything, report once, go Idle.
    async fn fail_turn(&mut self, kind: StageKind, err: AdapterError) {
        warn!(session_id = %self.session_id, stage = %kind, error = %err, "Stage failed, aborting turn");

        self.cancel_all().await;
        self.clear_turn();
        self.state = TurnState::Idle;

        let event = ServerEvent::Error {
            session_id: self.session_id.clone(),
            message: format!("{} error: {}", kind, err),
        };
        self.send(event).await;
    }

    // ----- helpers -------------------------------------------------------

    /// Start a fresh speech-to-text stage and replay audio still buffered from transcribing.
    async fn open_listening(&mut self, announce: bool) {
        let previous = self.stt.take();
        teardown(&self.session_id, previous, self.settings.cancel_timeout).await;

        self.detector.reset();
        self.deadline = None;
        self.state = TurnState::Listening;

        let epoch = self.next_epoch();
        self.stt = Some(stage::spawn_stt(
            self.providers.stt.clone(),
            epoch,
            self.stage_tx.clone(),
            self.settings.audio_channel_capacity,
        ));

        if announce {
            self.send_status(SessionStatus::Listening).await;
        }

        let buffered = self.backlog.drain();
        if !buffered.is_empty() {
            debug!(session_id = %self.session_id, frames = buffered.len(), "Replaying buffered audio");
        }
        for frame in buffered {
            if self.state == TurnState::Listening {
                self.listen(frame);
            } else {
                self.backlog.push(frame);
            }
        }
    }

    /// Cancel every stage concurrently. Returns `false` if any was abandoned.
    async fn cancel_all(&mut self) -> bool {
        let timeout = self.settings.cancel_timeout;
        let (tts, llm, stt) = (self.tts.take(), self.llm.take(), self.stt.take());
        let id = self.session_id.as_str();

        let outcomes = tokio::join!(
            teardown(id, tts, timeout),
            teardown(id, llm, timeout),
            teardown(id, stt, timeout)
        );
        [outcomes.0, outcomes.1, outcomes.2]
            .iter()
            .all(|outcome| *outcome == Teardown::Confirmed)
    }

    /// Drop everything belonging to the current turn (stages must already be cancelled).
    fn clear_turn(&mut self) {
        self.backlog.clear();
        self.outbound.discard_pending_audio();
        self.reply = Reply::default();
        self.deadline = None;
        self.detector.reset();
    }

    fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    /// System prompt followed by the conversation so far.
    fn llm_history(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        if !self.settings.system_prompt.is_empty() {
            messages.push(ChatMessage::new(Role::System, self.settings.system_prompt.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages
    }

    fn push_history(&mut self, message: ChatMessage) {
        self.history.push_back(message);
        while self.history.len() > self.settings.max_history_messages {
            self.history.pop_front();
        }
    }

    async fn send_status(&self, status: SessionStatus) {
        let event = ServerEvent::Status {
            session_id: self.session_id.clone(),
            status,
        };
        self.send(event).await;
    }

    async fn send(&self, event: ServerEvent) {
        let kind = event.kind();
        if !self.outbound.event(event).await {
            debug!(session_id = %self.session_id, event = kind, "Outbound closed, event dropped");
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.state,
            inbound_seq: self.inbound_seq,
            outbound_seq: self.outbound_seq,
            turns_completed: self.turns_completed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::{ScriptedLlm, ScriptedStt, ScriptedTts};
    use crate::adapters::{AudioInput, LlmProvider, StageStream, SttProvider};
    use crate::audio::StatusFlags;
    use crate::pipeline::Outbound;
    use crate::turn::TurnDetectorConfig;
    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    // 100-sample frames at 1kHz: every frame is 100ms of audio
    fn settings() -> PipelineSettings {
        PipelineSettings {
            detector: TurnDetectorConfig {
                sample_rate: 1000,
                voice_end_debounce: Duration::from_millis(200),
                energy_threshold: 0.0,
                barge_in_min_voice: Duration::from_millis(300),
            },
            barge_in_enabled: true,
            transcribing_buffer_frames: 4,
            audio_channel_capacity: 64,
            stage_channel_capacity: 64,
            outbound_channel_capacity: 256,
            cancel_timeout: Duration::from_millis(200),
            response_timeout: Duration::from_secs(2),
            max_history_messages: 20,
            system_prompt: "Be brief.".to_string(),
        }
    }

    fn providers(
        stt: impl SttProvider + 'static,
        llm: ScriptedLlm,
        tts: ScriptedTts,
    ) -> Providers {
        Providers {
            stt: Arc::new(stt),
            llm: Arc::new(llm),
            tts: Arc::new(tts),
        }
    }

    fn default_providers() -> Providers {
        providers(
            ScriptedStt::new("what time is it", 1),
            ScriptedLlm::new(Some("It is noon. Enjoy!".into())),
            ScriptedTts::new(),
        )
    }

    fn frame(voiced: bool) -> AudioFrame {
        let flags = if voiced { StatusFlags::VOICE_ENERGY } else { 0 };
        AudioFrame::from_samples(0, StatusFlags::from_bits(flags), &[0; 100])
    }

    fn control(handle: &PipelineHandle, message: ControlMessage) {
        handle.commands.send(PipelineCommand::Control(message)).unwrap();
    }

    async fn speak(handle: &PipelineHandle) {
        for _ in 0..3 {
            handle.audio.send(frame(true)).await.unwrap();
        }
        for _ in 0..2 {
            handle.audio.send(frame(false)).await.unwrap();
        }
    }

    async fn next(rx: &mut OutboundReceiver) -> Outbound {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("outbound item in time")
            .expect("outbound open")
    }

    fn kind(item: &Outbound) -> &'static str {
        match item {
            Outbound::Event(event) => event.kind(),
            Outbound::Audio { .. } => "audio",
        }
    }

    /// Collect items up to and including the first one matching `stop`.
    async fn collect_until(
        rx: &mut OutboundReceiver,
        stop: impl Fn(&Outbound) -> bool,
    ) -> Vec<Outbound> {
        let mut items = Vec::new();
        loop {
            let item = next(rx).await;
            let done = stop(&item);
            items.push(item);
            if done {
                return items;
            }
        }
    }

    fn is_kind(name: &'static str) -> impl Fn(&Outbound) -> bool {
        move |item| kind(item) == name
    }

    async fn assert_quiet(rx: &mut OutboundReceiver, period: Duration) {
        if let Ok(Some(item)) = tokio::time::timeout(period, rx.recv()).await {
            panic!("expected silence, got {:?}", item);
        }
    }

    async fn wait_for_state(handle: &mut PipelineHandle, state: TurnState) {
        tokio::time::timeout(
            Duration::from_secs(3),
            handle.snapshot.wait_for(|s| s.state == state),
        )
        .await
        .expect("state reached in time")
        .expect("pipeline alive");
    }

    fn position(items: &[Outbound], name: &str) -> usize {
        items
            .iter()
            .position(|item| kind(item) == name)
            .unwrap_or_else(|| panic!("no {} in {:?}", name, items))
    }

    #[tokio::test]
    async fn test_full_turn() {
        let (mut handle, mut rx) = spawn_pipeline("s1".into(), settings(), default_providers());

        control(&handle, ControlMessage::Start);
        assert!(matches!(
            next(&mut rx).await,
            Outbound::Event(ServerEvent::Status { status: SessionStatus::Listening, .. })
        ));

        speak(&handle).await;

        let items = collect_until(&mut rx, is_kind("status")).await;

        // Transcripts are numbered in order, partials before the final
        let seqs: Vec<u64> = items
            .iter()
            .filter_map(|item| match item {
                Outbound::Event(ServerEvent::PartialTranscript { seq, .. }) => Some(*seq),
                Outbound::Event(ServerEvent::FinalTranscript { seq, content, .. }) => {
                    assert_eq!(content, "what time is it");
                    Some(*seq)
                }
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        assert!(position(&items, "final_transcript") < position(&items, "llm_status"));
        assert!(position(&items, "llm_status") < position(&items, "llm_response"));
        assert!(position(&items, "tts_start") < position(&items, "audio"));

        let audio = items.iter().filter(|i| kind(i) == "audio").count();
        let starts = items.iter().filter(|i| kind(i) == "tts_start").count();
        let ends = items.iter().filter(|i| kind(i) == "tts_end").count();
        assert_eq!((starts, audio, ends), (2, 4, 2));

        let complete = items.iter().find_map(|item| match item {
            Outbound::Event(ServerEvent::LlmResponse {
                content,
                is_complete: true,
                ..
            }) => Some(content.clone()),
            _ => None,
        });
        assert_eq!(complete.as_deref(), Some("It is noon. Enjoy!"));

        // Streamed responses carry the reply so far
        let streamed: Vec<&str> = items
            .iter()
            .filter_map(|item| match item {
                Outbound::Event(ServerEvent::LlmResponse {
                    content,
                    is_complete: false,
                    ..
                }) => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, vec!["It ", "It is ", "It is noon. ", "It is noon. Enjoy!"]);

        let captions: Vec<&str> = items
            .iter()
            .filter_map(|item| match item {
                Outbound::Event(ServerEvent::Subtitle {
                    content,
                    is_complete: true,
                    ..
                }) => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(captions, vec!["It is noon.", "Enjoy!"]);

        // The turn ends with status:listening after the last tts_end
        assert!(matches!(
            items.last(),
            Some(Outbound::Event(ServerEvent::Status { status: SessionStatus::Listening, .. }))
        ));

        wait_for_state(&mut handle, TurnState::Listening).await;
        let snapshot = handle.snapshot.borrow().clone();
        assert_eq!(snapshot.turns_completed, 1);
        assert_eq!(snapshot.inbound_seq, 5);
        assert_eq!(snapshot.outbound_seq, 8);
    }

    #[tokio::test]
    async fn test_interrupt_while_speaking() {
        let (mut handle, mut rx) = spawn_pipeline(
            "s2".into(),
            settings(),
            providers(
                ScriptedStt::new("tell me a story", 0),
                ScriptedLlm::new(Some(
                    "Once upon a time there was a very long story that never ended.".into(),
                )),
                ScriptedTts::new().with_frame_delay(Duration::from_millis(50)),
            ),
        );

        control(&handle, ControlMessage::Start);
        speak(&handle).await;
        collect_until(&mut rx, is_kind("audio")).await;

        control(&handle, ControlMessage::Interrupt);
        let items = collect_until(&mut rx, is_kind("interrupt_acknowledged")).await;

        let stop_at = position(&items, "tts_stop");
        assert!(items[stop_at..].iter().all(|item| kind(item) != "audio"));

        wait_for_state(&mut handle, TurnState::Listening).await;
        assert_quiet(&mut rx, Duration::from_millis(300)).await;

        // The next turn starts cleanly
        speak(&handle).await;
        let items = collect_until(&mut rx, is_kind("final_transcript")).await;
        assert!(items.iter().all(|item| kind(item) != "audio"));
    }

    #[tokio::test]
    async fn test_stop_and_reset_reach_idle_from_each_state() {
        // Listening
        let (mut handle, mut rx) = spawn_pipeline("s3".into(), settings(), default_providers());
        control(&handle, ControlMessage::Start);
        next(&mut rx).await;
        control(&handle, ControlMessage::Stop);
        let items = collect_until(&mut rx, is_kind("stop_acknowledged")).await;
        assert_eq!(
            items.iter().map(kind).collect::<Vec<_>>(),
            vec!["status", "stop_acknowledged"]
        );
        wait_for_state(&mut handle, TurnState::Idle).await;

        // Thinking (slow first token)
        let (mut handle, mut rx) = spawn_pipeline(
            "s4".into(),
            settings(),
            providers(
                ScriptedStt::new("hello", 0),
                ScriptedLlm::new(None).with_token_delay(Duration::from_secs(1)),
                ScriptedTts::new(),
            ),
        );
        control(&handle, ControlMessage::Start);
        speak(&handle).await;
        collect_until(&mut rx, is_kind("llm_status")).await;
        wait_for_state(&mut handle, TurnState::Thinking).await;
        control(&handle, ControlMessage::Reset);
        collect_until(&mut rx, is_kind("status")).await;
        wait_for_state(&mut handle, TurnState::Idle).await;
        let snapshot = handle.snapshot.borrow().clone();
        assert_eq!((snapshot.inbound_seq, snapshot.outbound_seq), (0, 0));

        // Speaking
        let (mut handle, mut rx) = spawn_pipeline(
            "s5".into(),
            settings(),
            providers(
                ScriptedStt::new("hello", 0),
                ScriptedLlm::new(Some("a b c d e f g h".into())),
                ScriptedTts::new().with_frame_delay(Duration::from_millis(100)),
            ),
        );
        control(&handle, ControlMessage::Start);
        speak(&handle).await;
        collect_until(&mut rx, is_kind("tts_start")).await;
        control(&handle, ControlMessage::Stop);
        collect_until(&mut rx, is_kind("stop_acknowledged")).await;
        wait_for_state(&mut handle, TurnState::Idle).await;
        assert_quiet(&mut rx, Duration::from_millis(300)).await;
    }

    /// Never produces a final transcript.
    struct SilentStt;

    #[async_trait]
    impl SttProvider for SilentStt {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn start(&self, _audio: AudioInput) -> Result<StageStream<Transcript>, AdapterError> {
            Ok(stream::pending().boxed())
        }
    }

    #[tokio::test]
    async fn test_stop_while_transcribing_and_backlog_bound() {
        let (mut handle, mut rx) = spawn_pipeline(
            "s6".into(),
            settings(),
            providers(SilentStt, ScriptedLlm::new(None), ScriptedTts::new()),
        );
        control(&handle, ControlMessage::Start);
        next(&mut rx).await;
        speak(&handle).await;
        wait_for_state(&mut handle, TurnState::Transcribing).await;

        // More frames than the backlog holds; they are buffered or dropped, never forwarded
        for _ in 0..10 {
            handle.audio.send(frame(true)).await.unwrap();
        }

        control(&handle, ControlMessage::Stop);
        collect_until(&mut rx, is_kind("stop_acknowledged")).await;
        wait_for_state(&mut handle, TurnState::Idle).await;
    }

    #[tokio::test]
    async fn test_response_deadline_aborts_turn() {
        let mut settings = settings();
        settings.response_timeout = Duration::from_millis(200);
        let (mut handle, mut rx) = spawn_pipeline(
            "s7".into(),
            settings,
            providers(SilentStt, ScriptedLlm::new(None), ScriptedTts::new()),
        );
        control(&handle, ControlMessage::Start);
        speak(&handle).await;

        let items = collect_until(&mut rx, is_kind("error")).await;
        match items.last() {
            Some(Outbound::Event(ServerEvent::Error { message, .. })) => {
                assert!(message.contains("timed out"), "{}", message)
            }
            other => panic!("expected error, got {:?}", other),
        }
        wait_for_state(&mut handle, TurnState::Idle).await;
    }

    #[tokio::test]
    async fn test_idle_commands_are_acknowledged_noops() {
        let (mut handle, mut rx) = spawn_pipeline("s8".into(), settings(), default_providers());

        control(&handle, ControlMessage::Interrupt);
        assert_eq!(kind(&next(&mut rx).await), "interrupt_acknowledged");

        control(&handle, ControlMessage::Stop);
        let items = collect_until(&mut rx, is_kind("stop_acknowledged")).await;
        assert_eq!(items.len(), 2);

        // Audio while Idle is counted but goes nowhere
        handle.audio.send(frame(true)).await.unwrap();
        assert_quiet(&mut rx, Duration::from_millis(200)).await;
        wait_for_state(&mut handle, TurnState::Idle).await;
        assert_eq!(handle.snapshot.borrow().inbound_seq, 1);
    }

    #[tokio::test]
    async fn test_start_while_active_reannounces_listening() {
        let (handle, mut rx) = spawn_pipeline("s9".into(), settings(), default_providers());
        control(&handle, ControlMessage::Start);
        control(&handle, ControlMessage::Start);
        assert_eq!(kind(&next(&mut rx).await), "status");
        assert_eq!(kind(&next(&mut rx).await), "status");
    }

    #[tokio::test]
    async fn test_silence_after_stop_with_slow_cancelling_tts() {
        let (mut handle, mut rx) = spawn_pipeline(
            "s10".into(),
            settings(),
            providers(
                ScriptedStt::new("hello", 0),
                ScriptedLlm::new(Some("one two three four five six seven eight".into())),
                ScriptedTts::new()
                    .with_frame_delay(Duration::from_millis(30))
                    .with_cancel_delay(Duration::from_secs(3)),
            ),
        );
        control(&handle, ControlMessage::Start);
        speak(&handle).await;
        collect_until(&mut rx, is_kind("audio")).await;

        let started = std::time::Instant::now();
        control(&handle, ControlMessage::Stop);
        let items = collect_until(&mut rx, is_kind("stop_acknowledged")).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        match items.last() {
            Some(Outbound::Event(ServerEvent::StopAcknowledged { queues_cleared, .. })) => {
                assert!(*queues_cleared)
            }
            other => panic!("expected stop_acknowledged, got {:?}", other),
        }
        assert_quiet(&mut rx, Duration::from_millis(400)).await;
        wait_for_state(&mut handle, TurnState::Idle).await;
    }

    #[tokio::test]
    async fn test_llm_failure_reports_error_and_goes_idle() {
        let (mut handle, mut rx) = spawn_pipeline(
            "s11".into(),
            settings(),
            providers(
                ScriptedStt::new("hello", 0),
                ScriptedLlm::new(None).failing("model offline"),
                ScriptedTts::new(),
            ),
        );
        control(&handle, ControlMessage::Start);
        speak(&handle).await;

        let items = collect_until(&mut rx, is_kind("error")).await;
        assert!(position(&items, "final_transcript") < position(&items, "error"));
        match items.last() {
            Some(Outbound::Event(ServerEvent::Error { message, .. })) => {
                assert!(message.contains("model offline"))
            }
            other => panic!("expected error, got {:?}", other),
        }
        wait_for_state(&mut handle, TurnState::Idle).await;
        assert_quiet(&mut rx, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_empty_final_keeps_listening() {
        let (mut handle, mut rx) = spawn_pipeline(
            "s12".into(),
            settings(),
            providers(ScriptedStt::new("", 0), ScriptedLlm::new(None), ScriptedTts::new()),
        );
        control(&handle, ControlMessage::Start);
        next(&mut rx).await;
        speak(&handle).await;

        assert_quiet(&mut rx, Duration::from_millis(300)).await;
        wait_for_state(&mut handle, TurnState::Listening).await;
    }

    /// Counts concurrently running speech-to-text jobs and signals each start.
    struct CountingStt {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        starts: Arc<AtomicUsize>,
        started: Arc<Notify>,
    }

    struct ActiveGuard(Arc<AtomicUsize>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SttProvider for CountingStt {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn start(&self, audio: AudioInput) -> Result<StageStream<Transcript>, AdapterError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            let guard = ActiveGuard(self.active.clone());
            let results = audio
                .filter_map(|_| async { None::<Result<Transcript, AdapterError>> })
                .map(move |item| {
                    let _active = &guard;
                    item
                });
            Ok(results.boxed())
        }
    }

    #[tokio::test]
    async fn test_rapid_interrupt_and_start_keep_single_stt_handle() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let starts = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Notify::new());
        let stt = CountingStt {
            active: active.clone(),
            peak: peak.clone(),
            starts: starts.clone(),
            started: started.clone(),
        };
        let (mut handle, mut rx) = spawn_pipeline(
            "s13".into(),
            settings(),
            providers(stt, ScriptedLlm::new(None), ScriptedTts::new()),
        );

        let cycles = 20;
        control(&handle, ControlMessage::Start);
        for _ in 0..cycles {
            // Each job must be running before it is cut off
            tokio::time::timeout(Duration::from_secs(2), started.notified())
                .await
                .expect("speech-to-text job started");
            control(&handle, ControlMessage::Interrupt);
            control(&handle, ControlMessage::Start);
            handle.audio.send(frame(true)).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), started.notified())
            .await
            .expect("last speech-to-text job started");

        control(&handle, ControlMessage::Stop);
        collect_until(&mut rx, is_kind("stop_acknowledged")).await;
        wait_for_state(&mut handle, TurnState::Idle).await;

        assert!(starts.load(Ordering::SeqCst) >= cycles + 1);
        assert!(peak.load(Ordering::SeqCst) <= 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sustained_voice_barges_in_while_speaking() {
        let (mut handle, mut rx) = spawn_pipeline(
            "s15".into(),
            settings(),
            providers(
                ScriptedStt::new("tell me a story", 0),
                ScriptedLlm::new(Some("a b c d e f g h i j k l".into())),
                ScriptedTts::new().with_frame_delay(Duration::from_millis(50)),
            ),
        );
        control(&handle, ControlMessage::Start);
        speak(&handle).await;
        collect_until(&mut rx, is_kind("audio")).await;
        wait_for_state(&mut handle, TurnState::Speaking).await;

        // 400ms of voice, the minimum is 300ms
        for _ in 0..4 {
            handle.audio.send(frame(true)).await.unwrap();
        }
        let items = collect_until(&mut rx, is_kind("interrupt_acknowledged")).await;
        let stop_at = position(&items, "tts_stop");
        assert!(items[stop_at..].iter().all(|item| kind(item) != "audio"));

        wait_for_state(&mut handle, TurnState::Listening).await;
    }

    #[tokio::test]
    async fn test_voice_ignored_while_speaking_without_barge_in() {
        let mut settings = settings();
        settings.barge_in_enabled = false;
        let (mut handle, mut rx) = spawn_pipeline(
            "s16".into(),
            settings,
            providers(
                ScriptedStt::new("hello", 0),
                ScriptedLlm::new(Some("Sure thing, I can help with that.".into())),
                ScriptedTts::new().with_frame_delay(Duration::from_millis(50)),
            ),
        );
        control(&handle, ControlMessage::Start);
        next(&mut rx).await;
        speak(&handle).await;
        let mut items = collect_until(&mut rx, is_kind("audio")).await;

        for _ in 0..6 {
            handle.audio.send(frame(true)).await.unwrap();
        }
        items.extend(collect_until(&mut rx, is_kind("status")).await);

        assert!(items
            .iter()
            .all(|item| !matches!(kind(item), "tts_stop" | "interrupt_acknowledged")));
        assert!(position(&items, "tts_end") < items.len() - 1);
        wait_for_state(&mut handle, TurnState::Listening).await;
        assert_eq!(handle.snapshot.borrow().turns_completed, 1);
    }

    /// Reports how many frames reached it, after a pause once its input ends.
    struct FrameCountStt;

    #[async_trait]
    impl SttProvider for FrameCountStt {
        fn name(&self) -> &'static str {
            "frame-count"
        }

        async fn start(&self, audio: AudioInput) -> Result<StageStream<Transcript>, AdapterError> {
            let job = async move {
                let frames = audio.count().await;
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(Transcript::Final(format!("heard {}", frames)))
            };
            Ok(stream::once(job).boxed())
        }
    }

    #[tokio::test]
    async fn test_transcribing_backlog_not_replayed_after_reply() {
        let (handle, mut rx) = spawn_pipeline(
            "s17".into(),
            settings(),
            providers(FrameCountStt, ScriptedLlm::new(Some("Okay.".into())), ScriptedTts::new()),
        );
        control(&handle, ControlMessage::Start);
        next(&mut rx).await;

        speak(&handle).await;
        // Arrives while the first final is pending
        for _ in 0..3 {
            handle.audio.send(frame(true)).await.unwrap();
        }
        let items = collect_until(&mut rx, is_kind("status")).await;
        let finals: Vec<String> = items
            .iter()
            .filter_map(|item| match item {
                Outbound::Event(ServerEvent::FinalTranscript { content, .. }) => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(finals, vec!["heard 5"]);

        speak(&handle).await;
        let items = collect_until(&mut rx, is_kind("final_transcript")).await;
        match items.last() {
            Some(Outbound::Event(ServerEvent::FinalTranscript { content, .. })) => {
                assert_eq!(content, "heard 5")
            }
            other => panic!("expected final_transcript, got {:?}", other),
        }
    }

    /// Records how many history messages each job received.
    struct RecordingLlm {
        seen: Arc<Mutex<Vec<Vec<Role>>>>,
    }

    #[async_trait]
    impl LlmProvider for RecordingLlm {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn start(
            &self,
            _prompt: String,
            history: Vec<ChatMessage>,
        ) -> Result<StageStream<LlmToken>, AdapterError> {
            let roles = history.iter().map(|m| m.role).collect();
            self.seen.lock().unwrap().push(roles);
            let tokens = vec![Ok(LlmToken::text("Okay.")), Ok(LlmToken::done())];
            Ok(stream::iter(tokens).boxed())
        }
    }

    #[tokio::test]
    async fn test_history_sent_to_llm_is_bounded() {
        let mut pipeline_settings = settings();
        pipeline_settings.max_history_messages = 2;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let providers = Providers {
            stt: Arc::new(ScriptedStt::new("hello", 0)),
            llm: Arc::new(RecordingLlm { seen: seen.clone() }),
            tts: Arc::new(ScriptedTts::new()),
        };
        let (handle, mut rx) = spawn_pipeline("s14".into(), pipeline_settings, providers);

        control(&handle, ControlMessage::Start);
        next(&mut rx).await;
        for _ in 0..3 {
            speak(&handle).await;
            collect_until(&mut rx, is_kind("status")).await;
        }

        use Role::*;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                vec![System],
                vec![System, User, Assistant],
                vec![System, User, Assistant],
            ]
        );

        handle.commands.send(PipelineCommand::Shutdown).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle.task)
            .await
            .expect("pipeline ends on shutdown")
            .unwrap();
    }
}
