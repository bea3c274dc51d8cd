//! # Stage Runner
//!
//! A stage is one in-flight job against one provider, running in its own tokio task and
//! reporting back to the orchestrator through a shared channel.
//!
//! ## Guarantees:
//! - Every result is tagged with the handle's **epoch**; the orchestrator drops results
//!   whose epoch is not the current handle's
//! - Nothing is delivered once the cancellation token fires (sends race against it, biased)
//! - At most one terminal payload (`Finished` or `Failed`) per job
//!
//! ## Teardown:
//! `StageHandle::shutdown` cancels the token, closes the input and waits for the task up to
//! a bound. A task that does not finish in time is aborted and reported as abandoned.
//!
//! ## Key Rust Concepts:
//! - **CancellationToken**: Cooperative cancellation shared between owner and task
//! - **tokio::select! with `biased;`**: Cancellation is always checked before progress
//! - **Generic handles**: `StageHandle<I>` carries whatever input sender the stage needs

use crate::adapters::{
    ChatMessage, LlmProvider, LlmToken, StageStream, SttProvider, Transcript, TtsProvider,
};
use crate::audio::AudioFrame;
use crate::error::AdapterError;
use futures_util::future;
use futures_util::stream::{self, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Stt,
    Llm,
    Tts,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Stt => "speech-to-text",
            StageKind::Llm => "language model",
            StageKind::Tts => "speech synthesis",
        };
        f.write_str(name)
    }
}

/// Output of the speech synthesis stage, per text segment.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechChunk {
    SegmentStarted { text: String, is_first: bool },
    Audio(AudioFrame),
    SegmentFinished,
}

#[derive(Debug)]
pub enum StagePayload {
    Transcript(Transcript),
    Token(LlmToken),
    Speech(SpeechChunk),
    /// The provider stream ended normally
    Finished,
    /// The provider failed; no further payloads follow
    Failed(AdapterError),
}

#[derive(Debug)]
pub struct StageEvent {
    pub kind: StageKind,
    pub epoch: u64,
    pub payload: StagePayload,
}

/// Outcome of `StageHandle::shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Confirmed,
    Abandoned,
}

/// Owner's side of a running stage.
///
/// `I` is the input sender of the stage (`()` for stages without streamed input).
/// Dropping a handle cancels the stage without waiting for it.
pub struct StageHandle<I = ()> {
    pub kind: StageKind,
    pub epoch: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
    input: Option<I>,
}

impl<I> StageHandle<I> {
    pub fn input(&self) -> Option<&I> {
        self.input.as_ref()
    }

    /// Drop the input sender: the provider sees the end of its input stream.
    pub fn close_input(&mut self) {
        self.input.take();
    }

    /// Cancel the stage and wait (bounded) for its task to end.
    pub async fn shutdown(mut self, timeout: Duration) -> Teardown {
        self.token.cancel();
        self.input.take();

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(_) => Teardown::Confirmed,
            Err(_) => {
                self.task.abort();
                Teardown::Abandoned
            }
        }
    }
}

impl<I> Drop for StageHandle<I> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Send a stage event unless the stage has been cancelled first.
async fn emit(
    token: &CancellationToken,
    events: &mpsc::Sender<StageEvent>,
    kind: StageKind,
    epoch: u64,
    payload: StagePayload,
) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = events.send(StageEvent { kind, epoch, payload }) => sent.is_ok(),
    }
}

/// Drive one provider job to completion or cancellation.
async fn drive<T, S, C>(
    kind: StageKind,
    epoch: u64,
    token: CancellationToken,
    events: mpsc::Sender<StageEvent>,
    start: S,
    wrap: fn(T) -> StagePayload,
    on_cancel: C,
) where
    S: Future<Output = Result<StageStream<T>, AdapterError>>,
    C: Future<Output = ()>,
{
    let started = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = start => Some(result),
    };

    match started {
        None => {}
        Some(Err(e)) => {
            emit(&token, &events, kind, epoch, StagePayload::Failed(e)).await;
        }
        Some(Ok(mut results)) => loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = results.next() => next,
            };

            let (payload, last) = match next {
                Some(Ok(item)) => (wrap(item), false),
                Some(Err(e)) => (StagePayload::Failed(e), true),
                None => (StagePayload::Finished, true),
            };
            if !emit(&token, &events, kind, epoch, payload).await || last {
                break;
            }
        },
    }

    if token.is_cancelled() {
        debug!(stage = %kind, epoch, "Stage cancelled, notifying provider");
        on_cancel.await;
    }
}

/// Start a speech-to-text job fed through a bounded audio channel.
pub fn spawn_stt(
    provider: Arc<dyn SttProvider>,
    epoch: u64,
    events: mpsc::Sender<StageEvent>,
    input_capacity: usize,
) -> StageHandle<mpsc::Sender<AudioFrame>> {
    let (tx, rx) = mpsc::channel(input_capacity);
    let audio = ReceiverStream::new(rx).boxed();
    let token = CancellationToken::new();

    let starter = provider.clone();
    let start = async move { starter.start(audio).await };
    let on_cancel = async move { provider.cancel().await };

    let task = tokio::spawn(drive(
        StageKind::Stt,
        epoch,
        token.clone(),
        events,
        start,
        StagePayload::Transcript,
        on_cancel,
    ));

    StageHandle {
        kind: StageKind::Stt,
        epoch,
        token,
        task,
        input: Some(tx),
    }
}

/// Start a language model job for one prompt.
pub fn spawn_llm(
    provider: Arc<dyn LlmProvider>,
    epoch: u64,
    events: mpsc::Sender<StageEvent>,
    prompt: String,
    history: Vec<ChatMessage>,
) -> StageHandle {
    let token = CancellationToken::new();

    let starter = provider.clone();
    let start = async move { starter.start(prompt, history).await };
    let on_cancel = async move { provider.cancel().await };

    let task = tokio::spawn(drive(
        StageKind::Llm,
        epoch,
        token.clone(),
        events,
        start,
        StagePayload::Token,
        on_cancel,
    ));

    StageHandle {
        kind: StageKind::Llm,
        epoch,
        token,
        task,
        input: None,
    }
}

/// Start a speech synthesis stage fed with text segments.
///
/// Segments are synthesized one after another; each produces
/// `SegmentStarted`, its audio frames, then `SegmentFinished`. The stage finishes once the
/// input is closed and the last segment has been spoken.
pub fn spawn_tts(
    provider: Arc<dyn TtsProvider>,
    epoch: u64,
    events: mpsc::Sender<StageEvent>,
) -> StageHandle<mpsc::UnboundedSender<String>> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let token = CancellationToken::new();

    let synthesizer = provider.clone();
    let start = async move {
        let speech = UnboundedReceiverStream::new(rx)
            .enumerate()
            .then(move |(index, text)| {
                let synthesizer = synthesizer.clone();
                async move { segment_stream(synthesizer, text, index == 0).await }
            })
            .flatten()
            .boxed();
        Ok::<StageStream<SpeechChunk>, AdapterError>(speech)
    };
    let on_cancel = async move { provider.cancel().await };

    let task = tokio::spawn(drive(
        StageKind::Tts,
        epoch,
        token.clone(),
        events,
        start,
        StagePayload::Speech,
        on_cancel,
    ));

    StageHandle {
        kind: StageKind::Tts,
        epoch,
        token,
        task,
        input: Some(tx),
    }
}

async fn segment_stream(
    provider: Arc<dyn TtsProvider>,
    text: String,
    is_first: bool,
) -> StageStream<SpeechChunk> {
    match provider.synthesize(text.clone()).await {
        Ok(frames) => stream::once(future::ready(Ok(SpeechChunk::SegmentStarted { text, is_first })))
            .chain(frames.map(|frame| frame.map(SpeechChunk::Audio)))
            .chain(stream::once(future::ready(Ok(SpeechChunk::SegmentFinished))))
            .boxed(),
        Err(e) => stream::once(future::ready(Err(e))).boxed(),
    }
}
