//! # Outbound Sink
//!
//! The single path from a session's orchestrator to its WebSocket writer. JSON events and
//! binary audio share one ordered queue so the client sees `tts_start`, audio, `tts_end`
//! in exactly the order they were produced.
//!
//! ## Flush Generations:
//! Each audio chunk is tagged with the generation current when it was queued. `stop`,
//! `reset`, `interrupt` and turn failures bump the generation, and the receiving side
//! silently drops audio from older generations. Audio that was already queued but not yet
//! written to the socket is discarded without draining the queue. Events are never dropped.

use crate::pipeline::events::ServerEvent;
use futures_util::stream::{self, Stream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// One item on the way to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Audio { generation: u64, pcm: Vec<u8> },
}

/// Writer half, owned by the orchestrator.
#[derive(Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<Outbound>,
    generation: Arc<AtomicU64>,
}

/// Reader half, owned by the connection gateway.
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Outbound>,
    generation: Arc<AtomicU64>,
}

/// Create a connected sink / receiver pair.
pub fn channel(capacity: usize) -> (OutboundSink, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let generation = Arc::new(AtomicU64::new(0));
    (
        OutboundSink {
            tx,
            generation: generation.clone(),
        },
        OutboundReceiver { rx, generation },
    )
}

impl OutboundSink {
    /// Queue an event. Waits for room, so a slow client slows the pipeline down
    /// instead of growing memory.
    ///
    /// Returns `false` when the connection side is gone.
    pub async fn event(&self, event: ServerEvent) -> bool {
        self.tx.send(Outbound::Event(event)).await.is_ok()
    }

    /// Queue an audio chunk tagged with the current generation.
    pub async fn audio(&self, pcm: Vec<u8>) -> bool {
        let generation = self.generation.load(Ordering::SeqCst);
        self.tx
            .send(Outbound::Audio { generation, pcm })
            .await
            .is_ok()
    }

    /// Invalidate all audio queued so far.
    pub fn discard_pending_audio(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl OutboundReceiver {
    /// Next item to write, skipping audio from discarded generations.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            match self.rx.recv().await? {
                Outbound::Audio { generation, .. }
                    if generation != self.generation.load(Ordering::SeqCst) =>
                {
                    continue;
                }
                item => return Some(item),
            }
        }
    }

    /// Adapt into a `Stream` for actors (`ctx.add_stream`).
    pub fn into_stream(self) -> impl Stream<Item = Outbound> {
        stream::unfold(self, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
    }
}

impl Drop for OutboundReceiver {
    fn drop(&mut self) {
        let unread = self.rx.len();
        if unread > 0 {
            warn!("Outbound queue closed with {} unsent items", unread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u64) -> ServerEvent {
        ServerEvent::PartialTranscript {
            session_id: "s".into(),
            content: n.to_string(),
            seq: n,
        }
    }

    #[tokio::test]
    async fn test_stale_audio_dropped_events_kept() {
        let (sink, mut rx) = channel(8);
        assert!(sink.audio(vec![1, 0]).await);
        assert!(sink.event(event(1)).await);
        sink.discard_pending_audio();
        assert!(sink.audio(vec![2, 0]).await);

        assert_eq!(rx.recv().await, Some(Outbound::Event(event(1))));
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Audio {
                generation: 1,
                pcm: vec![2, 0]
            })
        );
    }

    #[tokio::test]
    async fn test_closed_receiver_reported() {
        let (sink, rx) = channel(1);
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.event(event(1)).await);
    }
}
