//! # Audio Module
//!
//! Everything that touches raw audio bytes lives here: the binary frame codec used on the
//! WebSocket, PCM helpers, and the bounded backlog used while a transcript is pending.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 24kHz by default (`pipeline.sample_rate`)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers
//!
//! ## Wire Frame (client → server):
//! ```text
//! [u32 LE timestamp][u32 LE status flags][PCM16 LE payload ...]
//! ```
//! Server → client audio is the bare PCM16 payload, bracketed by `tts_start` / `tts_end`.

pub mod buffer;   // Bounded frame backlog and utterance collection
pub mod frame;    // Binary frame codec
pub mod pcm;      // Sample conversion, energy and re-chunking

pub use buffer::{FrameBacklog, UtteranceBuffer};
pub use frame::{AudioFrame, StatusFlags};
