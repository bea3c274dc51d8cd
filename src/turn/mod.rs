//! # Turn Detection
//!
//! Decides when the user has started and stopped speaking.

pub mod detector;

pub use detector::{TurnDetector, TurnDetectorConfig, TurnEvent};
