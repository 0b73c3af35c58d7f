//! Inbound audio handling
//!
//! Frame validation before hand-off to the recognizer, and the bounded
//! buffer that holds frames while a response is in flight.

mod buffer;
mod validator;

pub use buffer::PendingAudio;
pub use validator::{analyze_pcm16, AudioFrameValidator, FrameStats, FrameVerdict};
