//! # Audio Pipeline Module
//!
//! This module handles the two real-time audio paths of a voice call.
//!
//! ## Key Components:
//! - **Capture Pipeline**: microphone blocks → smoothed loudness level →
//!   PCM16 chunks for the wire
//! - **Playback Pipeline**: agent PCM16 chunks → gapless scheduled output
//! - **Resamplers**: rate conversion for both directions
//! - **Device Backends**: cpal implementations of the capture/playback seams
//!
//! ## Audio Format:
//! - **Capture**: 16 kHz, 16-bit PCM, mono, little-endian (what the agent's
//!   recognizer expects)
//! - **Playback**: 24 kHz nominal from the agent, resampled to whatever rate
//!   the output device runs at

pub mod capture;
pub mod device;
pub mod playback;
pub mod resample;

pub use capture::{AudioLevel, CaptureBackend, CapturePipeline};
pub use playback::{Clock, MonotonicClock, PlaybackPipeline, PlaybackSink};
