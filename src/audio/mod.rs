//! # Audio Handling
//!
//! Everything the relay does to audio on its way through a room.
//!
//! ## Key Components:
//! - **Client Audio Buffer**: per-client accumulation and sample alignment
//! - **Resampler**: fixed-ratio sample-rate conversion (rubato)
//! - **Audio Processor**: the inbound and outbound paths of a room
//!
//! ## Audio Format:
//! 16-bit signed little-endian mono PCM throughout. Default rates are 16 kHz
//! from clients, 24 kHz from the backend and 48 kHz for playback.

pub mod buffer;
pub mod processor;
pub mod resampler;
