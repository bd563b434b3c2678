//! # speedplay-audio
//!
//! Variable-speed audio playback that keeps the original pitch.
//!
//! Features:
//! - Symphonia demuxing and decoding behind queue-based source/decoder traits
//! - Sonic-style time stretching of 16-bit PCM
//! - Low-latency cpal output through a lock-free ring buffer
//! - A player state machine with async prepare and seek

pub mod backend;
pub mod buffer;
pub mod config;
pub mod decode;
mod decode_loop;
pub mod events;
pub mod player;
pub mod resample;
pub mod sink;
pub mod source;
pub mod stretch;
pub mod wake;

pub use backend::{MediaBackend, SystemBackend};
pub use config::PlayerConfig;
pub use decode::{Decoder, DecoderOutput, PcmChunk, PcmFormat, SymphoniaDecoder};
pub use events::{Listener, PlayerEvent};
pub use player::SpeedPlayer;
pub use sink::{AudioSink, ChannelMask, CpalSink, MemorySink, MemorySinkProbe, SinkConfig};
pub use source::{MediaSource, SampleInfo, SymphoniaSource, TrackFormat};
pub use stretch::TimeStretch;
pub use wake::{WakeLock, WakeState};

pub use speedplay_core::{DataSource, Error, PlaybackState, Result, StreamFormat};
