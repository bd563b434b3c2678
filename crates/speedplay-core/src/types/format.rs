//! Stream format of the selected audio track.

use serde::{Deserialize, Serialize};

/// Format of the elementary audio stream being played.
///
/// Extracted once from the source track. Every field is required; a track
/// that cannot supply all of them is rejected during preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// MIME type of the compressed payload.
    pub mime: String,
    /// Total duration in microseconds.
    pub duration_us: u64,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16, mime: impl Into<String>, duration_us: u64) -> Self {
        Self {
            sample_rate,
            channels,
            mime: mime.into(),
            duration_us,
        }
    }

    /// Total duration in milliseconds.
    pub const fn duration_ms(&self) -> u64 {
        self.duration_us / 1000
    }
}
