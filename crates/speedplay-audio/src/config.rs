//! Player configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use speedplay_core::{Error, Result, MAX_SPEED, MIN_SPEED};

/// Tunables for a [`SpeedPlayer`](crate::SpeedPlayer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Length of the output device queue in milliseconds.
    pub sink_buffer_ms: u32,
    /// Maximum number of decoded chunks held by the decoder before it
    /// stops accepting input.
    pub decoder_queue_depth: usize,
    /// Wait used by the decode worker while the sink is full or draining.
    pub poll_interval_ms: u64,
    /// Playback speed applied when the player is created.
    pub initial_speed: f32,
    /// Volume applied when the player is created.
    pub initial_volume: f32,
    /// Output device name. `None` selects the host default.
    pub output_device: Option<String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sink_buffer_ms: 250,
            decoder_queue_depth: 4,
            poll_interval_ms: 5,
            initial_speed: 1.0,
            initial_volume: 1.0,
            output_device: None,
        }
    }
}

impl PlayerConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.sink_buffer_ms == 0 {
            return Err(Error::Configuration(
                "sink_buffer_ms must be greater than zero".to_string(),
            ));
        }
        if self.decoder_queue_depth == 0 {
            return Err(Error::Configuration(
                "decoder_queue_depth must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Configuration(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&self.initial_speed) {
            return Err(Error::Configuration(format!(
                "initial_speed {} is outside {MIN_SPEED}..={MAX_SPEED}",
                self.initial_speed
            )));
        }
        if !(0.0..=1.0).contains(&self.initial_volume) {
            return Err(Error::Configuration(format!(
                "initial_volume {} is outside 0.0..=1.0",
                self.initial_volume
            )));
        }
        Ok(())
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
