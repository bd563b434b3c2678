//! Factory seam for the media collaborators a player needs.

use speedplay_core::{DataSource, Result};

use crate::config::PlayerConfig;
use crate::decode::{Decoder, SymphoniaDecoder};
use crate::sink::{AudioSink, CpalSink, SinkConfig};
use crate::source::{MediaSource, SymphoniaSource, TrackFormat};

/// Creates sources, decoders and sinks for a player.
pub trait MediaBackend: Send + Sync {
    fn open_source(&self, source: &DataSource) -> Result<Box<dyn MediaSource>>;

    fn create_decoder(
        &self,
        format: &TrackFormat,
        config: &PlayerConfig,
    ) -> Result<Box<dyn Decoder>>;

    fn open_sink(&self, config: &SinkConfig) -> Result<Box<dyn AudioSink>>;
}

/// Symphonia demuxing and decoding with cpal output.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl MediaBackend for SystemBackend {
    fn open_source(&self, source: &DataSource) -> Result<Box<dyn MediaSource>> {
        Ok(Box::new(SymphoniaSource::open(source)?))
    }

    fn create_decoder(
        &self,
        format: &TrackFormat,
        config: &PlayerConfig,
    ) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(SymphoniaDecoder::new(format, config)?))
    }

    fn open_sink(&self, config: &SinkConfig) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(CpalSink::open(config)?))
    }
}
