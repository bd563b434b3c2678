//! Audio decoding using symphonia.
//!
//! The [`Decoder`] trait follows a queue-based codec contract: compressed
//! samples go in, decoded PCM chunks, format changes and an end-of-stream
//! marker come out. Input is refused while the output queue is full, which
//! gives the decode worker its backpressure.

use std::collections::VecDeque;

use speedplay_core::{Error, Result};
use symphonia::core::{
    audio::{SampleBuffer, SignalSpec},
    codecs::{Decoder as SymphoniaCodec, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::Packet,
};
use tracing::{debug, trace, warn};

use crate::config::PlayerConfig;
use crate::source::{SampleInfo, TrackFormat};

/// Layout of decoded PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// One chunk of decoded, interleaved 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    pub samples: Vec<i16>,
    /// Presentation time of the first frame in microseconds.
    pub timestamp_us: u64,
}

/// Result of polling a decoder for output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderOutput {
    Pcm(PcmChunk),
    /// Chunks after this one use a new layout.
    FormatChanged(PcmFormat),
    /// Everything before the end-of-stream marker has been emitted.
    EndOfStream,
    /// Nothing available right now.
    TryAgainLater,
}

/// Stateful audio codec.
pub trait Decoder: Send {
    /// Begin accepting input.
    fn start(&mut self) -> Result<()>;

    /// Whether [`Decoder::queue_input`] would accept a sample now.
    fn has_input_capacity(&self) -> bool;

    /// Submit one compressed sample.
    fn queue_input(&mut self, data: &[u8], info: &SampleInfo) -> Result<()>;

    /// Mark the end of input. Pending output drains, then
    /// [`DecoderOutput::EndOfStream`] is reported once.
    fn queue_end_of_stream(&mut self) -> Result<()>;

    /// Poll for the next output.
    fn dequeue_output(&mut self) -> DecoderOutput;

    /// Drop all queued input and output and reset codec state.
    fn flush(&mut self);

    /// Stop accepting input. `start` may be called again.
    fn stop(&mut self);

    /// Free codec resources. Calling it again has no effect.
    fn release(&mut self);
}

/// [`Decoder`] wrapping a symphonia codec.
pub struct SymphoniaDecoder {
    codec: Option<Box<dyn SymphoniaCodec>>,
    track_id: u32,
    queue: VecDeque<DecoderOutput>,
    queue_depth: usize,
    output_format: PcmFormat,
    sample_buf: Option<(SampleBuffer<i16>, SignalSpec)>,
    started: bool,
    input_ended: bool,
    end_reported: bool,
}

impl SymphoniaDecoder {
    /// Create a decoder for the given track.
    pub fn new(format: &TrackFormat, config: &PlayerConfig) -> Result<Self> {
        let codec = symphonia::default::get_codecs()
            .make(&format.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Codec(format!("Failed to create decoder: {e}")))?;

        let output_format = PcmFormat {
            sample_rate: format.sample_rate.unwrap_or_default(),
            channels: format.channels.unwrap_or_default(),
        };
        debug!(
            "Decoder created for track {}: {:?}",
            format.track_id, output_format
        );

        Ok(Self {
            codec: Some(codec),
            track_id: format.track_id,
            queue: VecDeque::with_capacity(config.decoder_queue_depth + 1),
            queue_depth: config.decoder_queue_depth.max(1),
            output_format,
            sample_buf: None,
            started: false,
            input_ended: false,
            end_reported: false,
        })
    }

    /// Layout of the chunks most recently emitted.
    pub const fn output_format(&self) -> PcmFormat {
        self.output_format
    }

    fn pcm_chunk_count(&self) -> usize {
        self.queue
            .iter()
            .filter(|out| matches!(out, DecoderOutput::Pcm(_)))
            .count()
    }

    fn decode_packet(&mut self, packet: &Packet, timestamp_us: u64) -> Result<()> {
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| Error::Codec("Decoder already released".to_string()))?;

        let decoded = match codec.decode(packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                // Log and skip corrupt frames
                warn!("Decode error (skipping): {e}");
                return Ok(());
            }
            Err(SymphoniaError::ResetRequired) => {
                warn!("Decoder reset required, resetting");
                codec.reset();
                return Ok(());
            }
            Err(e) => return Err(Error::Codec(format!("Decode failed: {e}"))),
        };

        let spec = *decoded.spec();
        let format = PcmFormat {
            sample_rate: spec.rate,
            channels: spec.channels.count() as u16,
        };
        if format != self.output_format {
            debug!(
                "Output format changed: {:?} -> {:?}",
                self.output_format, format
            );
            self.output_format = format;
            self.queue.push_back(DecoderOutput::FormatChanged(format));
        }

        if decoded.frames() == 0 {
            return Ok(());
        }

        let needed = decoded.capacity() * spec.channels.count();
        let reuse = matches!(&self.sample_buf, Some((buf, old)) if *old == spec && buf.capacity() >= needed);
        if !reuse {
            self.sample_buf = Some((SampleBuffer::new(decoded.capacity() as u64, spec), spec));
        }
        let Some((buf, _)) = self.sample_buf.as_mut() else {
            return Ok(());
        };
        buf.copy_interleaved_ref(decoded);

        trace!("Decoded {} samples at {} us", buf.len(), timestamp_us);
        self.queue.push_back(DecoderOutput::Pcm(PcmChunk {
            samples: buf.samples().to_vec(),
            timestamp_us,
        }));
        Ok(())
    }
}

impl Decoder for SymphoniaDecoder {
    fn start(&mut self) -> Result<()> {
        if self.codec.is_none() {
            return Err(Error::Codec("Decoder already released".to_string()));
        }
        self.started = true;
        Ok(())
    }

    fn has_input_capacity(&self) -> bool {
        self.started && !self.input_ended && self.pcm_chunk_count() < self.queue_depth
    }

    fn queue_input(&mut self, data: &[u8], info: &SampleInfo) -> Result<()> {
        if !self.started {
            return Err(Error::Codec("Decoder is not started".to_string()));
        }
        if self.input_ended {
            return Err(Error::Codec("Input queued after end of stream".to_string()));
        }
        let packet = Packet::new_from_slice(self.track_id, info.ts, info.dur, data);
        self.decode_packet(&packet, info.timestamp_us)
    }

    fn queue_end_of_stream(&mut self) -> Result<()> {
        if !self.started {
            return Err(Error::Codec("Decoder is not started".to_string()));
        }
        if !self.input_ended {
            if let Some(codec) = self.codec.as_mut() {
                codec.finalize();
            }
            self.input_ended = true;
        }
        Ok(())
    }

    fn dequeue_output(&mut self) -> DecoderOutput {
        if let Some(output) = self.queue.pop_front() {
            return output;
        }
        if self.input_ended && !self.end_reported {
            self.end_reported = true;
            return DecoderOutput::EndOfStream;
        }
        DecoderOutput::TryAgainLater
    }

    fn flush(&mut self) {
        self.queue.clear();
        if let Some(codec) = self.codec.as_mut() {
            codec.reset();
        }
        self.input_ended = false;
        self.end_reported = false;
        trace!("Decoder flushed");
    }

    fn stop(&mut self) {
        self.started = false;
        self.queue.clear();
    }

    fn release(&mut self) {
        self.stop();
        if self.codec.take().is_some() {
            debug!("Decoder released");
        }
    }
}
