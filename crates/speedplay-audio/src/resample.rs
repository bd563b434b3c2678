//! Sample-rate conversion to the output device rate using rubato.

use rubato::{FftFixedIn, Resampler as RubatoResampler};
use speedplay_core::{Error, Result};
use tracing::debug;

/// Input frames per resampler call.
const CHUNK_FRAMES: usize = 1024;

/// Streaming resampler for interleaved `f32` audio.
///
/// Input accumulates until a whole chunk is available; [`Resampler::flush`]
/// pads and emits the tail.
pub struct Resampler {
    #[allow(clippy::struct_field_names)]
    resampler: FftFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Deinterleaved input waiting for a full chunk.
    pending: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        let resampler = FftFixedIn::new(
            input_rate as usize,
            output_rate as usize,
            CHUNK_FRAMES,
            2,
            channels,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to create resampler: {e}")))?;

        debug!(
            "Resampler created: {}Hz -> {}Hz, {} channels",
            input_rate, output_rate, channels
        );

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels,
            pending: vec![Vec::with_capacity(CHUNK_FRAMES * 2); channels],
        })
    }

    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Input frames buffered but not yet converted.
    pub fn pending_frames(&self) -> usize {
        self.pending.first().map_or(0, Vec::len)
    }

    /// Convert interleaved input, appending every completed chunk to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        for frame in input.chunks_exact(self.channels) {
            for (plane, &sample) in self.pending.iter_mut().zip(frame) {
                plane.push(sample);
            }
        }

        while self.pending_frames() >= CHUNK_FRAMES {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|plane| plane.drain(..CHUNK_FRAMES).collect())
                .collect();
            self.convert(&chunk, usize::MAX, out)?;
        }
        Ok(())
    }

    /// Pad and convert whatever is buffered, keeping only the output that
    /// corresponds to real input.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let remaining = self.pending_frames();
        if remaining == 0 {
            return Ok(());
        }

        let chunk: Vec<Vec<f32>> = self
            .pending
            .iter_mut()
            .map(|plane| {
                let mut data = std::mem::take(plane);
                data.resize(CHUNK_FRAMES, 0.0);
                data
            })
            .collect();

        let frames = (remaining as f64 * f64::from(self.output_rate)
            / f64::from(self.input_rate))
        .round() as usize;
        self.convert(&chunk, frames, out)
    }

    /// Drop buffered input and filter state.
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.iter_mut().for_each(Vec::clear);
    }

    fn convert(&mut self, chunk: &[Vec<f32>], max_frames: usize, out: &mut Vec<f32>) -> Result<()> {
        let resampled = self
            .resampler
            .process(chunk, None)
            .map_err(|e| Error::AudioOutput(format!("Resample failed: {e}")))?;

        let frames = resampled.first().map_or(0, Vec::len).min(max_frames);
        out.reserve(frames * self.channels);
        for frame in 0..frames {
            for plane in &resampled {
                out.push(plane[frame]);
            }
        }
        Ok(())
    }
}
