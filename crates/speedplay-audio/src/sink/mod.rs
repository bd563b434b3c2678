//! Audio output sinks.
//!
//! An [`AudioSink`] owns one open output at a fixed sample rate and channel
//! layout and accepts interleaved 16-bit PCM without blocking.

pub mod memory;
pub mod output;

use std::sync::atomic::{AtomicU32, Ordering};

use speedplay_core::{Error, Result};

pub use memory::{MemorySink, MemorySinkProbe};
pub use output::{default_device_name, list_output_devices, CpalSink};

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-unique audio session id.
pub fn next_session_id() -> u32 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Speaker layout for a channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMask {
    Mono,
    Stereo,
    /// Stereo plus front center.
    Surround3,
    Quad,
    /// Quad plus front center.
    Surround5,
    FivePointOne,
    /// 5.1 plus back center.
    SixPointOne,
    SevenPointOne,
}

impl ChannelMask {
    pub fn for_channels(channels: u16) -> Result<Self> {
        Ok(match channels {
            1 => Self::Mono,
            2 => Self::Stereo,
            3 => Self::Surround3,
            4 => Self::Quad,
            5 => Self::Surround5,
            6 => Self::FivePointOne,
            7 => Self::SixPointOne,
            8 => Self::SevenPointOne,
            other => {
                return Err(Error::Configuration(format!(
                    "Unsupported channel count: {other}"
                )))
            }
        })
    }

    pub const fn channels(self) -> u16 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Surround3 => 3,
            Self::Quad => 4,
            Self::Surround5 => 5,
            Self::FivePointOne => 6,
            Self::SixPointOne => 7,
            Self::SevenPointOne => 8,
        }
    }
}

/// Parameters an [`AudioSink`] is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub mask: ChannelMask,
    /// Device queue length in frames.
    pub buffer_frames: usize,
    /// Output device name, `None` for the default device.
    pub device: Option<String>,
}

impl SinkConfig {
    pub fn new(
        sample_rate: u32,
        channels: u16,
        buffer_ms: u32,
        device: Option<String>,
    ) -> Result<Self> {
        let mask = ChannelMask::for_channels(channels)?;
        if sample_rate == 0 {
            return Err(Error::Configuration("Sample rate must not be zero".to_string()));
        }
        let buffer_frames = (u64::from(sample_rate) * u64::from(buffer_ms) / 1000) as usize;
        if buffer_frames == 0 {
            return Err(Error::Configuration(format!(
                "Device buffer of {buffer_ms} ms holds no frames at {sample_rate} Hz"
            )));
        }

        Ok(Self {
            sample_rate,
            channels,
            mask,
            buffer_frames,
            device,
        })
    }

    /// Device queue length in interleaved samples.
    pub const fn buffer_samples(&self) -> usize {
        self.buffer_frames * self.channels as usize
    }
}

/// Output device accepting interleaved 16-bit PCM.
pub trait AudioSink: Send {
    fn config(&self) -> &SinkConfig;

    /// Start or resume consuming queued audio.
    fn play(&mut self) -> Result<()>;

    /// Stop consuming, keeping queued audio.
    fn pause(&mut self) -> Result<()>;

    /// Stop consuming and drop queued audio.
    fn stop(&mut self) -> Result<()>;

    /// Drop queued audio without changing the play state.
    fn flush(&mut self);

    /// Queue as many whole frames as fit without blocking. Returns the number
    /// of samples accepted. An empty write only moves internally buffered
    /// audio towards the device.
    fn write(&mut self, samples: &[i16]) -> Result<usize>;

    /// No more audio follows; internally buffered audio may be emitted.
    fn end_of_stream(&mut self) -> Result<()>;

    /// Frames accepted but not yet played.
    fn queued_frames(&self) -> usize;

    /// Volume in 0.0..=1.0.
    fn set_volume(&mut self, volume: f32);

    fn session_id(&self) -> u32;

    /// Close the output. Calling it again has no effect.
    fn release(&mut self);
}
