//! Synthetic media for driving a [`SpeedPlayer`] without files or devices.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity
#![allow(dead_code)] // Each test binary uses a different subset

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use speedplay_audio::{
    AudioSink, Decoder, MediaBackend, MediaSource, MemorySink, MemorySinkProbe, PlayerConfig,
    PlayerEvent, SampleInfo, SinkConfig, SpeedPlayer, SymphoniaDecoder, TrackFormat,
};
use speedplay_core::{DataSource, Error, Result};
use symphonia::core::audio::Channels;
use symphonia::core::codecs::{CodecParameters, CODEC_TYPE_PCM_S16LE};
use symphonia::core::units::TimeBase;

pub const RATE: u32 = 8000;
pub const FRAMES_PER_PACKET: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wave {
    /// Frame `i` has the value `i % 32768`.
    Ramp,
    /// 440 Hz sine.
    Sine,
}

/// Shape of a synthetic PCM track.
#[derive(Debug, Clone)]
pub struct Tone {
    pub duration_ms: u64,
    pub channels: u16,
    pub wave: Wave,
    /// Packets between sync points.
    pub sync_every: u64,
    /// Sample rate the container claims, if different from the real one.
    pub declared_rate: Option<u32>,
    pub omit_duration: bool,
    /// Reading fails once this many packets were served.
    pub fail_after_packets: Option<u64>,
}

impl Tone {
    pub const fn ramp(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            channels: 1,
            wave: Wave::Ramp,
            sync_every: 8,
            declared_rate: None,
            omit_duration: false,
            fail_after_packets: None,
        }
    }

    pub const fn sine(duration_ms: u64) -> Self {
        Self {
            wave: Wave::Sine,
            ..Self::ramp(duration_ms)
        }
    }

    pub const fn total_frames(&self) -> u64 {
        self.duration_ms * RATE as u64 / 1000
    }

    pub fn sample(&self, frame: u64) -> i16 {
        match self.wave {
            Wave::Ramp => (frame % 32_768) as i16,
            Wave::Sine => {
                let t = frame as f32 / RATE as f32;
                ((TAU * 440.0 * t).sin() * 8000.0) as i16
            }
        }
    }

    /// Every interleaved sample of the track, in order.
    pub fn samples(&self) -> Vec<i16> {
        (0..self.total_frames())
            .flat_map(|frame| std::iter::repeat(self.sample(frame)).take(self.channels.into()))
            .collect()
    }

    fn track_format(&self) -> TrackFormat {
        let channels = if self.channels == 2 {
            Channels::FRONT_LEFT | Channels::FRONT_RIGHT
        } else {
            Channels::FRONT_LEFT
        };
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_PCM_S16LE)
            .with_sample_rate(RATE)
            .with_time_base(TimeBase::new(1, RATE))
            .with_n_frames(self.total_frames())
            .with_bits_per_sample(16)
            .with_bits_per_coded_sample(16)
            .with_max_frames_per_packet(FRAMES_PER_PACKET)
            .with_channels(channels);

        let mut format = TrackFormat::from_codec_params(0, &params);
        if let Some(rate) = self.declared_rate {
            format.sample_rate = Some(rate);
        }
        if self.omit_duration {
            format.duration_us = None;
        }
        format
    }
}

/// [`MediaSource`] serving a [`Tone`] as 16-bit little-endian PCM packets.
pub struct ToneSource {
    tone: Tone,
    format: TrackFormat,
    next_packet: u64,
    position_us: u64,
    released: bool,
}

impl ToneSource {
    pub fn new(tone: Tone) -> Self {
        let format = tone.track_format();
        Self {
            tone,
            format,
            next_packet: 0,
            position_us: 0,
            released: false,
        }
    }

    fn packet_us(packet: u64) -> u64 {
        packet * FRAMES_PER_PACKET * 1_000_000 / u64::from(RATE)
    }
}

impl MediaSource for ToneSource {
    fn track_format(&self) -> &TrackFormat {
        &self.format
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleInfo>> {
        let start = self.next_packet * FRAMES_PER_PACKET;
        let end = (start + FRAMES_PER_PACKET).min(self.tone.total_frames());
        if self.released || start >= end {
            return Ok(None);
        }
        if self.tone.fail_after_packets == Some(self.next_packet) {
            return Err(Error::Source(format!(
                "Synthetic read failure at packet {}",
                self.next_packet
            )));
        }

        buf.clear();
        for frame in start..end {
            let value = self.tone.sample(frame).to_le_bytes();
            for _ in 0..self.tone.channels {
                buf.extend_from_slice(&value);
            }
        }

        let timestamp_us = Self::packet_us(self.next_packet);
        let info = SampleInfo {
            timestamp_us,
            duration_us: (end - start) * 1_000_000 / u64::from(RATE),
            ts: start,
            dur: end - start,
            size: buf.len(),
        };
        self.next_packet += 1;
        self.position_us = timestamp_us;
        Ok(Some(info))
    }

    fn position_us(&self) -> u64 {
        self.position_us
    }

    fn seek(&mut self, timestamp_us: u64) -> Result<u64> {
        let frame = (timestamp_us * u64::from(RATE) / 1_000_000).min(self.tone.total_frames());
        let packet = frame / FRAMES_PER_PACKET;
        self.next_packet = packet - packet % self.tone.sync_every;
        self.position_us = Self::packet_us(self.next_packet);
        Ok(self.position_us)
    }

    fn release(&mut self) {
        self.released = true;
    }
}

/// Backend producing [`ToneSource`]s, real PCM decoders and [`MemorySink`]s.
pub struct SyntheticBackend {
    tone: Tone,
    paced: bool,
    open_delay: Duration,
    sinks: Mutex<Vec<MemorySinkProbe>>,
}

impl SyntheticBackend {
    pub fn new(tone: Tone) -> Arc<Self> {
        Self::build(tone, false, Duration::ZERO)
    }

    /// Sinks consume audio in real time.
    pub fn paced(tone: Tone) -> Arc<Self> {
        Self::build(tone, true, Duration::ZERO)
    }

    /// Opening a source takes `delay`.
    pub fn slow(tone: Tone, delay: Duration) -> Arc<Self> {
        Self::build(tone, false, delay)
    }

    fn build(tone: Tone, paced: bool, open_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tone,
            paced,
            open_delay,
            sinks: Mutex::new(Vec::new()),
        })
    }

    /// Every sink opened so far, oldest first.
    pub fn sinks(&self) -> Vec<MemorySinkProbe> {
        self.sinks.lock().clone()
    }

    pub fn last_sink(&self) -> MemorySinkProbe {
        self.sinks.lock().last().cloned().unwrap()
    }
}

impl MediaBackend for SyntheticBackend {
    fn open_source(&self, _source: &DataSource) -> Result<Box<dyn MediaSource>> {
        std::thread::sleep(self.open_delay);
        Ok(Box::new(ToneSource::new(self.tone.clone())))
    }

    fn create_decoder(
        &self,
        format: &TrackFormat,
        config: &PlayerConfig,
    ) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(SymphoniaDecoder::new(format, config)?))
    }

    fn open_sink(&self, config: &SinkConfig) -> Result<Box<dyn AudioSink>> {
        let sink = if self.paced {
            MemorySink::paced(config.clone())
        } else {
            MemorySink::new(config.clone())
        };
        self.sinks.lock().push(sink.probe());
        Ok(Box::new(sink))
    }
}

pub fn source() -> DataSource {
    DataSource::parse("/synthetic/tone.pcm").unwrap()
}

pub fn player(backend: &Arc<SyntheticBackend>) -> SpeedPlayer {
    let backend: Arc<dyn MediaBackend> = backend.clone();
    SpeedPlayer::with_backend(PlayerConfig::default(), backend).unwrap()
}

/// Block until `expected` arrives, failing on any other event.
pub fn expect_event(events: &Receiver<PlayerEvent>, expected: PlayerEvent, timeout: Duration) {
    let event = events
        .recv_timeout(timeout)
        .unwrap_or_else(|_| panic!("no {expected:?} event within {timeout:?}"));
    assert_eq!(event, expected);
}

/// Assert that no event arrives within `window`.
pub fn expect_quiet(events: &Receiver<PlayerEvent>, window: Duration) {
    if let Ok(event) = events.recv_timeout(window) {
        panic!("unexpected {event:?} event");
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
