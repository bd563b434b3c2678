//! Audio output using cpal.
//!
//! The `cpal::Stream` is not `Send`, so each sink owns a dedicated output
//! thread that builds the stream, reports the device format back, and keeps
//! the stream alive until the sink is released. Samples reach the device
//! callback through a lock-free ring buffer in device format.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use speedplay_core::{Error, Result};
use tracing::{debug, error, info, trace, warn};

use super::{next_session_id, AudioSink, SinkConfig};
use crate::buffer::{shared_ring_buffer, SharedRingBuffer};
use crate::resample::Resampler;

const NO_FLUSH: usize = usize::MAX;

/// State shared between the sink and its device callback.
struct DeviceShared {
    ring: SharedRingBuffer,
    playing: AtomicBool,
    volume: AtomicU32,
    /// Ring position to discard up to, or `NO_FLUSH`.
    flush_to: AtomicUsize,
}

impl DeviceShared {
    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }
}

/// Format the device stream was opened with.
#[derive(Debug, Clone, Copy)]
struct DeviceFormat {
    sample_rate: u32,
    channels: u16,
}

/// [`AudioSink`] playing through a cpal output device.
pub struct CpalSink {
    config: SinkConfig,
    device_format: DeviceFormat,
    device_name: String,
    session_id: u32,
    shared: Arc<DeviceShared>,
    resampler: Option<Resampler>,
    /// Converted samples the ring could not take yet.
    backlog: Vec<f32>,
    scratch: Vec<f32>,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Open the configured output device.
    pub fn open(config: &SinkConfig) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<(Arc<DeviceShared>, DeviceFormat, String)>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let requested = DeviceFormat {
            sample_rate: config.sample_rate,
            channels: config.channels,
        };
        let wanted_device = config.device.clone();
        let buffer_frames = config.buffer_frames;

        let thread = std::thread::Builder::new()
            .name("speedplay-output".to_string())
            .spawn(move || {
                match open_stream(wanted_device.as_deref(), requested, buffer_frames) {
                    Ok((stream, shared, format, name)) => {
                        if ready_tx.send(Ok((shared, format, name))).is_err() {
                            return;
                        }
                        // Keep the stream alive until the sink is released
                        let _ = shutdown_rx.recv();
                        drop(stream);
                        debug!("Output stream closed");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn output thread: {e}")))?;

        let (shared, device_format, device_name) = ready_rx
            .recv()
            .map_err(|_| Error::AudioOutput("Output thread exited during setup".to_string()))??;

        let resampler = if device_format.sample_rate == config.sample_rate {
            None
        } else {
            Some(Resampler::new(
                config.sample_rate,
                device_format.sample_rate,
                usize::from(device_format.channels),
            )?)
        };

        info!(
            "Audio output opened on {}: stream {}Hz/{}ch, device {}Hz/{}ch",
            device_name,
            config.sample_rate,
            config.channels,
            device_format.sample_rate,
            device_format.channels
        );

        Ok(Self {
            config: config.clone(),
            device_format,
            device_name,
            session_id: next_session_id(),
            shared,
            resampler,
            backlog: Vec::new(),
            scratch: Vec::new(),
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn device_channels(&self) -> usize {
        usize::from(self.device_format.channels)
    }

    /// Move backlog into the ring. Returns true when the backlog is empty.
    fn pump(&mut self) -> bool {
        if self.backlog.is_empty() {
            return true;
        }
        let pushed = self.shared.ring.push(&self.backlog);
        self.backlog.drain(..pushed);
        self.backlog.is_empty()
    }

    /// Source frames that fit into the ring right now.
    fn free_source_frames(&self) -> usize {
        let device_frames = self.shared.ring.free() / self.device_channels();
        let ratio =
            f64::from(self.config.sample_rate) / f64::from(self.device_format.sample_rate);
        (device_frames as f64 * ratio) as usize
    }

    fn request_flush(&mut self) {
        self.backlog.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.shared
            .flush_to
            .store(self.shared.ring.write_position(), Ordering::Release);
    }
}

impl AudioSink for CpalSink {
    fn config(&self) -> &SinkConfig {
        &self.config
    }

    fn play(&mut self) -> Result<()> {
        self.shared.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.shared.playing.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.shared.playing.store(false, Ordering::Release);
        self.request_flush();
        Ok(())
    }

    fn flush(&mut self) {
        self.request_flush();
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        if !self.pump() || samples.is_empty() {
            return Ok(0);
        }

        let in_channels = usize::from(self.config.channels);
        let frames = (samples.len() / in_channels).min(self.free_source_frames());
        if frames == 0 {
            return Ok(0);
        }
        let accepted = &samples[..frames * in_channels];

        let converted = map_channels(accepted, in_channels, self.device_channels());
        self.scratch.clear();
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&converted, &mut self.scratch)?,
            None => self.scratch.extend_from_slice(&converted),
        }

        let pushed = self.shared.ring.push(&self.scratch);
        self.backlog.extend_from_slice(&self.scratch[pushed..]);
        trace!("Queued {} frames to {}", frames, self.device_name);
        Ok(accepted.len())
    }

    fn end_of_stream(&mut self) -> Result<()> {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.flush(&mut self.backlog)?;
        }
        self.pump();
        Ok(())
    }

    fn queued_frames(&self) -> usize {
        // Samples behind a pending flush mark are already gone.
        let flush_to = self.shared.flush_to.load(Ordering::Acquire);
        let ring = if flush_to == NO_FLUSH {
            self.shared.ring.len()
        } else {
            self.shared
                .ring
                .write_position()
                .wrapping_sub(flush_to)
                .min(self.shared.ring.len())
        };
        let device_samples = ring + self.backlog.len();
        let device_frames = device_samples / self.device_channels();
        let ratio =
            f64::from(self.config.sample_rate) / f64::from(self.device_format.sample_rate);
        let pending = self.resampler.as_ref().map_or(0, Resampler::pending_frames);
        (device_frames as f64 * ratio).ceil() as usize + pending
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn release(&mut self) {
        self.shared.playing.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Output thread panicked");
            }
            debug!("Audio output released: {}", self.device_name);
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Convert interleaved `i16` to `f32` with a new channel count.
///
/// Mono is duplicated to every output channel, stereo folds to mono by
/// averaging, and other layouts keep the channels they share.
fn map_channels(samples: &[i16], in_channels: usize, out_channels: usize) -> Vec<f32> {
    let scale = 1.0 / 32_768.0;
    let frames = samples.len() / in_channels;
    let mut out = Vec::with_capacity(frames * out_channels);

    for frame in samples.chunks_exact(in_channels) {
        if in_channels == out_channels {
            out.extend(frame.iter().map(|&s| f32::from(s) * scale));
        } else if in_channels == 1 {
            let value = f32::from(frame[0]) * scale;
            out.extend(std::iter::repeat(value).take(out_channels));
        } else if out_channels == 1 {
            let sum: f32 = frame.iter().map(|&s| f32::from(s)).sum();
            out.push(sum / in_channels as f32 * scale);
        } else {
            for c in 0..out_channels {
                out.push(frame.get(c).map_or(0.0, |&s| f32::from(s) * scale));
            }
        }
    }
    out
}

type OpenedStream = (Stream, Arc<DeviceShared>, DeviceFormat, String);

fn open_stream(
    wanted_device: Option<&str>,
    requested: DeviceFormat,
    buffer_frames: usize,
) -> Result<OpenedStream> {
    let device = find_device(wanted_device)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let (config, sample_format) = choose_config(&device, requested)?;
    let format = DeviceFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };
    debug!(
        "Output config for {}: {:?}, {:?}",
        device_name, config, sample_format
    );

    let device_frames = (buffer_frames as u64 * u64::from(format.sample_rate)
        / u64::from(requested.sample_rate.max(1))) as usize;
    let shared = Arc::new(DeviceShared {
        ring: shared_ring_buffer(device_frames.max(1024) * usize::from(format.channels)),
        playing: AtomicBool::new(false),
        volume: AtomicU32::new(1.0f32.to_bits()),
        flush_to: AtomicUsize::new(NO_FLUSH),
    });

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, Arc::clone(&shared))?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, Arc::clone(&shared))?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, Arc::clone(&shared))?,
        _ => {
            return Err(Error::AudioOutput(format!(
                "Unsupported sample format: {sample_format:?}"
            )));
        }
    };

    stream
        .play()
        .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {e}")))?;

    Ok((stream, shared, format, device_name))
}

fn find_device(wanted: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match wanted {
        None => host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("No output device found".to_string())),
        Some(name) => host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| Error::AudioOutput(format!("Output device not found: {name}"))),
    }
}

/// Prefer a device config with the stream's own rate and channel count,
/// falling back to the device default.
fn choose_config(device: &Device, requested: DeviceFormat) -> Result<(StreamConfig, SampleFormat)> {
    let rate = cpal::SampleRate(requested.sample_rate);
    if let Ok(ranges) = device.supported_output_configs() {
        let mut matching: Vec<_> = ranges
            .filter(|r| {
                r.channels() == requested.channels
                    && r.min_sample_rate() <= rate
                    && rate <= r.max_sample_rate()
            })
            .collect();
        matching.sort_by_key(|r| r.sample_format() != SampleFormat::F32);
        if let Some(range) = matching.into_iter().next() {
            let supported = range.with_sample_rate(rate);
            return Ok((supported.config(), supported.sample_format()));
        }
    }

    warn!(
        "Device has no {}Hz/{}ch config, converting",
        requested.sample_rate, requested.channels
    );
    let supported = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("Failed to get output config: {e}")))?;
    Ok((supported.config(), supported.sample_format()))
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &Device,
    config: &StreamConfig,
    shared: Arc<DeviceShared>,
) -> Result<Stream> {
    let err_fn = |err| {
        error!("Audio stream error: {err}");
    };
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let flush_to = shared.flush_to.swap(NO_FLUSH, Ordering::AcqRel);
                if flush_to != NO_FLUSH {
                    shared.ring.skip_to(flush_to);
                }

                if !shared.playing.load(Ordering::Acquire) {
                    // Output silence when not playing
                    for sample in data.iter_mut() {
                        *sample = T::from_sample(0.0f32);
                    }
                    return;
                }

                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let read = shared.ring.pop(&mut scratch[..data.len()]);
                let volume = shared.volume();

                for (i, sample) in data.iter_mut().enumerate() {
                    if i < read {
                        let s = scratch[i] * volume;
                        // Soft clipping using tanh for smooth limiting
                        let limited = if s.abs() > 0.9 { s.tanh() } else { s };
                        *sample = T::from_sample(limited);
                    } else {
                        *sample = T::from_sample(0.0f32);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {e}")))
}

/// List available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// Get the default output device name.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    host.default_output_device().and_then(|d| d.name().ok())
}
