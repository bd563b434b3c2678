//! The decode worker.
//!
//! One `speedplay-decode` thread per started session pulls compressed samples
//! from the [`MediaSource`], runs them through the [`Decoder`] and the
//! [`TimeStretch`] engine, and writes the result to the [`AudioSink`].
//!
//! All session handles live in one [`DecodeSession`] behind a single mutex.
//! One condition variable serves the pause/resume handshake, sink
//! backpressure, and the end-of-stream drain. Speed and state are atomics so
//! control calls never wait for a decode step to read them.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use speedplay_core::{clamp_speed, DataSource, Error, PlaybackState, Result, StateCell};
use tracing::{debug, error, info, trace, warn};

use crate::backend::MediaBackend;
use crate::config::PlayerConfig;
use crate::decode::{Decoder, DecoderOutput, PcmFormat};
use crate::events::{Notifier, PlayerEvent};
use crate::sink::{AudioSink, SinkConfig};
use crate::source::MediaSource;
use crate::stretch::TimeStretch;
use crate::wake::WakeState;

/// Outcome of one worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Work was done; run again right away.
    Progress,
    /// Waiting on the sink; run again after a short wait.
    Blocked,
    /// Input and output both ended and the sink has drained.
    Finished,
}

/// The live source, decoder, stretch engine and sink of one prepared stream.
pub struct DecodeSession {
    source: Box<dyn MediaSource>,
    decoder: Box<dyn Decoder>,
    sink: Box<dyn AudioSink>,
    stretch: TimeStretch,
    duration_ms: u64,
    sample_buf: Vec<u8>,
    /// Stretched PCM the sink has not accepted yet.
    pending: Vec<i16>,
    /// Source time of the first PCM chunk since the last flush.
    anchor_us: Option<u64>,
    /// Source time covered by the audio the sink accepted since the anchor.
    written_us: f64,
    last_end_us: u64,
    input_eos: bool,
    output_eos: bool,
    eos_signalled: bool,
}

impl DecodeSession {
    fn new(
        source: Box<dyn MediaSource>,
        decoder: Box<dyn Decoder>,
        sink: Box<dyn AudioSink>,
        stretch: TimeStretch,
        duration_ms: u64,
    ) -> Self {
        Self {
            source,
            decoder,
            sink,
            stretch,
            duration_ms,
            sample_buf: Vec::new(),
            pending: Vec::new(),
            anchor_us: None,
            written_us: 0.0,
            last_end_us: 0,
            input_eos: false,
            output_eos: false,
            eos_signalled: false,
        }
    }

    pub fn sink(&self) -> &dyn AudioSink {
        self.sink.as_ref()
    }

    pub fn sink_mut(&mut self) -> &mut dyn AudioSink {
        self.sink.as_mut()
    }

    /// Free every handle. Safe to call on a session that already stopped.
    pub fn release(&mut self) {
        self.decoder.stop();
        self.decoder.release();
        if let Err(e) = self.sink.stop() {
            warn!("Failed to stop sink: {e}");
        }
        self.sink.release();
        self.source.release();
        self.pending.clear();
        debug!("Decode session released");
    }

    fn flush(&mut self) {
        debug!("Flushing decoder after seek");
        self.decoder.flush();
        self.stretch.clear();
        self.pending.clear();
        self.restart_playhead();
        self.input_eos = false;
        self.output_eos = false;
        self.eos_signalled = false;
    }

    fn restart_playhead(&mut self) {
        self.anchor_us = None;
        self.written_us = 0.0;
    }

    /// Source time covered by `frames` output frames stretched at `speed`.
    fn frames_to_us(&self, frames: usize, speed: f32) -> f64 {
        frames as f64 * f64::from(speed) * 1_000_000.0 / f64::from(self.sink.config().sample_rate)
    }

    /// Source time of the audio the sink is playing right now, once PCM from
    /// the current position has reached it.
    fn playhead_us(&self, speed: f32) -> Option<u64> {
        let anchor = self.anchor_us?;
        let queued_us = self.frames_to_us(self.sink.queued_frames(), speed);
        let played_us = (self.written_us - queued_us).max(0.0) as u64;
        Some((anchor + played_us).min(self.duration_ms * 1000))
    }

    fn publish_position(&self, shared: &Shared) {
        if let Some(position) = self.playhead_us(shared.speed()) {
            shared.position_us.store(position, Ordering::Release);
        }
    }

    fn step(&mut self, shared: &Shared) -> Result<Step> {
        if shared.flush_codec.swap(false, Ordering::AcqRel) {
            self.flush();
        }
        let speed = shared.speed();

        if !self.write_pending(speed)? {
            return Ok(Step::Blocked);
        }

        if self.output_eos {
            if !self.eos_signalled {
                self.sink.end_of_stream()?;
                self.eos_signalled = true;
            }
            self.sink.write(&[])?;
            return Ok(if self.sink.queued_frames() == 0 {
                Step::Finished
            } else {
                Step::Blocked
            });
        }

        self.stretch.set_speed(speed);
        let fed = self.feed()?;
        let drained = self.drain_decoder(shared)?;
        self.write_pending(speed)?;

        Ok(if fed || drained {
            Step::Progress
        } else {
            Step::Blocked
        })
    }

    /// Hand pending PCM to the sink. Returns true once nothing is left.
    fn write_pending(&mut self, speed: f32) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(true);
        }
        let written = self.sink.write(&self.pending)?;
        self.pending.drain(..written);
        let frames = written / usize::from(self.sink.config().channels);
        self.written_us += self.frames_to_us(frames, speed);
        Ok(self.pending.is_empty())
    }

    /// Submit one sample, or the end-of-stream marker, to the decoder.
    fn feed(&mut self) -> Result<bool> {
        if self.input_eos || !self.decoder.has_input_capacity() {
            return Ok(false);
        }

        match self.source.read_sample(&mut self.sample_buf)? {
            Some(info) => {
                trace!("Feeding sample at {} us ({} bytes)", info.timestamp_us, info.size);
                self.decoder.queue_input(&self.sample_buf, &info)?;
                self.last_end_us = info.end_us();
            }
            None => {
                debug!("Source exhausted, signalling end of input");
                self.decoder.queue_end_of_stream()?;
                self.input_eos = true;
            }
        }
        Ok(true)
    }

    /// Pull everything the decoder has ready through the stretch engine.
    fn drain_decoder(&mut self, shared: &Shared) -> Result<bool> {
        let mut progressed = false;
        loop {
            match self.decoder.dequeue_output() {
                DecoderOutput::Pcm(chunk) => {
                    progressed = true;
                    if self.anchor_us.is_none() && !chunk.samples.is_empty() {
                        self.anchor_us = Some(chunk.timestamp_us);
                    }
                    if chunk.samples.is_empty() {
                        self.stretch.flush();
                    } else {
                        self.stretch.write(&chunk.samples);
                    }
                    self.stretch.read_all(&mut self.pending);
                }
                DecoderOutput::FormatChanged(format) => {
                    progressed = true;
                    self.reconfigure(shared, format)?;
                }
                DecoderOutput::EndOfStream => {
                    self.stretch.flush();
                    self.stretch.read_all(&mut self.pending);
                    self.output_eos = true;
                    debug!("Decoder output ended");
                    return Ok(true);
                }
                DecoderOutput::TryAgainLater => return Ok(progressed),
            }
        }
    }

    /// Replace sink and stretch engine for a new PCM layout.
    fn reconfigure(&mut self, shared: &Shared, format: PcmFormat) -> Result<()> {
        info!(
            "Output format changed: {} Hz, {} channels",
            format.sample_rate, format.channels
        );
        if !self.pending.is_empty() {
            debug!("Dropping {} samples in the old layout", self.pending.len());
            self.pending.clear();
        }

        self.sink.stop()?;
        self.sink.release();

        let config = shared.sink_config(format.sample_rate, format.channels)?;
        self.sink = shared.backend.open_sink(&config)?;
        self.sink.set_volume(shared.volume());
        self.sink.play()?;
        self.stretch = TimeStretch::new(format.sample_rate, format.channels);
        self.restart_playhead();
        Ok(())
    }
}

/// State shared between the player, the decode worker and helper threads.
pub struct Shared {
    pub(crate) config: PlayerConfig,
    pub(crate) backend: Arc<dyn MediaBackend>,
    pub(crate) session: Mutex<Option<DecodeSession>>,
    /// Pause/resume, backpressure and drain handshakes.
    pub(crate) wakeup: Condvar,
    pub(crate) state: StateCell,
    pub(crate) continuing: AtomicBool,
    pub(crate) flush_codec: AtomicBool,
    pub(crate) position_us: AtomicU64,
    pub(crate) duration_ms: AtomicU64,
    /// Bumped on every teardown so stale async prepares can tell.
    pub(crate) generation: AtomicU64,
    speed_bits: AtomicU32,
    volume_bits: AtomicU32,
    /// Set once the session reported completion or failure.
    outcome_sent: AtomicBool,
    pub(crate) wake: Mutex<WakeState>,
    pub(crate) notifier: Notifier,
}

impl Shared {
    pub(crate) fn new(config: PlayerConfig, backend: Arc<dyn MediaBackend>) -> Result<Self> {
        let speed = clamp_speed(config.initial_speed);
        let volume = config.initial_volume.clamp(0.0, 1.0);
        Ok(Self {
            config,
            backend,
            session: Mutex::new(None),
            wakeup: Condvar::new(),
            state: StateCell::new(PlaybackState::Idle),
            continuing: AtomicBool::new(false),
            flush_codec: AtomicBool::new(false),
            position_us: AtomicU64::new(0),
            duration_ms: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            speed_bits: AtomicU32::new(speed.to_bits()),
            volume_bits: AtomicU32::new(volume.to_bits()),
            outcome_sent: AtomicBool::new(false),
            wake: Mutex::new(WakeState::default()),
            notifier: Notifier::new()?,
        })
    }

    pub(crate) fn speed(&self) -> f32 {
        f32::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_speed(&self, speed: f32) {
        self.speed_bits
            .store(clamp_speed(speed).to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        self.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    fn sink_config(&self, sample_rate: u32, channels: u16) -> Result<SinkConfig> {
        SinkConfig::new(
            sample_rate,
            channels,
            self.config.sink_buffer_ms,
            self.config.output_device.clone(),
        )
    }

    /// Open the source, read its format, and build decoder, sink and
    /// stretch engine for it.
    pub(crate) fn init_stream(&self, source: &DataSource) -> Result<DecodeSession> {
        debug!("Initializing stream for {source}");
        let media = self.backend.open_source(source)?;
        let track = media.track_format().clone();
        let format = track.stream_format()?;

        let mut decoder = self.backend.create_decoder(&track, &self.config)?;
        decoder.start()?;

        let sink_config = self.sink_config(format.sample_rate, format.channels)?;
        let mut sink = self.backend.open_sink(&sink_config)?;
        sink.set_volume(self.volume());

        let stretch = TimeStretch::new(format.sample_rate, format.channels);

        info!(
            "Stream ready: {} Hz, {} channels, {}, {} ms",
            format.sample_rate,
            format.channels,
            format.mime,
            format.duration_ms()
        );

        Ok(DecodeSession::new(
            media,
            decoder,
            sink,
            stretch,
            format.duration_ms(),
        ))
    }

    /// Make `session` the current one, playing from the start.
    pub(crate) fn install(&self, slot: &mut Option<DecodeSession>, session: DecodeSession) {
        self.duration_ms.store(session.duration_ms, Ordering::Release);
        self.position_us.store(0, Ordering::Release);
        self.flush_codec.store(false, Ordering::Release);
        *slot = Some(session);
    }

    /// Install a freshly opened session and raise `Prepared`, both under the
    /// session lock so a concurrent teardown cannot slip in between.
    ///
    /// Returns false and releases the session if the player was torn down or
    /// left `Preparing` while the stream was being opened.
    pub(crate) fn publish_prepared(&self, mut session: DecodeSession, generation: u64) -> bool {
        let mut guard = self.session.lock();
        if self.generation.load(Ordering::Acquire) != generation
            || !self.state.is(PlaybackState::Preparing)
        {
            drop(guard);
            session.release();
            return false;
        }

        self.install(&mut guard, session);
        if !self
            .state
            .transition(PlaybackState::Preparing, PlaybackState::Prepared)
        {
            if let Some(mut stale) = guard.take() {
                stale.release();
            }
            return false;
        }
        self.notifier.notify(PlayerEvent::Prepared);
        true
    }

    /// Move the current session to the sync point at or before `position_ms`,
    /// drop queued output, and ask the worker to flush before its next feed.
    pub(crate) fn seek(&self, position_ms: u64) {
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            debug!("Seek to {position_ms} ms ignored, no session");
            return;
        };

        match session.source.seek(position_ms.saturating_mul(1000)) {
            Ok(actual_us) => {
                self.position_us.store(actual_us, Ordering::Release);
                self.flush_codec.store(true, Ordering::Release);
                session.sink.flush();
                debug!("Seek to {} ms landed at {} us", position_ms, actual_us);
            }
            Err(e) => {
                drop(guard);
                self.fail(&e);
                return;
            }
        }
        drop(guard);
        self.wakeup.notify_all();
    }

    /// Route a failure: error state, no wake reservation, one `Error` event.
    pub(crate) fn fail(&self, err: &Error) {
        error!("Playback failed: {err}");
        self.continuing.store(false, Ordering::Release);
        self.state.set(PlaybackState::Error);
        self.wake.lock().stay_awake(false);
        if !self.outcome_sent.swap(true, Ordering::AcqRel) {
            self.notifier.notify(PlayerEvent::Error);
        }
        self.wakeup.notify_all();
    }

    /// Start a new outcome cycle, for example after a failed session was torn down.
    pub(crate) fn clear_outcome(&self) {
        self.outcome_sent.store(false, Ordering::Release);
    }

    fn complete(&self, session: &mut DecodeSession) {
        if !self.continuing.swap(false, Ordering::AcqRel) {
            return;
        }
        session.decoder.stop();
        if let Err(e) = session.sink.stop() {
            warn!("Failed to stop sink after completion: {e}");
        }
        self.position_us
            .fetch_max(session.last_end_us, Ordering::AcqRel);
        self.state.set(PlaybackState::PlaybackCompleted);
        self.wake.lock().stay_awake(false);
        info!("Playback completed");
        if !self.outcome_sent.swap(true, Ordering::AcqRel) {
            self.notifier.notify(PlayerEvent::Completion);
        }
    }
}

/// Body of the decode worker thread. Returns when the session completes,
/// fails, or `continuing` is cleared.
pub(crate) fn run(shared: &Shared) {
    let poll = shared.config.poll_interval();
    let mut guard = shared.session.lock();
    debug!("Decode worker started");

    loop {
        if !shared.continuing.load(Ordering::Acquire) {
            break;
        }
        if shared.state.is(PlaybackState::Paused) {
            shared.wakeup.wait(&mut guard);
            continue;
        }
        let Some(session) = guard.as_mut() else {
            warn!("Decode worker has no session");
            break;
        };

        match session.step(shared) {
            Ok(Step::Progress) => {
                session.publish_position(shared);
                MutexGuard::bump(&mut guard);
            }
            Ok(Step::Blocked) => {
                session.publish_position(shared);
                shared.wakeup.wait_for(&mut guard, poll);
            }
            Ok(Step::Finished) => {
                shared.complete(session);
                break;
            }
            Err(e) => {
                drop(guard);
                shared.fail(&e);
                debug!("Decode worker stopped after error");
                return;
            }
        }
    }

    drop(guard);
    debug!("Decode worker stopped");
}
