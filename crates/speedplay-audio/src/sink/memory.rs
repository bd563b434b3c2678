//! In-process sink that records what it plays.
//!
//! Used for headless playback and tests. With pacing enabled the sink
//! consumes audio at its configured sample rate against the wall clock, the
//! way a device would; otherwise queued audio is "played" as soon as the sink
//! is playing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use speedplay_core::Result;
use tracing::trace;

use super::{next_session_id, AudioSink, SinkConfig};

#[derive(Debug)]
struct MemoryState {
    queue: VecDeque<i16>,
    played: Vec<i16>,
    playing: bool,
    volume: f32,
    flushes: usize,
    stops: usize,
    ended: bool,
    released: bool,
    /// Start of the current paced run and frames consumed since then.
    clock: Option<(Instant, u64)>,
}

impl MemoryState {
    fn advance(&mut self, sample_rate: u32, channels: usize, paced: bool) {
        if !self.playing {
            return;
        }
        if !paced {
            self.played.extend(self.queue.drain(..));
            return;
        }

        let now = Instant::now();
        let (start, consumed) = *self.clock.get_or_insert((now, 0));
        let due = (now.duration_since(start).as_secs_f64() * f64::from(sample_rate)) as u64;
        let wanted = due.saturating_sub(consumed);
        let queued = (self.queue.len() / channels) as u64;
        let take = wanted.min(queued);

        self.played
            .extend(self.queue.drain(..take as usize * channels));
        if wanted > queued {
            // Underrun: time spent starved is lost, as on a device.
            self.clock = Some((now, 0));
        } else {
            self.clock = Some((start, consumed + take));
        }
    }
}

/// [`AudioSink`] that keeps played audio in memory.
pub struct MemorySink {
    config: SinkConfig,
    session_id: u32,
    paced: bool,
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    /// Create a sink that plays instantly.
    pub fn new(config: SinkConfig) -> Self {
        Self::build(config, false)
    }

    /// Create a sink that plays at `config.sample_rate` in real time.
    pub fn paced(config: SinkConfig) -> Self {
        Self::build(config, true)
    }

    fn build(config: SinkConfig, paced: bool) -> Self {
        Self {
            config,
            session_id: next_session_id(),
            paced,
            state: Arc::new(Mutex::new(MemoryState {
                queue: VecDeque::new(),
                played: Vec::new(),
                playing: false,
                volume: 1.0,
                flushes: 0,
                stops: 0,
                ended: false,
                released: false,
                clock: None,
            })),
        }
    }

    /// Handle for observing this sink after it has been handed to a player.
    pub fn probe(&self) -> MemorySinkProbe {
        MemorySinkProbe {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }

    fn channels(&self) -> usize {
        usize::from(self.config.channels)
    }

    fn advance(&self, state: &mut MemoryState) {
        state.advance(self.config.sample_rate, self.channels(), self.paced);
    }
}

impl AudioSink for MemorySink {
    fn config(&self) -> &SinkConfig {
        &self.config
    }

    fn play(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.playing {
            state.playing = true;
            state.clock = None;
        }
        self.advance(&mut state);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        self.advance(&mut state);
        state.playing = false;
        state.clock = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        self.advance(&mut state);
        state.playing = false;
        state.clock = None;
        state.queue.clear();
        state.stops += 1;
        Ok(())
    }

    fn flush(&mut self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.ended = false;
        state.flushes += 1;
        if state.playing {
            state.clock = None;
        }
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        let channels = self.channels();
        let capacity = self.config.buffer_samples();
        let mut state = self.state.lock();
        self.advance(&mut state);

        let free = capacity.saturating_sub(state.queue.len());
        let accepted = samples.len().min(free);
        let accepted = accepted - accepted % channels;
        state.queue.extend(&samples[..accepted]);
        if accepted > 0 {
            state.ended = false;
        }
        self.advance(&mut state);

        trace!("Memory sink accepted {} of {} samples", accepted, samples.len());
        Ok(accepted)
    }

    fn end_of_stream(&mut self) -> Result<()> {
        self.state.lock().ended = true;
        Ok(())
    }

    fn queued_frames(&self) -> usize {
        let mut state = self.state.lock();
        self.advance(&mut state);
        state.queue.len() / self.channels()
    }

    fn set_volume(&mut self, volume: f32) {
        self.state.lock().volume = volume.clamp(0.0, 1.0);
    }

    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn release(&mut self) {
        let mut state = self.state.lock();
        state.playing = false;
        state.queue.clear();
        state.released = true;
    }
}

/// Read-only view of a [`MemorySink`].
#[derive(Clone)]
pub struct MemorySinkProbe {
    config: SinkConfig,
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySinkProbe {
    pub const fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Every sample played so far.
    pub fn played(&self) -> Vec<i16> {
        self.state.lock().played.clone()
    }

    pub fn played_frames(&self) -> usize {
        self.state.lock().played.len() / usize::from(self.config.channels)
    }

    pub fn queued_samples(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stops
    }

    /// Whether the writer signalled end of stream since the last flush.
    pub fn ended(&self) -> bool {
        self.state.lock().ended
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}
