//! Variable-speed player state machine.
//!
//! [`SpeedPlayer`] validates every call against its [`PlaybackState`], owns
//! the decode session, and starts, pauses, seeks and tears down the decode
//! worker. Calling an operation in a state it is not valid for fails with
//! [`Error::IllegalState`] and moves the player to [`PlaybackState::Error`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use speedplay_core::{DataSource, Error, PlaybackState, Result};
use tracing::{debug, info, warn};

use crate::backend::{MediaBackend, SystemBackend};
use crate::config::PlayerConfig;
use crate::decode_loop::{self, Shared};
use crate::events::{Listener, PlayerEvent};
use crate::wake::WakeLock;

use speedplay_core::PlaybackState::{
    Error as Failed, Idle, Paused, PlaybackCompleted, Prepared, Preparing, Started,
};

const PREPARE_STATES: &[PlaybackState] = &[Idle];
const START_STATES: &[PlaybackState] = &[Prepared, Started, Paused, PlaybackCompleted];
const PAUSE_STATES: &[PlaybackState] = &[Started, Paused, PlaybackCompleted];
const SEEK_STATES: &[PlaybackState] = &[Prepared, Started, Paused, PlaybackCompleted];
const POSITION_STATES: &[PlaybackState] = &[Idle, Prepared, Started, Paused, PlaybackCompleted];
const RESET_STATES: &[PlaybackState] =
    &[Idle, Prepared, Started, Paused, PlaybackCompleted, Failed];

/// Caller-side bookkeeping, guarded by the operations mutex.
#[derive(Default)]
struct Ops {
    source: Option<DataSource>,
    worker: Option<JoinHandle<()>>,
}

/// Pitch-preserving, variable-speed audio player.
///
/// All operations take `&self` and may be called from any thread; they are
/// serialized internally. Events are delivered on a dedicated thread.
pub struct SpeedPlayer {
    shared: Arc<Shared>,
    ops: Mutex<Ops>,
}

impl SpeedPlayer {
    /// Create a player that decodes with symphonia and plays through cpal.
    pub fn new(config: PlayerConfig) -> Result<Self> {
        Self::with_backend(config, Arc::new(SystemBackend))
    }

    /// Create a player with custom sources, decoders and sinks.
    pub fn with_backend(config: PlayerConfig, backend: Arc<dyn MediaBackend>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config, backend)?),
            ops: Mutex::new(Ops::default()),
        })
    }

    /// Validate `operation` against the current state. An invalid call is
    /// routed through the error path before it is reported.
    fn check(&self, operation: &'static str, valid: &[PlaybackState]) -> Result<PlaybackState> {
        let state = self.shared.state.get();
        if valid.contains(&state) {
            return Ok(state);
        }
        let err = Error::IllegalState { operation, state };
        self.shared.fail(&err);
        Err(err)
    }

    /// Report a session failure through the error path and hand it back.
    fn failed<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.shared.fail(e);
        }
        result
    }

    /// Open `source` and prepare it for playback, blocking until done.
    pub fn prepare(&self, source: impl Into<DataSource>) -> Result<()> {
        let mut ops = self.ops.lock();
        self.check("prepare", PREPARE_STATES)?;
        let source = source.into();
        info!("Preparing {source}");

        self.shared.state.set(Preparing);
        ops.source = Some(source.clone());
        let generation = self.shared.generation.load(Ordering::Acquire);
        let session = self.failed(self.shared.init_stream(&source))?;

        if self.shared.publish_prepared(session, generation) {
            return Ok(());
        }
        // Another thread faulted the player while the stream was opening.
        let state = self.shared.state.get();
        debug!("Discarding prepare of {source}, player is {state:?}");
        Err(Error::IllegalState {
            operation: "prepare",
            state,
        })
    }

    /// Open `source` on a background thread. The outcome is reported through
    /// `on_prepared` or `on_error`.
    pub fn prepare_async(&self, source: impl Into<DataSource>) -> Result<()> {
        let mut ops = self.ops.lock();
        self.check("prepare_async", PREPARE_STATES)?;
        let source = source.into();
        info!("Preparing {source} in the background");

        self.shared.state.set(Preparing);
        ops.source = Some(source.clone());

        let shared = Arc::clone(&self.shared);
        let generation = shared.generation.load(Ordering::Acquire);
        let spawned = std::thread::Builder::new()
            .name("speedplay-prepare".to_string())
            .spawn(move || finish_prepare(&shared, &source, generation))
            .map_err(|e| Error::Internal(format!("Failed to spawn prepare thread: {e}")));
        self.failed(spawned).map(drop)
    }

    /// Start or resume playback.
    pub fn start(&self) -> Result<()> {
        let mut ops = self.ops.lock();
        let state = self.check("start", START_STATES)?;

        let worker_alive = ops.worker.as_ref().is_some_and(|w| !w.is_finished());
        match state {
            Started => Ok(()),
            Paused if worker_alive => self.resume(),
            PlaybackCompleted | Paused => {
                self.restart_stream(&mut ops)?;
                self.begin(&mut ops)
            }
            _ => self.begin(&mut ops),
        }
    }

    /// Start the sink and spawn the decode worker for a prepared session.
    fn begin(&self, ops: &mut Ops) -> Result<()> {
        {
            let mut guard = self.shared.session.lock();
            let Some(session) = guard.as_mut() else {
                return self.failed(Err(Error::Internal("No decode session".to_string())));
            };
            self.failed(session.sink_mut().play())?;
            self.shared.continuing.store(true, Ordering::Release);
            self.shared.state.set(Started);
        }
        self.shared.wake.lock().stay_awake(true);

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("speedplay-decode".to_string())
            .spawn(move || decode_loop::run(&shared))
            .map_err(|e| Error::Internal(format!("Failed to spawn decode thread: {e}")));
        ops.worker = Some(self.failed(spawned)?);
        debug!("Playback started");
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        {
            let mut guard = self.shared.session.lock();
            if let Some(session) = guard.as_mut() {
                self.failed(session.sink_mut().play())?;
            }
            self.shared.state.set(Started);
        }
        self.shared.wake.lock().stay_awake(true);
        self.shared.wakeup.notify_all();
        debug!("Playback resumed");
        Ok(())
    }

    /// Reopen the current source from the beginning after playback ended.
    fn restart_stream(&self, ops: &mut Ops) -> Result<()> {
        debug!("Reinitializing stream");
        self.join_worker(ops);
        if let Some(mut old) = self.shared.session.lock().take() {
            old.release();
        }

        let Some(source) = ops.source.clone() else {
            return self.failed(Err(Error::Internal("No source to restart".to_string())));
        };
        let session = self.failed(self.shared.init_stream(&source))?;
        self.shared.install(&mut self.shared.session.lock(), session);
        self.shared.clear_outcome();
        Ok(())
    }

    /// Pause playback. The decode worker parks until `start` is called.
    pub fn pause(&self) -> Result<()> {
        let _ops = self.ops.lock();
        let state = self.check("pause", PAUSE_STATES)?;

        if state == PlaybackCompleted {
            self.shared.state.set(Paused);
        } else {
            let mut guard = self.shared.session.lock();
            self.shared.state.set(Paused);
            if let Some(session) = guard.as_mut() {
                self.failed(session.sink_mut().pause())?;
            }
        }
        self.shared.wake.lock().stay_awake(false);
        debug!("Playback paused");
        Ok(())
    }

    /// Seek to the sync point at or before `position_ms`.
    ///
    /// Returns immediately; the decode worker applies the seek at its next
    /// step.
    pub fn seek_to(&self, position_ms: u64) -> Result<()> {
        let _ops = self.ops.lock();
        self.check("seek_to", SEEK_STATES)?;

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("speedplay-seek".to_string())
            .spawn(move || shared.seek(position_ms))
            .map_err(|e| Error::Internal(format!("Failed to spawn seek thread: {e}")));
        self.failed(spawned).map(drop)
    }

    /// Tear down the session and return to [`PlaybackState::Idle`].
    pub fn reset(&self) -> Result<()> {
        let mut ops = self.ops.lock();
        self.check("reset", RESET_STATES)?;
        self.teardown(&mut ops);
        Ok(())
    }

    /// Clear every listener and tear down the session. Never fails.
    pub fn release(&self) {
        self.shared.notifier.clear_listeners();
        let mut ops = self.ops.lock();
        self.teardown(&mut ops);
        debug!("Player released");
    }

    fn join_worker(&self, ops: &mut Ops) {
        {
            let _guard = self.shared.session.lock();
            self.shared.continuing.store(false, Ordering::Release);
        }
        self.shared.wakeup.notify_all();
        if let Some(worker) = ops.worker.take() {
            if worker.join().is_err() {
                warn!("Decode worker panicked");
            }
        }
    }

    fn teardown(&self, ops: &mut Ops) {
        self.shared.wake.lock().stay_awake(false);
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.join_worker(ops);

        if let Some(mut session) = self.shared.session.lock().take() {
            session.release();
        }
        ops.source = None;
        self.shared.flush_codec.store(false, Ordering::Release);
        self.shared.position_us.store(0, Ordering::Release);
        self.shared.duration_ms.store(0, Ordering::Release);
        self.shared.clear_outcome();
        self.shared.state.set(Idle);
        debug!("Player reset");
    }

    /// Set the output volume, clamped to 0.0..=1.0.
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        self.shared.set_volume(volume);
        if let Some(session) = self.shared.session.lock().as_mut() {
            session.sink_mut().set_volume(volume);
        }
    }

    /// Install the keep-awake reservation held while playing. `None` removes it.
    pub fn set_wake_lock(&self, lock: Option<Arc<dyn WakeLock>>) {
        self.shared.wake.lock().set_lock(lock);
    }

    /// Source position in milliseconds. Zero while idle.
    pub fn current_position(&self) -> Result<u64> {
        let state = self.check("current_position", POSITION_STATES)?;
        if state == Idle {
            return Ok(0);
        }
        Ok(self.shared.position_us.load(Ordering::Acquire) / 1000)
    }

    /// Track duration in milliseconds. Zero until prepared.
    pub fn duration(&self) -> u64 {
        self.shared.duration_ms.load(Ordering::Acquire)
    }

    pub fn playback_speed(&self) -> f32 {
        self.shared.speed()
    }

    /// Set the speed ratio. Takes effect on the next decoded chunk.
    pub fn set_playback_speed(&self, speed: f32) {
        self.shared.set_speed(speed);
        debug!("Playback speed set to {}", self.shared.speed());
    }

    pub fn is_playing(&self) -> bool {
        self.shared.state.is(Started)
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state.get()
    }

    /// Session id of the open audio sink.
    pub fn audio_session_id(&self) -> Option<u32> {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.sink().session_id())
    }

    pub fn on_prepared(&self, listener: Option<Listener>) {
        self.shared.notifier.set_listener(PlayerEvent::Prepared, listener);
    }

    pub fn on_completion(&self, listener: Option<Listener>) {
        self.shared.notifier.set_listener(PlayerEvent::Completion, listener);
    }

    pub fn on_error(&self, listener: Option<Listener>) {
        self.shared.notifier.set_listener(PlayerEvent::Error, listener);
    }

    /// Receive every event raised from now on.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.shared.notifier.subscribe()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.shared.config
    }
}

impl Drop for SpeedPlayer {
    fn drop(&mut self) {
        let mut ops = std::mem::take(self.ops.get_mut());
        self.teardown(&mut ops);
        self.shared.notifier.shutdown();
    }
}

/// Background half of [`SpeedPlayer::prepare_async`].
fn finish_prepare(shared: &Shared, source: &DataSource, generation: u64) {
    match shared.init_stream(source) {
        Ok(session) => {
            if !shared.publish_prepared(session, generation) {
                debug!("Discarding stale prepare of {source}");
            }
        }
        Err(e) => {
            // Held while failing so a teardown cannot interleave.
            let _guard = shared.session.lock();
            if shared.generation.load(Ordering::Acquire) == generation
                && shared.state.is(Preparing)
            {
                shared.fail(&e);
            } else {
                debug!("Stale prepare of {source} failed: {e}");
            }
        }
    }
}
