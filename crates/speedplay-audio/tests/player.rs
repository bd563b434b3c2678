//! End-to-end behavior of the player state machine.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{expect_event, expect_quiet, player, source, wait_until, SyntheticBackend, Tone};
use speedplay_audio::{PlayerEvent, WakeLock};
use speedplay_core::PlaybackState;

const TIMEOUT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(200);

#[test]
fn test_illegal_calls_enter_error_state() {
    let backend = SyntheticBackend::new(Tone::ramp(200));
    let player = player(&backend);
    let events = player.subscribe();

    let err = player.start().unwrap_err();
    assert!(err.is_illegal_state());
    assert_eq!(player.state(), PlaybackState::Error);
    expect_event(&events, PlayerEvent::Error, TIMEOUT);
    assert!(player.current_position().is_err());
    player.reset().unwrap();

    assert!(player.pause().unwrap_err().is_illegal_state());
    assert_eq!(player.state(), PlaybackState::Error);
    player.reset().unwrap();

    assert!(player.seek_to(100).unwrap_err().is_illegal_state());
    assert_eq!(player.state(), PlaybackState::Error);
    player.reset().unwrap();

    player.prepare(source()).unwrap();
    assert!(player.prepare(source()).unwrap_err().is_illegal_state());
    assert_eq!(player.state(), PlaybackState::Error);
    player.reset().unwrap();
    assert_eq!(player.state(), PlaybackState::Idle);
}

#[test]
fn test_prepare_then_complete_fires_each_event_once() {
    let tone = Tone::ramp(500);
    let backend = SyntheticBackend::new(tone.clone());
    let player = player(&backend);
    let events = player.subscribe();

    player.prepare(source()).unwrap();
    assert_eq!(player.state(), PlaybackState::Prepared);
    assert_eq!(player.duration(), 500);
    player.start().unwrap();

    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);
    expect_quiet(&events, QUIET);

    assert_eq!(player.state(), PlaybackState::PlaybackCompleted);
    assert!(!player.is_playing());
    assert_eq!(player.current_position().unwrap(), 500);

    let sink = backend.last_sink();
    assert_eq!(sink.played(), tone.samples());
    assert_eq!(sink.stop_count(), 1);
}

#[test]
fn test_listeners_fire_on_event_thread() {
    let backend = SyntheticBackend::new(Tone::ramp(100));
    let player = player(&backend);
    let prepared = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&prepared);
    player.on_prepared(Some(Arc::new(move || {
        assert_eq!(std::thread::current().name(), Some("speedplay-events"));
        counter.fetch_add(1, Ordering::SeqCst);
    })));
    let counter = Arc::clone(&completed);
    player.on_completion(Some(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    player.prepare(source()).unwrap();
    player.start().unwrap();
    assert!(wait_until(TIMEOUT, || completed.load(Ordering::SeqCst) == 1));
    assert_eq!(prepared.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_format_keys_report_error_without_prepared() {
    let tone = Tone {
        omit_duration: true,
        ..Tone::ramp(500)
    };
    let backend = SyntheticBackend::new(tone);
    let player = player(&backend);
    let events = player.subscribe();

    let err = player.prepare(source()).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("duration"));
    assert_eq!(player.state(), PlaybackState::Error);

    expect_event(&events, PlayerEvent::Error, TIMEOUT);
    expect_quiet(&events, QUIET);
    assert!(backend.sinks().is_empty());
}

#[test]
fn test_fault_during_sync_prepare_wins() {
    let backend = SyntheticBackend::slow(Tone::ramp(500), Duration::from_millis(300));
    let player = player(&backend);
    let events = player.subscribe();

    let result = std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            assert!(player.current_position().unwrap_err().is_illegal_state());
        });
        player.prepare(source())
    });

    assert!(result.unwrap_err().is_illegal_state());
    assert_eq!(player.state(), PlaybackState::Error);
    expect_event(&events, PlayerEvent::Error, TIMEOUT);
    expect_quiet(&events, QUIET);
    assert!(backend.sinks().iter().all(|sink| sink.is_released()));

    player.reset().unwrap();
    player.prepare(source()).unwrap();
    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
}

#[test]
fn test_prepare_async_reports_prepared() {
    let backend = SyntheticBackend::slow(Tone::ramp(200), Duration::from_millis(50));
    let player = player(&backend);
    let events = player.subscribe();

    player.prepare_async(source()).unwrap();
    assert_eq!(player.state(), PlaybackState::Preparing);
    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    assert_eq!(player.state(), PlaybackState::Prepared);
    assert_eq!(player.duration(), 200);
}

#[test]
fn test_stale_async_prepare_is_discarded() {
    let backend = SyntheticBackend::slow(Tone::ramp(200), Duration::from_millis(200));
    let player = player(&backend);
    let events = player.subscribe();

    player.prepare_async(source()).unwrap();
    assert!(player.start().unwrap_err().is_illegal_state());
    expect_event(&events, PlayerEvent::Error, TIMEOUT);
    player.reset().unwrap();

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(player.state(), PlaybackState::Idle);
    expect_quiet(&events, QUIET);
    assert!(backend.sinks().iter().all(|sink| sink.is_released()));
}

#[test]
fn test_seek_snaps_to_preceding_sync_point() {
    // Sync points every 8 packets of 12.5 ms, so every 100 ms.
    let backend = SyntheticBackend::new(Tone::ramp(4000));
    let player = player(&backend);
    player.prepare(source()).unwrap();
    let sink = backend.last_sink();

    player.seek_to(3050).unwrap();
    assert!(wait_until(TIMEOUT, || sink.flush_count() == 1));
    assert_eq!(player.current_position().unwrap(), 3000);

    player.seek_to(3050).unwrap();
    assert!(wait_until(TIMEOUT, || sink.flush_count() == 2));
    assert_eq!(player.current_position().unwrap(), 3000);

    player.seek_to(3000).unwrap();
    assert!(wait_until(TIMEOUT, || sink.flush_count() == 3));
    assert_eq!(player.current_position().unwrap(), 3000);
    assert_eq!(player.state(), PlaybackState::Prepared);
}

#[test]
fn test_position_follows_played_audio_across_seek() {
    let backend = SyntheticBackend::paced(Tone::ramp(6000));
    let player = player(&backend);
    player.prepare(source()).unwrap();
    player.start().unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // Decoding runs a full sink buffer ahead of what is audible.
    let before = player.current_position().unwrap();
    assert!(before <= 350, "position {before} before seek");

    let sink = backend.last_sink();
    player.seek_to(3050).unwrap();
    assert!(wait_until(TIMEOUT, || sink.flush_count() == 1));
    let landed = player.current_position().unwrap();
    assert!((3000..=3050).contains(&landed), "position {landed} after seek");

    std::thread::sleep(Duration::from_millis(200));
    let later = player.current_position().unwrap();
    assert!((landed..=3300).contains(&later), "position {later} while playing");
    assert!(later > 3000);
}

#[test]
fn test_seek_while_paused_resumes_from_sync_point() {
    let tone = Tone::ramp(2000);
    let backend = SyntheticBackend::paced(tone.clone());
    let player = player(&backend);
    let events = player.subscribe();
    player.prepare(source()).unwrap();
    player.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    player.pause().unwrap();

    let sink = backend.last_sink();
    player.seek_to(1530).unwrap();
    assert!(wait_until(TIMEOUT, || sink.flush_count() == 1));
    let position = player.current_position().unwrap();
    assert!((1400..=1530).contains(&position), "position {position}");
    assert_eq!(position, 1500);

    let played_before = sink.played().len();
    player.start().unwrap();
    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);

    // Playback picks up at frame 12000 (1500 ms at 8 kHz).
    let played = sink.played();
    let expected = tone.samples();
    assert_eq!(played[played_before..], expected[12_000..]);
}

#[test]
fn test_reset_twice_and_release_after_reset() {
    let backend = SyntheticBackend::paced(Tone::ramp(2000));
    let player = player(&backend);
    player.prepare(source()).unwrap();
    player.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    player.reset().unwrap();
    assert_eq!(player.state(), PlaybackState::Idle);
    player.reset().unwrap();
    assert_eq!(player.state(), PlaybackState::Idle);
    assert_eq!(player.duration(), 0);
    assert_eq!(player.current_position().unwrap(), 0);
    assert!(backend.last_sink().is_released());

    player.release();
    assert_eq!(player.state(), PlaybackState::Idle);
    player.prepare(source()).unwrap();
    assert_eq!(player.state(), PlaybackState::Prepared);
}

#[test]
fn test_pause_resume_keeps_every_sample_in_order() {
    let tone = Tone::ramp(1500);
    let backend = SyntheticBackend::paced(tone.clone());
    let player = player(&backend);
    let events = player.subscribe();
    player.prepare(source()).unwrap();
    player.start().unwrap();

    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(150));
        player.pause().unwrap();
        assert_eq!(player.state(), PlaybackState::Paused);
        assert!(!backend.last_sink().is_playing());
        std::thread::sleep(Duration::from_millis(50));
        player.start().unwrap();
        assert!(player.is_playing());
    }

    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);
    assert_eq!(backend.last_sink().played(), tone.samples());
}

#[test]
fn test_double_speed_halves_playback_time() {
    let tone = Tone::sine(4000);
    let backend = SyntheticBackend::paced(tone.clone());
    let player = player(&backend);
    let events = player.subscribe();
    player.set_playback_speed(2.0);
    assert!((player.playback_speed() - 2.0).abs() < f32::EPSILON);

    player.prepare(source()).unwrap();
    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    let started = Instant::now();
    player.start().unwrap();

    let mut max_position = 0;
    while player.state() == PlaybackState::Started {
        let position = player.current_position().unwrap_or(max_position);
        assert!(position >= max_position || position == 0);
        max_position = max_position.max(position);
        std::thread::sleep(Duration::from_millis(20));
    }
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(1500) && elapsed <= Duration::from_millis(3000),
        "took {elapsed:?}"
    );
    assert!(max_position <= 4000);
    assert_eq!(player.current_position().unwrap(), 4000);

    let played = backend.last_sink().played_frames() as f64;
    let expected = tone.total_frames() as f64 / 2.0;
    assert!((played - expected).abs() < expected * 0.1, "played {played} frames");
}

#[test]
fn test_output_format_change_reopens_sink() {
    let tone = Tone {
        declared_rate: Some(16_000),
        ..Tone::ramp(300)
    };
    let backend = SyntheticBackend::new(tone.clone());
    let player = player(&backend);
    let events = player.subscribe();
    player.set_volume(0.25);
    player.prepare(source()).unwrap();
    assert_eq!(backend.sinks()[0].config().sample_rate, 16_000);

    player.start().unwrap();
    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);

    let sinks = backend.sinks();
    assert_eq!(sinks.len(), 2);
    assert!(sinks[0].is_released());
    assert_eq!(sinks[1].config().sample_rate, 8000);
    assert!((sinks[1].volume() - 0.25).abs() < f32::EPSILON);
    assert_eq!(sinks[1].played(), tone.samples());
}

#[test]
fn test_start_after_completion_replays_source() {
    let tone = Tone::ramp(200);
    let backend = SyntheticBackend::new(tone.clone());
    let player = player(&backend);
    let events = player.subscribe();
    player.prepare(source()).unwrap();
    player.start().unwrap();
    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);

    player.start().unwrap();
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);

    let sinks = backend.sinks();
    assert_eq!(sinks.len(), 2);
    assert!(sinks[0].is_released());
    assert_eq!(sinks[1].played(), tone.samples());
}

#[test]
fn test_pause_after_completion_then_start_replays() {
    let backend = SyntheticBackend::new(Tone::ramp(200));
    let player = player(&backend);
    let events = player.subscribe();
    player.prepare(source()).unwrap();
    player.start().unwrap();
    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);

    player.pause().unwrap();
    assert_eq!(player.state(), PlaybackState::Paused);
    player.start().unwrap();
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);
    assert_eq!(backend.sinks().len(), 2);
}

#[test]
fn test_session_id_and_volume_follow_sink() {
    let backend = SyntheticBackend::new(Tone::ramp(200));
    let player = player(&backend);
    assert_eq!(player.audio_session_id(), None);

    player.set_volume(3.0);
    player.prepare(source()).unwrap();
    let sink = backend.last_sink();
    assert!((sink.volume() - 1.0).abs() < f32::EPSILON);
    assert!(player.audio_session_id().is_some());

    player.set_volume(0.5);
    assert!((sink.volume() - 0.5).abs() < f32::EPSILON);

    player.reset().unwrap();
    assert_eq!(player.audio_session_id(), None);
}

#[derive(Default)]
struct FlagLock {
    held: AtomicBool,
}

impl WakeLock for FlagLock {
    fn acquire(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[test]
fn test_wake_lock_held_only_while_playing() {
    let backend = SyntheticBackend::paced(Tone::ramp(600));
    let player = player(&backend);
    let events = player.subscribe();
    let lock = Arc::new(FlagLock::default());
    player.set_wake_lock(Some(lock.clone()));

    player.prepare(source()).unwrap();
    assert!(!lock.is_held());
    player.start().unwrap();
    assert!(lock.is_held());
    player.pause().unwrap();
    assert!(!lock.is_held());
    player.start().unwrap();
    assert!(lock.is_held());

    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    expect_event(&events, PlayerEvent::Completion, TIMEOUT);
    assert!(!lock.is_held());
}

#[test]
fn test_read_failure_mid_stream_reports_one_error() {
    let tone = Tone {
        // 1250 ms in, well past the first sink buffer
        fail_after_packets: Some(100),
        ..Tone::ramp(4000)
    };
    let backend = SyntheticBackend::paced(tone);
    let player = player(&backend);
    let events = player.subscribe();
    let lock = Arc::new(FlagLock::default());
    player.set_wake_lock(Some(lock.clone()));

    player.prepare(source()).unwrap();
    player.start().unwrap();
    assert!(lock.is_held());

    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    expect_event(&events, PlayerEvent::Error, TIMEOUT);
    expect_quiet(&events, QUIET);
    assert_eq!(player.state(), PlaybackState::Error);
    assert!(!player.is_playing());
    assert!(!lock.is_held());

    player.reset().unwrap();
    assert!(backend.last_sink().is_released());
    player.prepare(source()).unwrap();
    expect_event(&events, PlayerEvent::Prepared, TIMEOUT);
    assert_eq!(player.state(), PlaybackState::Prepared);
}

#[test]
fn test_prepared_never_follows_release() {
    let backend = SyntheticBackend::slow(Tone::ramp(200), Duration::from_millis(20));
    let player = player(&backend);
    let events = player.subscribe();

    for delay_ms in (0..40).step_by(4) {
        player.prepare_async(source()).unwrap();
        std::thread::sleep(Duration::from_millis(delay_ms));
        player.release();
        // Marks the point after release in the event stream.
        assert!(player.start().is_err());

        let mut seen = Vec::new();
        while let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
            seen.push(event);
        }
        assert_eq!(seen.last(), Some(&PlayerEvent::Error), "delay {delay_ms}: {seen:?}");
        assert!(seen.len() <= 2, "delay {delay_ms}: {seen:?}");
        player.reset().unwrap();
    }
}

#[test]
fn test_drop_while_playing_releases_everything() {
    let backend = SyntheticBackend::paced(Tone::ramp(2000));
    let player = player(&backend);
    let lock = Arc::new(FlagLock::default());
    player.set_wake_lock(Some(lock.clone()));
    player.prepare(source()).unwrap();
    player.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(lock.is_held());

    let sink = backend.last_sink();
    drop(player);
    assert!(!lock.is_held());
    assert!(sink.is_released());
    assert!(!sink.is_playing());
}

#[test]
fn test_release_clears_listeners() {
    let backend = SyntheticBackend::new(Tone::ramp(100));
    let player = player(&backend);
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    player.on_error(Some(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    player.release();
    assert!(player.start().is_err());
    std::thread::sleep(QUIET);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}
