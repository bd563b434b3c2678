//! Playback speed bounds.

/// Normal playback speed.
pub const DEFAULT_SPEED: f32 = 1.0;

/// Slowest supported playback speed.
pub const MIN_SPEED: f32 = 0.1;

/// Fastest supported playback speed.
pub const MAX_SPEED: f32 = 8.0;

/// Clamp a requested speed into the supported range.
///
/// Non-finite input falls back to [`DEFAULT_SPEED`].
pub fn clamp_speed(speed: f32) -> f32 {
    if speed.is_finite() {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        DEFAULT_SPEED
    }
}
