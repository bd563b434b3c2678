//! Core domain types for Speedplay.

pub mod format;
pub mod source;
pub mod speed;
pub mod state;

pub use format::StreamFormat;
pub use source::DataSource;
pub use speed::{clamp_speed, DEFAULT_SPEED, MAX_SPEED, MIN_SPEED};
pub use state::{PlaybackState, StateCell};
