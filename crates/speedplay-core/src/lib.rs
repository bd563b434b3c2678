//! # speedplay-core
//!
//! Core types, playback states, and error handling for the Speedplay
//! variable-speed audio player.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
