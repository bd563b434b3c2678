//! Player state machine states.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Playback state of a player.
///
/// Exactly one value is active at a time. External calls validate against it
/// before doing anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    Idle,
    Preparing,
    Prepared,
    Started,
    Paused,
    PlaybackCompleted,
    Error,
}

impl PlaybackState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Preparing => 1,
            Self::Prepared => 2,
            Self::Started => 3,
            Self::Paused => 4,
            Self::PlaybackCompleted => 5,
            Self::Error => 6,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Preparing,
            2 => Self::Prepared,
            3 => Self::Started,
            4 => Self::Paused,
            5 => Self::PlaybackCompleted,
            _ => Self::Error,
        }
    }
}

/// Lock-free holder for a [`PlaybackState`].
///
/// The decode worker reads the state on every iteration without taking the
/// session lock.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new(state: PlaybackState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub fn get(&self) -> PlaybackState {
        PlaybackState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store a new state and return the previous one.
    pub fn set(&self, state: PlaybackState) -> PlaybackState {
        PlaybackState::from_u8(self.0.swap(state.to_u8(), Ordering::AcqRel))
    }

    /// Move from `current` to `new` only if `current` is still active.
    pub fn transition(&self, current: PlaybackState, new: PlaybackState) -> bool {
        self.0
            .compare_exchange(
                current.to_u8(),
                new.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is(&self, state: PlaybackState) -> bool {
        self.get() == state
    }
}
