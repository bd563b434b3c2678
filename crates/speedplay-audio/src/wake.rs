//! Keep-awake reservation held while audio is playing.

use std::sync::Arc;

use tracing::debug;

/// An OS-level hint that keeps the device from sleeping.
///
/// Not reference counted: one `release` undoes any number of `acquire`s.
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
    fn is_held(&self) -> bool;
}

/// Whether the player wants to stay awake, and the lock that expresses it.
#[derive(Default)]
pub struct WakeState {
    lock: Option<Arc<dyn WakeLock>>,
    awake: bool,
}

impl WakeState {
    /// Acquire or release the lock. Repeating the current value does nothing.
    pub fn stay_awake(&mut self, awake: bool) {
        if self.awake == awake {
            return;
        }
        self.awake = awake;
        if let Some(lock) = &self.lock {
            if awake && !lock.is_held() {
                lock.acquire();
            } else if !awake && lock.is_held() {
                lock.release();
            }
        }
        debug!("Stay awake: {awake}");
    }

    /// Swap the lock. A held old lock is released; the new one is acquired
    /// if the player is currently awake.
    pub fn set_lock(&mut self, lock: Option<Arc<dyn WakeLock>>) {
        if let Some(old) = self.lock.take() {
            if old.is_held() {
                old.release();
            }
        }
        if let Some(new) = &lock {
            if self.awake {
                new.acquire();
            }
        }
        self.lock = lock;
    }
}
