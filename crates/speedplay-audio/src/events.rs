//! Player event dispatch.
//!
//! Every notification is delivered from one `speedplay-events` thread in the
//! order it was raised, so listeners never run concurrently with each other.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use speedplay_core::{Error, Result};
use tracing::{debug, trace, warn};

/// Notification raised by a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerEvent {
    /// The source is open and playback may start.
    Prepared,
    /// Playback reached the end of the source.
    Completion,
    /// The session failed; the player is in the error state.
    Error,
}

/// Callback registered for one event kind.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    prepared: Option<Listener>,
    completion: Option<Listener>,
    error: Option<Listener>,
}

impl Listeners {
    fn slot(&mut self, event: PlayerEvent) -> &mut Option<Listener> {
        match event {
            PlayerEvent::Prepared => &mut self.prepared,
            PlayerEvent::Completion => &mut self.completion,
            PlayerEvent::Error => &mut self.error,
        }
    }
}

#[derive(Default)]
struct Registry {
    listeners: Mutex<Listeners>,
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
}

impl Registry {
    fn dispatch(&self, event: PlayerEvent) {
        // Cloned out so a listener may call back into the player.
        let listener = self.listeners.lock().slot(event).clone();
        if let Some(listener) = listener {
            listener();
        }

        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event).is_ok());
    }
}

enum Dispatch {
    Event(PlayerEvent),
    Shutdown,
}

/// Owns the listener slots, the subscribers and the dispatch thread.
pub struct Notifier {
    registry: Arc<Registry>,
    tx: Sender<Dispatch>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    /// Spawn the dispatch thread.
    pub fn new() -> Result<Self> {
        let (tx, rx) = unbounded::<Dispatch>();
        let registry = Arc::new(Registry::default());

        let worker_registry = Arc::clone(&registry);
        let handle = std::thread::Builder::new()
            .name("speedplay-events".to_string())
            .spawn(move || {
                while let Ok(Dispatch::Event(event)) = rx.recv() {
                    trace!("Dispatching {:?}", event);
                    worker_registry.dispatch(event);
                }
                debug!("Event dispatcher stopped");
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn event thread: {e}")))?;

        Ok(Self {
            registry,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue an event for delivery.
    pub fn notify(&self, event: PlayerEvent) {
        debug!("Event raised: {:?}", event);
        if self.tx.send(Dispatch::Event(event)).is_err() {
            warn!("Event dispatcher is gone, dropping {:?}", event);
        }
    }

    /// Replace the listener for one event kind. `None` clears it.
    pub fn set_listener(&self, event: PlayerEvent, listener: Option<Listener>) {
        *self.registry.listeners.lock().slot(event) = listener;
    }

    pub fn clear_listeners(&self) {
        *self.registry.listeners.lock() = Listeners::default();
    }

    /// Receive every event raised from now on.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded();
        self.registry.subscribers.lock().push(tx);
        rx
    }

    /// Stop the dispatch thread after it delivers already queued events.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.tx.send(Dispatch::Shutdown);
        // A listener dropping the last player handle runs on this thread.
        if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
            warn!("Event dispatcher panicked");
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}
