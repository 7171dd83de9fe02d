//! Lifecycle notifications for observers of a session.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

/// Something that happened to a session, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A ROM finished loading; carries its display name.
    RomLoaded { name: String },
    Reset,
    SoftReset,
    Paused(bool),
    /// The frame pump thread was spawned.
    EmulationStarted,
    /// The frame pump thread was stopped.
    EmulationStopped,
}

/// Fan-out of events to every live subscriber.
///
/// Publishing never blocks; subscribers whose receiver was dropped are
/// forgotten on the next publish.
#[derive(Default)]
pub(crate) struct EventHub {
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
