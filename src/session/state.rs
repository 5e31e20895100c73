//! Session state and its publish/subscribe bus

use parking_lot::Mutex;
use std::fmt;
use std::thread;
use tokio::sync::{mpsc, watch};

/// Lifecycle state of the (single) session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Faulted,
}

impl SessionState {
    /// States in which no device or connection is held
    pub fn is_at_rest(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Faulted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Starting => "Starting",
            SessionState::Active => "Active",
            SessionState::Stopping => "Stopping",
            SessionState::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

struct Subscribers {
    current: SessionState,
    senders: Vec<mpsc::UnboundedSender<SessionState>>,
}

/// Fan-out of state changes to presenters
///
/// Only the controller publishes. Each subscriber gets the current state on
/// subscription and then every change, on its own delivery thread.
pub struct StateBus {
    subscribers: Mutex<Subscribers>,
    watch_tx: watch::Sender<SessionState>,
}

impl StateBus {
    pub fn new(initial: SessionState) -> Self {
        let (watch_tx, _) = watch::channel(initial);
        Self {
            subscribers: Mutex::new(Subscribers {
                current: initial,
                senders: Vec::new(),
            }),
            watch_tx,
        }
    }

    pub(crate) fn publish(&self, state: SessionState) {
        let mut subscribers = self.subscribers.lock();
        subscribers.current = state;
        self.watch_tx.send_replace(state);
        subscribers.senders.retain(|tx| tx.send(state).is_ok());
    }

    /// Latest published state; never blocks on a transition
    pub fn current(&self) -> SessionState {
        *self.watch_tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.watch_tx.subscribe()
    }

    /// Register a presenter callback
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(SessionState) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut subscribers = self.subscribers.lock();
            // Under the lock so no change can slip between snapshot and registration
            let _ = tx.send(subscribers.current);
            subscribers.senders.push(tx);
        }

        let spawned = thread::Builder::new()
            .name("state-subscriber".to_string())
            .spawn(move || {
                while let Some(state) = rx.blocking_recv() {
                    callback(state);
                }
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to start state subscriber: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_subscriber_sees_current_then_changes() {
        let bus = StateBus::new(SessionState::Idle);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |state| sink.lock().push(state));

        bus.publish(SessionState::Starting);
        bus.publish(SessionState::Active);

        for _ in 0..100 {
            if seen.lock().len() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            *seen.lock(),
            vec![SessionState::Idle, SessionState::Starting, SessionState::Active]
        );
        assert_eq!(bus.current(), SessionState::Active);
    }

    #[test]
    fn test_watch_tracks_latest() {
        let bus = StateBus::new(SessionState::Idle);
        let rx = bus.watch();
        bus.publish(SessionState::Faulted);
        assert_eq!(*rx.borrow(), SessionState::Faulted);
    }

    #[test]
    fn test_rest_states() {
        assert!(SessionState::Idle.is_at_rest());
        assert!(SessionState::Faulted.is_at_rest());
        assert!(!SessionState::Active.is_at_rest());
        assert!(!SessionState::Stopping.is_at_rest());
        assert_eq!(SessionState::Active.to_string(), "Active");
    }
}
