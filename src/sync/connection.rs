// Push-channel connection lifecycle.
// Owns the single transport connection; everything else borrows its channel.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use super::channel::{EventHandler, PushChannel, Subscription};
use crate::error::ChatResult;
use crate::models::ConnectionState;

/// Transport-level signals reported through a `LifecycleHandle`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// Handshake acknowledged.
    Connected,
    /// Transport dropped.
    Disconnected(String),
    /// Connect attempt (or an established transport) failed.
    Failed(String),
}

/// A push transport: the channel plus the ability to open and close it.
///
/// `open` starts a connection attempt; the transport reports its progress by
/// calling back into the supplied handle, never by being polled.
pub trait PushTransport: PushChannel {
    fn open(&self, lifecycle: LifecycleHandle);
    fn close(&self);
}

/// Callback handle given to the transport for one connection attempt.
///
/// Handles carry the generation they were issued for; once the manager has
/// moved on (teardown or a newer attempt), their callbacks are ignored.
#[derive(Clone)]
pub struct LifecycleHandle {
    generation: u64,
    manager: Weak<ConnectionManager>,
}

impl LifecycleHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connected(&self) -> bool {
        self.signal(TransportSignal::Connected)
    }

    pub fn disconnected(&self, reason: &str) -> bool {
        self.signal(TransportSignal::Disconnected(reason.to_string()))
    }

    pub fn failed(&self, reason: &str) -> bool {
        self.signal(TransportSignal::Failed(reason.to_string()))
    }

    /// Returns false when the signal was stale and therefore dropped.
    pub fn signal(&self, signal: TransportSignal) -> bool {
        match self.manager.upgrade() {
            Some(manager) => manager.apply_signal(self.generation, signal),
            None => false,
        }
    }
}

/// Next state for `current` after `signal`.
///
/// Error is an overlay on connecting/disconnected; a failure on an
/// established connection counts as a drop.
pub fn next_state(current: &ConnectionState, signal: &TransportSignal) -> ConnectionState {
    match (current, signal) {
        (_, TransportSignal::Connected) => ConnectionState::Connected,
        (ConnectionState::Connected, TransportSignal::Failed(_)) => ConnectionState::Disconnected,
        (_, TransportSignal::Failed(reason)) => ConnectionState::Error(reason.clone()),
        (_, TransportSignal::Disconnected(_)) => ConnectionState::Disconnected,
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    generation: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PushTransport>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(ConnectionManager {
            transport,
            generation: AtomicU64::new(0),
            state_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The channel other components borrow to subscribe and emit.
    pub fn channel(&self) -> Arc<dyn PushChannel> {
        // Borrowers cannot clear listeners they do not own.
        Arc::new(BorrowedChannel {
            transport: self.transport.clone(),
        })
    }

    /// Start the connection for an authenticated session.
    pub fn init(self: &Arc<Self>) {
        info!("Initializing push connection");
        self.start_attempt();
    }

    /// Force a new connection attempt unless already connected.
    /// Returns whether an attempt was started.
    pub fn reconnect(self: &Arc<Self>) -> bool {
        if self.is_connected() {
            debug!("Reconnect requested while connected; ignoring");
            return false;
        }
        info!("Reconnecting push connection");
        self.start_attempt();
        true
    }

    /// Tear the transport down and return to a clean disconnected state.
    /// Idempotent; callbacks from earlier attempts are ignored afterwards.
    pub fn teardown(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Tearing down push connection (generation {})", generation);
        self.transport.close();
        self.transport.remove_all_listeners();
        self.set_state(ConnectionState::Disconnected);
    }

    fn start_attempt(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connecting);
        self.transport.open(LifecycleHandle {
            generation,
            manager: Arc::downgrade(self),
        });
    }

    fn apply_signal(&self, generation: u64, signal: TransportSignal) -> bool {
        let current_generation = self.generation.load(Ordering::SeqCst);
        if generation != current_generation {
            debug!(
                "Ignoring stale transport signal {:?} (generation {} != {})",
                signal, generation, current_generation
            );
            return false;
        }

        let next = next_state(&self.state(), &signal);
        match &next {
            ConnectionState::Connected => info!("Push connection established"),
            ConnectionState::Disconnected => warn!("Push connection dropped: {:?}", signal),
            ConnectionState::Error(reason) => warn!("Push connection error: {}", reason),
            ConnectionState::Connecting => {}
        }
        self.set_state(next);
        true
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

struct BorrowedChannel {
    transport: Arc<dyn PushTransport>,
}

impl PushChannel for BorrowedChannel {
    fn subscribe(&self, event: &str, handler: EventHandler) -> Subscription {
        self.transport.subscribe(event, handler)
    }

    fn emit(&self, event: &str, payload: serde_json::Value) -> ChatResult<()> {
        self.transport.emit(event, payload)
    }

    fn remove_all_listeners(&self) {
        warn!("Ignoring remove_all_listeners on a borrowed channel; only teardown may clear listeners");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let disconnected = ConnectionState::Disconnected;
        let connecting = ConnectionState::Connecting;
        let connected = ConnectionState::Connected;

        assert_eq!(next_state(&connecting, &TransportSignal::Connected), connected);
        assert_eq!(
            next_state(&connecting, &TransportSignal::Failed("refused".into())),
            ConnectionState::Error("refused".into())
        );
        assert_eq!(
            next_state(&disconnected, &TransportSignal::Failed("auth".into())),
            ConnectionState::Error("auth".into())
        );
        assert_eq!(
            next_state(&connected, &TransportSignal::Disconnected("ping timeout".into())),
            disconnected
        );
        assert_eq!(
            next_state(&connected, &TransportSignal::Failed("reset".into())),
            ConnectionState::Disconnected
        );
    }
}
