//! State machine and event channel shared by connection implementations.

use super::{ConnectionEvent, ConnectionState};
use eyre::{bail, Result};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Buffered notifications per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 256;

/// Event channel plus lifecycle state of one connection.
///
/// Transitions are checked against [`ConnectionState::can_transition_to`];
/// every transition into `Connected` or `Disconnected` publishes the
/// matching [`ConnectionEvent`].
#[derive(Debug)]
pub struct ConnectionSignals {
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
}

impl Default for ConnectionSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSignals {
    /// Creates signals in the `Disconnected` state.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { events, state }
    }

    /// Subscribes to future notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver observing every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Returns `true` in the `Connected` state.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Moves to `next`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is not allowed; the state is left
    /// unchanged.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState> {
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = Some(*current);
                let changed = *current != next;
                *current = next;
                changed
            } else {
                false
            }
        });

        let Some(previous) = previous else {
            bail!("invalid connection transition {} -> {next}", self.state());
        };
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
        Ok(previous)
    }

    /// Marks the handshake as started.
    ///
    /// # Errors
    ///
    /// Returns an error unless disconnected or reconnecting.
    pub fn connecting(&self) -> Result<()> {
        self.transition(ConnectionState::Connecting).map(|_| ())
    }

    /// Marks the handshake as completed and publishes `Connected`.
    ///
    /// # Errors
    ///
    /// Returns an error unless connecting.
    pub fn connected(&self) -> Result<()> {
        let previous = self.transition(ConnectionState::Connected)?;
        if previous != ConnectionState::Connected {
            self.publish(ConnectionEvent::Connected);
        }
        Ok(())
    }

    /// Marks the session as lost while a new one is negotiated.
    ///
    /// # Errors
    ///
    /// Returns an error unless connected.
    pub fn reconnecting(&self) -> Result<()> {
        self.transition(ConnectionState::Reconnecting).map(|_| ())
    }

    /// Marks the session as closed.
    ///
    /// Publishes `Disconnected` only when leaving another state, so closing
    /// twice notifies once.
    pub fn disconnected(&self) {
        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            debug!(from = %previous, "Connection closed");
            self.publish(ConnectionEvent::Disconnected);
        }
    }

    /// Publishes a transport error.
    pub fn error(&self, cause: impl std::fmt::Display) {
        self.publish(ConnectionEvent::Error(cause.to_string()));
    }

    /// Publishes a new latest block height.
    pub fn block(&self, height: u64) {
        self.publish(ConnectionEvent::Block(height));
    }

    /// Waits until the handshake ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fell back to `Disconnected`
    /// instead of reaching `Connected`.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let reached = state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
            .await
            .map(|s| *s)?;

        if reached == ConnectionState::Connected {
            Ok(())
        } else {
            bail!("connection closed before the handshake completed")
        }
    }

    fn publish(&self, event: ConnectionEvent) {
        // No subscribers is not an error: nobody is listening yet.
        let _ = self.events.send(event);
    }
}
