//! Connection contract between the engine and a chain node.
//!
//! A [`Connection`] wraps one stateful WebSocket session. The engine drives
//! it through `connect` → `wait_connection` → `subscribe_to_latest_block`,
//! listens to its [`ConnectionEvent`] stream, and sends every chain request
//! through [`Connection::request`] (always wrapped in bounded retries).
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──handshake──▶ Connected
//!       ▲                        │                        │
//!       └────────failure─────────┘◀──────disconnect───────┤
//!                                                         ▼
//!                                                   Reconnecting
//! ```
//!
//! Chain bindings embed a [`ConnectionSignals`] to get the event channel,
//! the state machine and `is_connected` for free.

mod signals;

pub use signals::ConnectionSignals;

use async_trait::async_trait;
use std::fmt::{self, Debug};
use tokio::sync::broadcast;

/// Notifications published by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The handshake completed.
    Connected,
    /// The session ended, expectedly or not.
    Disconnected,
    /// The transport reported an error.
    Error(String),
    /// A new latest block height.
    Block(u64),
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Session lost, a new one is being negotiated.
    Reconnecting,
}

impl ConnectionState {
    /// Returns `true` if moving from `self` to `next` is allowed.
    ///
    /// Staying in the same state is always allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Reconnecting};
        matches!(
            (self, next),
            (Disconnected, Disconnected | Connecting)
                | (Connecting, Connecting | Connected | Disconnected)
                | (Connected, Connected | Disconnected | Reconnecting)
                | (Reconnecting, Reconnecting | Connecting | Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// A stateful connection to a chain node.
///
/// Implementations are chain bindings and live outside this crate. They
/// report failures with `eyre`; the engine categorizes them.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Request payload accepted by [`Connection::request`].
    type Request: Clone + Debug + Send + Sync + 'static;
    /// Response returned by [`Connection::request`].
    type Response: Send + 'static;

    /// Creates a disconnected connection to `url`.
    fn new(url: &str) -> Self
    where
        Self: Sized;

    /// Endpoint this connection talks to.
    fn url(&self) -> &str;

    /// Subscribes to the connection's notifications.
    ///
    /// Only notifications published after the call are received.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Starts the handshake without waiting for it.
    fn connect(&self);

    /// Waits until the handshake started by [`Connection::connect`] ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake failed.
    async fn wait_connection(&self) -> eyre::Result<()>;

    /// Starts publishing [`ConnectionEvent::Block`] for every new head.
    ///
    /// # Errors
    ///
    /// Returns an error if the node refused the subscription.
    async fn subscribe_to_latest_block(&self) -> eyre::Result<()>;

    /// Stops publishing block notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if the node refused the request.
    async fn unsubscribe_from_latest_block(&self) -> eyre::Result<()>;

    /// Closes the session.
    ///
    /// Must succeed on an already closed connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport failed to close cleanly.
    async fn disconnect(&self) -> eyre::Result<()>;

    /// Returns `true` while the session is established.
    fn is_connected(&self) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Sends one request to the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the request failed; the engine retries it.
    async fn request(&self, request: Self::Request) -> eyre::Result<Self::Response>;
}
