//! Connection lifecycle of the engine: connect, follow events, reconnect.
//!
//! # Reconnection
//!
//! When the session drops the engine closes it, then retries every
//! `reconnectTimeout` ms. Every failed attempt closes its own connection
//! before the next one starts. Only a complete initialization (handshake
//! and block subscription) resets the attempt counter.
//! Once `maxReconnectAttempts` attempts have failed the failure is fatal:
//! the run loop is woken and `run` returns
//! [`IndexerError::MaxReconnectAttemptsExceeded`].

use super::context::Shared;
use super::Flavor;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{IndexerError, IndexerResult};
use crate::retry::with_retries_notify;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn, Instrument};

impl<F: Flavor> Shared<F> {
    /// Builds a new connection, waits for the handshake and subscribes to
    /// new blocks.
    ///
    /// On failure the new connection is closed before the error is
    /// returned. Success resets the reconnection attempt counter.
    pub(crate) async fn initialize_connection(self: &Arc<Self>) -> IndexerResult<()> {
        let url = self.config.ws_url.as_str();
        info!(url, "Connecting to node");

        let conn = Arc::new((self.connector)(url));
        // Follow events before connecting so `Connected` is not missed.
        self.spawn_event_pump(conn.events());
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&conn));

        conn.connect();
        let ready = match conn.wait_connection().await {
            Ok(()) => self.subscribe_to_latest_block(&conn).await,
            Err(e) => Err(IndexerError::connection(
                format!("Failed to connect to {url}: {e:#}"),
                Some(e.into()),
            )),
        };

        if let Err(err) = ready {
            // A half-open session must not outlive a failed attempt.
            self.disconnect().await;
            return Err(err);
        }

        self.reconnect_attempts.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_event_pump(self: &Arc<Self>, mut events: broadcast::Receiver<ConnectionEvent>) {
        let shared = Arc::downgrade(self);
        let pump = tokio::spawn(
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let Some(shared) = shared.upgrade() else {
                                break;
                            };
                            shared.handle_connection_event(event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Connection events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            .instrument(self.span.clone()),
        );

        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(pump);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                info!(url = %self.config.ws_url, "Connected");
                // Late events of a closed attempt must not count.
                let up = self.current_connection().is_some_and(|conn| conn.is_connected());
                self.connected.send_replace(up);
            }
            ConnectionEvent::Disconnected => {
                self.connected.send_replace(false);
                if self.stopping.load(Ordering::SeqCst) || self.reconnecting.load(Ordering::SeqCst) {
                    debug!("Connection closed");
                    return;
                }

                warn!(url = %self.config.ws_url, "Connection lost");
                let shared = Arc::clone(self);
                tokio::spawn(
                    async move {
                        // Failures are reported through `fail`.
                        let _ = shared.reconnect().await;
                    }
                    .instrument(self.span.clone()),
                );
            }
            ConnectionEvent::Error(cause) => {
                error!(error = %cause, "Connection error");
            }
            ConnectionEvent::Block(height) => {
                debug!(block = height, "New block");
                self.latest_block.send_replace(Some(height));
            }
        }
    }

    /// Replaces a lost connection.
    ///
    /// Returns immediately if another reconnection is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::MaxReconnectAttemptsExceeded`] once every
    /// attempt has failed. The same error is recorded for `run`.
    pub(crate) async fn reconnect(self: Arc<Self>) -> IndexerResult<()> {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnection already in progress");
            return Ok(());
        }

        let result = self.reconnect_attempts_loop().await;
        if let Err(IndexerError::MaxReconnectAttemptsExceeded { attempts }) = &result {
            self.fail(IndexerError::max_reconnect_exceeded(*attempts));
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        result
    }

    async fn reconnect_attempts_loop(self: &Arc<Self>) -> IndexerResult<()> {
        let url = self.config.ws_url.as_str();
        let max_attempts = self.config.max_reconnect_attempts;
        let mut shutdown = self.shutdown.subscribe();

        self.disconnect().await;

        loop {
            if self.stopping.load(Ordering::SeqCst) || self.is_shutting_down() {
                return Ok(());
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > max_attempts {
                error!(fatal = true, url, max_attempts, "Could not reconnect, giving up");
                return Err(IndexerError::max_reconnect_exceeded(max_attempts));
            }

            warn!(
                attempt,
                max_attempts,
                delay_ms = self.config.reconnect_timeout,
                "Reconnecting to {url}..."
            );
            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_delay()) => {}
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            }

            match self.initialize_connection().await {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    return Ok(());
                }
                Err(err) => warn!(attempt, error = %err, "Reconnection attempt failed"),
            }
        }
    }

    async fn subscribe_to_latest_block(&self, conn: &F::Connection) -> IndexerResult<()> {
        with_retries_notify(
            || conn.subscribe_to_latest_block(),
            self.config.max_request_retries,
            self.config.request_retry_delay(),
            |err| warn!(error = %err, "Failed to subscribe to new blocks, retrying..."),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to subscribe to new blocks");
            IndexerError::connection("Failed to subscribe to new blocks", Some(e.into()))
        })?;

        info!("Subscribed to new blocks");
        Ok(())
    }

    /// Stops block notifications on the current connection, if any.
    pub(crate) async fn unsubscribe_from_latest_block(&self) {
        let Some(conn) = self.current_connection().filter(|conn| conn.is_connected()) else {
            return;
        };

        let result = with_retries_notify(
            || conn.unsubscribe_from_latest_block(),
            self.config.max_request_retries,
            self.config.request_retry_delay(),
            |err| warn!(error = %err, "Failed to unsubscribe from new blocks, retrying..."),
        )
        .await;

        match result {
            Ok(()) => info!("Unsubscribed from new blocks"),
            Err(err) => error!(error = %err, "Failed to unsubscribe from new blocks"),
        }
    }

    /// Closes the current connection, if any.
    pub(crate) async fn disconnect(&self) {
        self.connected.send_replace(false);
        if let Some(conn) = self.current_connection() {
            if let Err(err) = conn.disconnect().await {
                warn!(error = %err, "Failed to close connection cleanly");
            }
        }
    }

    /// Connection that is up right now, if any.
    fn live_connection(&self) -> Option<Arc<F::Connection>> {
        if !*self.connected.borrow() {
            return None;
        }
        self.current_connection().filter(|conn| conn.is_connected())
    }

    /// Waits for an established connection.
    ///
    /// A live connection is handed out even while stopping: `stop` closes
    /// it only after the in-flight scan has finished.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::NotRunning`] if the indexer shuts down while
    /// no connection is up.
    pub(crate) async fn get_connection(&self) -> IndexerResult<Arc<F::Connection>> {
        if let Some(conn) = self.live_connection() {
            return Ok(conn);
        }

        let mut connected = self.connected.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return Err(IndexerError::NotRunning),
            up = async { connected.wait_for(|up| *up).await.map(|_| ()) } => {
                if up.is_err() {
                    return Err(IndexerError::NotRunning);
                }
            }
        }

        self.current_connection().ok_or(IndexerError::NotRunning)
    }
}
