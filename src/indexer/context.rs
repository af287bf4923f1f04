//! Engine state shared between the run loop, connection tasks and scanners.

use super::Flavor;
use crate::config::IndexerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::db::{Checkpoint, IndexerStore, PendingEvent};
use crate::error::{IndexerError, IndexerResult};
use crate::events::{EventBus, EventInfo, EventSet};
use crate::retry::with_retries_notify;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Factory building a connection for an endpoint.
pub type Connector<C> = Box<dyn Fn(&str) -> C + Send + Sync>;

type Request<F> = <<F as Flavor>::Connection as Connection>::Request;
type Response<F> = <<F as Flavor>::Connection as Connection>::Response;

/// Where the scan stands relative to the last recorded event.
#[derive(Debug, Default)]
pub(crate) struct Recovery {
    /// In-memory view of the stored checkpoint.
    pub checkpoint: Option<Checkpoint>,
    /// The scan has passed the event named by `checkpoint`.
    pub reached_last_event: bool,
}

pub(crate) struct Shared<F: Flavor> {
    pub config: IndexerConfig<F::Config>,
    pub span: tracing::Span,
    pub bus: EventBus<F::Events>,
    pub store: Option<IndexerStore>,
    /// Serializes every checkpoint write with the in-memory recovery state.
    pub recovery: tokio::sync::Mutex<Recovery>,
    /// Held for the duration of each scan; `stop` waits on it.
    pub scan_guard: tokio::sync::Mutex<()>,
    pub connector: Connector<F::Connection>,
    pub connection: RwLock<Option<Arc<F::Connection>>>,
    pub pump: Mutex<Option<JoinHandle<()>>>,
    pub connected: watch::Sender<bool>,
    pub latest_block: watch::Sender<Option<u64>>,
    pub shutdown: watch::Sender<bool>,
    pub fatal: Mutex<Option<IndexerError>>,
    pub reconnect_attempts: AtomicU32,
    pub reconnecting: AtomicBool,
    pub running: AtomicBool,
    pub stopping: AtomicBool,
}

impl<F: Flavor> Shared<F> {
    pub fn new(config: IndexerConfig<F::Config>, connector: Connector<F::Connection>) -> Self {
        let span = tracing::info_span!("indexer", name = %config.logger.name);
        let store = config
            .persist
            .then(|| IndexerStore::new(config.persistence_file_path.clone()));

        Self {
            config,
            span,
            bus: EventBus::new(),
            store,
            recovery: tokio::sync::Mutex::new(Recovery::default()),
            scan_guard: tokio::sync::Mutex::new(()),
            connector,
            connection: RwLock::new(None),
            pump: Mutex::new(None),
            connected: watch::channel(false).0,
            latest_block: watch::channel(None).0,
            shutdown: watch::channel(false).0,
            fatal: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            reconnecting: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn current_connection(&self) -> Option<Arc<F::Connection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.reconnecting.load(Ordering::SeqCst) {
            return ConnectionState::Reconnecting;
        }
        self.current_connection()
            .map_or(ConnectionState::Disconnected, |conn| conn.state())
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Records a fatal error for `run` to return and wakes the run loop.
    pub fn fail(&self, err: IndexerError) {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(err);
        self.shutdown.send_replace(true);
    }

    pub fn take_fatal(&self) -> Option<IndexerError> {
        self.fatal.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Stops the indexer: signals the run loop, lets an in-flight scan
    /// finish, then closes the store and the connection.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Indexer is already stopped");
            return;
        }

        info!("Stopping indexer...");
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let _scan = self.scan_guard.lock().await;
        let close_store = async {
            if let Some(store) = &self.store {
                store.close().await;
            }
        };
        tokio::join!(close_store, self.unsubscribe_from_latest_block());
        self.disconnect().await;

        info!("Indexer stopped");
    }
}

impl<F: Flavor> Drop for Shared<F> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
    }
}

/// Handle given to scan operations and listeners.
///
/// Cloning is cheap; every clone drives the same indexer.
pub struct IndexerContext<F: Flavor> {
    pub(crate) shared: Arc<Shared<F>>,
}

impl<F: Flavor> Clone for IndexerContext<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: Flavor> std::fmt::Debug for IndexerContext<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerContext")
            .field("name", &self.shared.config.logger.name)
            .field("running", &self.shared.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<F: Flavor> IndexerContext<F> {
    /// Merged configuration.
    #[must_use]
    pub fn config(&self) -> &IndexerConfig<F::Config> {
        &self.shared.config
    }

    /// Latest block height reported by the connection.
    #[must_use]
    pub fn latest_block(&self) -> Option<u64> {
        *self.shared.latest_block.borrow()
    }

    /// Reports an event found by a scan.
    ///
    /// Does nothing when no listener is registered for the event's kind.
    /// Without persistence the event is published right away. With
    /// persistence, events up to and including the last recorded one are
    /// skipped; later events move the checkpoint and are queued in one
    /// transaction, then published.
    ///
    /// # Errors
    ///
    /// Returns an error (also logged) if the event cannot be encoded or
    /// recorded; it is not published in that case.
    pub async fn notify_event(
        &self,
        event: F::Events,
        hash: &str,
        index: u32,
        block: u64,
    ) -> IndexerResult<()> {
        let shared = &self.shared;
        let kind = event.kind();
        let name = <F::Events as EventSet>::name(kind);

        if shared.bus.listener_count(kind) == 0 {
            return Ok(());
        }

        let info = EventInfo::new(name, hash, index, block);
        let Some(store) = &shared.store else {
            shared.bus.emit(&event, &info);
            return Ok(());
        };

        let mut recovery = shared.recovery.lock().await;
        if recovery.reached_last_event {
            let pending = PendingEvent {
                event: name.to_string(),
                hash: hash.to_string(),
                index,
                block,
                data: serde_json::to_value(&event).map_err(|e| {
                    error!(event = name, hash, index, block, error = %e, "Failed to encode event");
                    IndexerError::from(e)
                })?,
            };

            if let Err(err) = store.record_event(&pending).await {
                error!(event = name, hash, index, block, error = %err, "Failed to record event");
                return Err(err);
            }
            recovery.checkpoint = Some(Checkpoint::at_event(block, name, hash, index));
            shared.bus.emit(&event, &info);
        } else if recovery
            .checkpoint
            .as_ref()
            .is_some_and(|checkpoint| checkpoint.is_event(name, hash, index))
        {
            recovery.reached_last_event = true;
            info!(event = name, hash, index, block, "Caught up with last recorded event");
        } else {
            debug!(event = name, hash, index, block, "Skipping already recorded event");
        }

        Ok(())
    }

    /// Reports that `block` was scanned completely.
    ///
    /// Moves the checkpoint to `block + 1` without an event.
    ///
    /// # Errors
    ///
    /// Returns an error (also logged) if the checkpoint cannot be written.
    pub async fn notify_block(&self, block: u64) -> IndexerResult<()> {
        let shared = &self.shared;
        let Some(store) = &shared.store else {
            return Ok(());
        };

        let mut recovery = shared.recovery.lock().await;
        let checkpoint = Checkpoint::at_block(block.saturating_add(1));
        if let Err(err) = store.save_checkpoint(&checkpoint).await {
            error!(block, error = %err, "Failed to save checkpoint");
            return Err(err);
        }
        recovery.checkpoint = Some(checkpoint);
        recovery.reached_last_event = true;
        Ok(())
    }

    /// Acknowledges a delivered event so it is not redelivered.
    ///
    /// Returns `true` if a pending event was removed.
    ///
    /// # Errors
    ///
    /// Returns an error (also logged) if the store rejects the delete.
    pub async fn event_done(
        &self,
        kind: <F::Events as EventSet>::Kind,
        hash: &str,
        index: u32,
    ) -> IndexerResult<bool> {
        self.remove_pending(<F::Events as EventSet>::name(kind), hash, index)
            .await
    }

    /// Same as [`IndexerContext::event_done`], from the identity a listener
    /// received.
    ///
    /// # Errors
    ///
    /// Returns an error (also logged) if the store rejects the delete.
    pub async fn acknowledge(&self, info: &EventInfo) -> IndexerResult<bool> {
        self.remove_pending(&info.event, &info.hash, info.index).await
    }

    async fn remove_pending(&self, event: &str, hash: &str, index: u32) -> IndexerResult<bool> {
        let Some(store) = &self.shared.store else {
            return Ok(false);
        };
        store
            .remove_pending(event, hash, index)
            .await
            .inspect_err(|err| {
                error!(event, hash, index, error = %err, "Failed to acknowledge event");
            })
    }

    /// Sends a request through the current connection, with retries.
    ///
    /// Waits for a connection when none is established. Each failure is
    /// logged and retried up to `maxRequestRetries` times,
    /// `requestRetryTimeout` apart.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::RequestError`] once retries are exhausted, or
    /// [`IndexerError::NotRunning`] if the indexer shuts down meanwhile.
    pub async fn request(&self, request: Request<F>) -> IndexerResult<Response<F>> {
        let shared = &self.shared;
        let outcome = with_retries_notify(
            || {
                let request = request.clone();
                async move {
                    let conn = match shared.get_connection().await {
                        Ok(conn) => conn,
                        Err(err) => return Ok(Err(err)),
                    };
                    conn.request(request)
                        .await
                        .map(Ok)
                        .map_err(|e| IndexerError::request(format!("{e:#}"), Some(e.into())))
                }
            },
            shared.config.max_request_retries,
            shared.config.request_retry_delay(),
            |err| warn!(request = ?request, error = %err, "Request failed, retrying..."),
        )
        .instrument(tracing::debug_span!("request"))
        .await;

        match outcome {
            Ok(result) => result,
            Err(err) => {
                error!(request = ?request, error = %err, "Request failed");
                Err(err)
            }
        }
    }
}
