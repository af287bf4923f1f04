//! The indexing engine.
//!
//! An [`Indexer`] follows a chain through a [`Connection`], hands block
//! ranges to a [`Scanner`] and publishes what the scanner finds to the
//! listeners registered with [`Indexer::on`].
//!
//! # Run loop
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────────────┐
//! │ open store   │──▶│ load checkpoint│──▶│ republish pending    │
//! │ + connect    │   │                │   │ events               │
//! └──────────────┘   └────────────────┘   └──────────┬───────────┘
//!                                                    ▼
//!              ┌─────────────────────────────────────────────────┐
//!              │ wait for a new block → compute range → scan     │◀─┐
//!              └─────────────────────────┬───────────────────────┘  │
//!                                        └──────────────────────────┘
//! ```
//!
//! Ranges are contiguous: each scan starts where the previous one said
//! to continue. A failed scan is retried with the same start on the next
//! block. The loop ends when [`Indexer::stop`] is called, once a literal
//! `endingBlock` has been passed, or on a fatal error.
//!
//! # Delivery
//!
//! With persistence enabled every published event is first written to the
//! pending queue and stays there until acknowledged with
//! [`IndexerContext::event_done`]. On the next start unacknowledged events
//! are published again, so listeners see each event at least once.

mod connection;
mod context;

pub use context::{Connector, IndexerContext};

use crate::config::{BlockTag, IndexerConfig};
use crate::connection::{Connection, ConnectionState};
use crate::db::Checkpoint;
use crate::error::{IndexerError, IndexerResult};
use crate::events::{EventInfo, EventSet, Subscription};
use async_trait::async_trait;
use context::Shared;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// Binds the engine to one chain.
///
/// A flavor names the connection type, the event set and the flavor
/// specific configuration. It carries no state.
pub trait Flavor: Send + Sync + 'static {
    /// Used to derive the logger name and the default store location.
    const NAME: &'static str;

    /// Connection to the chain.
    type Connection: Connection;
    /// Events scanners report.
    type Events: EventSet;
    /// Flavor specific configuration, flattened into the common one.
    type Config: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;
    /// What a scan receives; built from the computed range.
    type ScanOptions: From<ScanRange> + Send + 'static;

    /// Configuration defaults of the flavor, lowest priority first.
    #[must_use]
    fn default_layers() -> Vec<Value> {
        Vec::new()
    }
}

/// Inclusive range of blocks to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanRange {
    /// First block of the range.
    pub starting_block: u64,
    /// Last block of the range.
    pub ending_block: u64,
}

/// Scans block ranges for events.
///
/// Implementations report events with [`IndexerContext::notify_event`],
/// fully scanned blocks with [`IndexerContext::notify_block`], and return
/// the block the next scan should start from.
#[async_trait]
pub trait Scanner<F: Flavor>: Send + Sync + 'static {
    /// Scans the range described by `options`.
    ///
    /// # Errors
    ///
    /// Any error makes the engine retry the same range on the next block.
    async fn scan(&self, ctx: &IndexerContext<F>, options: F::ScanOptions) -> IndexerResult<u64>;
}

/// Highest block a checkpoint claims to have seen.
///
/// An event checkpoint names the block of that event; a block cursor names
/// the block after the last one scanned.
fn last_seen(checkpoint: &Checkpoint) -> u64 {
    if checkpoint.has_event() {
        checkpoint.block
    } else {
        checkpoint.block.saturating_sub(1)
    }
}

/// What the run loop does with the latest block.
enum Plan {
    Scan(ScanRange),
    Wait,
    Done,
}

/// A resumable indexer.
pub struct Indexer<F: Flavor, S> {
    ctx: IndexerContext<F>,
    scanner: S,
}

impl<F: Flavor, S> Debug for Indexer<F, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

impl<F: Flavor, S: Scanner<F>> Indexer<F, S> {
    /// Creates an indexer from the user configuration.
    ///
    /// The configuration is validated, then merged over the engine and
    /// flavor defaults. Nothing is opened until [`Indexer::run`].
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::ConfigError`] if the configuration is invalid.
    pub fn new(user: Value, scanner: S) -> IndexerResult<Self> {
        Self::with_connector(user, scanner, |url| {
            <F::Connection as Connection>::new(url)
        })
    }

    /// Same as [`Indexer::new`] with a custom connection factory.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::ConfigError`] if the configuration is invalid.
    pub fn with_connector<C>(user: Value, scanner: S, connector: C) -> IndexerResult<Self>
    where
        C: Fn(&str) -> F::Connection + Send + Sync + 'static,
    {
        let config = IndexerConfig::<F::Config>::build(F::NAME, F::default_layers(), user)?;
        let shared = Arc::new(Shared::new(config, Box::new(connector)));

        Ok(Self {
            ctx: IndexerContext { shared },
            scanner,
        })
    }

    /// Runs the indexer until it is stopped.
    ///
    /// Opens the store and connects (concurrently), republishes pending
    /// events, then scans every new block. Calling it while running logs a
    /// warning and returns.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that ended the run: a store or connection
    /// that cannot be set up, exhausted reconnection attempts, or a
    /// checkpoint ahead of the chain.
    pub async fn run(&self) -> IndexerResult<()> {
        let span = self.ctx.shared.span.clone();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> IndexerResult<()> {
        let shared = &self.ctx.shared;
        if shared.running.swap(true, Ordering::SeqCst) {
            warn!("Indexer is already running");
            return Ok(());
        }

        shared.stopping.store(false, Ordering::SeqCst);
        shared.shutdown.send_replace(false);
        shared.reconnect_attempts.store(0, Ordering::SeqCst);
        let _ = shared.take_fatal();

        info!(
            url = %shared.config.ws_url,
            starting_block = %shared.config.starting_block,
            ending_block = %shared.config.ending_block,
            persist = shared.config.persist,
            "Starting indexer"
        );

        let outcome = match self.start().await {
            Ok(()) => self.index_blocks().await,
            Err(err) => {
                error!(fatal = true, error = %err, "Indexer failed to start");
                Err(err)
            }
        };
        let outcome = shared.take_fatal().map_or(outcome, Err);

        if shared.running.load(Ordering::SeqCst) {
            shared.stop().await;
        }
        outcome
    }

    /// Opens the store and connects, then recovers.
    async fn start(&self) -> IndexerResult<()> {
        let shared = &self.ctx.shared;

        let open_store = async {
            match &shared.store {
                Some(store) => store.open().await,
                None => Ok(()),
            }
        };
        let connect = async {
            match shared.initialize_connection().await {
                Ok(()) => Ok(()),
                Err(err) => {
                    warn!(error = %err, "Initial connection failed");
                    Arc::clone(shared).reconnect().await
                }
            }
        };

        futures_util::future::try_join(open_store, connect).await?;
        self.recover().await
    }

    /// Loads the checkpoint and republishes unacknowledged events.
    async fn recover(&self) -> IndexerResult<()> {
        let shared = &self.ctx.shared;
        let Some(store) = &shared.store else {
            let mut recovery = shared.recovery.lock().await;
            recovery.checkpoint = None;
            recovery.reached_last_event = true;
            return Ok(());
        };

        let checkpoint = store.checkpoint().await?;
        {
            let mut recovery = shared.recovery.lock().await;
            recovery.reached_last_event = !checkpoint.as_ref().is_some_and(Checkpoint::has_event);
            recovery.checkpoint = checkpoint;
            if let Some(checkpoint) = &recovery.checkpoint {
                info!(
                    block = checkpoint.block,
                    event = ?checkpoint.event,
                    hash = ?checkpoint.hash,
                    index = ?checkpoint.index,
                    "Resuming from checkpoint"
                );
            }
        }

        let pending = store.pending_events().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Republishing pending events");
        }
        for pending in pending {
            match serde_json::from_value::<F::Events>(pending.data) {
                Ok(event) => {
                    let info =
                        EventInfo::new(pending.event, pending.hash, pending.index, pending.block);
                    shared.bus.emit(&event, &info);
                }
                Err(err) => {
                    error!(
                        event = %pending.event,
                        hash = %pending.hash,
                        index = pending.index,
                        error = %err,
                        "Failed to decode pending event"
                    );
                }
            }
        }
        Ok(())
    }

    async fn index_blocks(&self) -> IndexerResult<()> {
        let shared = &self.ctx.shared;
        let mut blocks = shared.latest_block.subscribe();
        // A height received while starting counts as new.
        blocks.mark_changed();
        let mut shutdown = shared.shutdown.subscribe();
        let mut next_block = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                changed = blocks.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
            let latest = *blocks.borrow_and_update();
            let Some(latest) = latest else {
                continue;
            };

            let range = match self.plan(next_block, latest).await? {
                Plan::Scan(range) => range,
                Plan::Wait => continue,
                Plan::Done => return Ok(()),
            };

            let scan_guard = shared.scan_guard.lock().await;
            if shared.is_shutting_down() {
                return Ok(());
            }

            info!(
                starting_block = range.starting_block,
                ending_block = range.ending_block,
                latest_block = latest,
                "Scanning blocks"
            );
            match self.scanner.scan(&self.ctx, range.into()).await {
                Ok(next) => {
                    debug!(next_block = next, "Scan complete");
                    next_block = Some(next);
                    if self.past_ending_block(next) {
                        return Ok(());
                    }
                }
                Err(err) => {
                    error!(
                        starting_block = range.starting_block,
                        ending_block = range.ending_block,
                        error = %err,
                        "Scan failed, retrying on next block"
                    );
                    self.rearm_recovery(range.starting_block).await;
                    next_block = Some(range.starting_block);
                }
            }
            drop(scan_guard);
        }
    }

    /// Computes the next range from the last scan (or the checkpoint, or
    /// `startingBlock`) up to `endingBlock` capped at `latest`.
    async fn plan(&self, next_block: Option<u64>, latest: u64) -> IndexerResult<Plan> {
        let config = &self.ctx.shared.config;

        let start = match next_block {
            Some(block) => block,
            None => {
                let checkpoint = self.ctx.shared.recovery.lock().await.checkpoint.clone();
                match checkpoint {
                    Some(checkpoint) if last_seen(&checkpoint) > latest => {
                        error!(
                            fatal = true,
                            checkpoint = checkpoint.block,
                            latest_block = latest,
                            "Checkpoint is ahead of the chain"
                        );
                        return Err(IndexerError::state(
                            format!(
                                "Checkpoint block {} is ahead of latest block {latest}",
                                checkpoint.block
                            ),
                            None,
                        ));
                    }
                    Some(checkpoint) => checkpoint.block,
                    None => config.starting_block.resolve(latest),
                }
            }
        };

        if self.past_ending_block(start) {
            return Ok(Plan::Done);
        }

        let end = config.ending_block.resolve(latest).min(latest);
        if start > end {
            debug!(next_block = start, latest_block = latest, "Waiting for new blocks");
            return Ok(Plan::Wait);
        }

        Ok(Plan::Scan(ScanRange {
            starting_block: start,
            ending_block: end,
        }))
    }

    /// Returns `true` once `next` lies beyond a literal `endingBlock`.
    fn past_ending_block(&self, next: u64) -> bool {
        match self.ctx.shared.config.ending_block {
            BlockTag::Number(end) if next > end => {
                info!(next_block = next, ending_block = end, "Reached ending block");
                true
            }
            _ => false,
        }
    }

    /// After a failed scan, skips again up to the last recorded event if
    /// it lies inside the range about to be retried.
    async fn rearm_recovery(&self, start: u64) {
        let mut recovery = self.ctx.shared.recovery.lock().await;
        let inside = recovery
            .checkpoint
            .as_ref()
            .is_some_and(|checkpoint| checkpoint.has_event() && checkpoint.block >= start);
        if inside && recovery.reached_last_event {
            recovery.reached_last_event = false;
            debug!(start, "Skipping events recorded before the failure");
        }
    }

    /// Stops the indexer.
    ///
    /// An in-flight scan finishes first. Then the store is closed and the
    /// block subscription dropped, concurrently, and the connection closed.
    /// Stopping a stopped indexer logs a warning.
    pub async fn stop(&self) {
        let span = self.ctx.shared.span.clone();
        self.ctx.shared.stop().instrument(span).await;
    }
}

impl<F: Flavor, S> Indexer<F, S> {
    /// Registers a listener for every event of `kind`.
    pub fn on<L>(&self, kind: <F::Events as EventSet>::Kind, listener: L) -> Subscription<F::Events>
    where
        L: Fn(&F::Events, &EventInfo) + Send + Sync + 'static,
    {
        self.ctx.shared.bus.on(kind, listener)
    }

    /// Registers a listener for the next event of `kind` only.
    pub fn once<L>(
        &self,
        kind: <F::Events as EventSet>::Kind,
        listener: L,
    ) -> Subscription<F::Events>
    where
        L: Fn(&F::Events, &EventInfo) + Send + Sync + 'static,
    {
        self.ctx.shared.bus.once(kind, listener)
    }

    /// Removes every listener of `kind`.
    pub fn off_all(&self, kind: <F::Events as EventSet>::Kind) {
        self.ctx.shared.bus.off_all(kind);
    }

    /// Number of listeners registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: <F::Events as EventSet>::Kind) -> usize {
        self.ctx.shared.bus.listener_count(kind)
    }

    /// Acknowledges a delivered event. See [`IndexerContext::event_done`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the delete.
    pub async fn event_done(
        &self,
        kind: <F::Events as EventSet>::Kind,
        hash: &str,
        index: u32,
    ) -> IndexerResult<bool> {
        self.ctx.event_done(kind, hash, index).await
    }

    /// Handle for listeners and background tasks.
    #[must_use]
    pub fn context(&self) -> IndexerContext<F> {
        self.ctx.clone()
    }

    /// Merged configuration.
    #[must_use]
    pub fn config(&self) -> &IndexerConfig<F::Config> {
        self.ctx.config()
    }

    /// Latest block height reported by the connection.
    #[must_use]
    pub fn latest_block(&self) -> Option<u64> {
        self.ctx.latest_block()
    }

    /// Returns `true` between [`Indexer::run`] and [`Indexer::stop`].
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ctx.shared.running.load(Ordering::SeqCst)
    }

    /// State of the current connection.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.ctx.shared.connection_state()
    }

    /// Checkpoint as last loaded or written.
    pub async fn checkpoint(&self) -> Option<Checkpoint> {
        self.ctx.shared.recovery.lock().await.checkpoint.clone()
    }
}
