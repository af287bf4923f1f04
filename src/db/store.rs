//! Indexer-facing persistence store.
//!
//! Wraps a [`SqliteDatabase`] with the open/close lifecycle of an indexer
//! and the handful of operations the recovery protocol needs.

use super::models::{identity, Checkpoint, PendingEvent};
use super::repository::{Repository, Where};
use super::SqliteDatabase;
use crate::error::{IndexerError, IndexerResult};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Checkpoint and pending-event storage of one indexer.
///
/// Created closed; [`IndexerStore::open`] must succeed before any other
/// operation.
#[derive(Debug)]
pub struct IndexerStore {
    path: PathBuf,
    db: RwLock<Option<SqliteDatabase>>,
}

impl IndexerStore {
    /// Creates a closed store for the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: RwLock::new(None),
        }
    }

    /// Location of the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the store, creating and migrating the file if needed.
    ///
    /// Opening an open store does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the file cannot be set up.
    pub async fn open(&self) -> IndexerResult<()> {
        let mut db = self.db.write().await;
        if db.is_none() {
            *db = Some(SqliteDatabase::open(&self.path).await?);
            info!(path = %self.path.display(), "Persistence store opened");
        }
        Ok(())
    }

    /// Closes the store. Closing a closed store does nothing.
    pub async fn close(&self) {
        if let Some(db) = self.db.write().await.take() {
            db.close().await;
            info!(path = %self.path.display(), "Persistence store closed");
        }
    }

    /// Returns `true` between [`IndexerStore::open`] and [`IndexerStore::close`].
    pub async fn is_open(&self) -> bool {
        self.db.read().await.is_some()
    }

    async fn database(&self) -> IndexerResult<SqliteDatabase> {
        self.db.read().await.clone().ok_or_else(|| {
            IndexerError::database(
                format!("Persistence store {} is not open", self.path.display()),
                None,
            )
        })
    }

    /// Stored checkpoint, if any.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the store is closed or
    /// the query fails.
    pub async fn checkpoint(&self) -> IndexerResult<Option<Checkpoint>> {
        self.database()
            .await?
            .repository::<Checkpoint>()
            .find_one(Where::all())
            .await
    }

    /// Replaces the stored checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the store is closed or
    /// the write fails.
    #[instrument(skip_all, fields(block = checkpoint.block))]
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> IndexerResult<()> {
        self.database()
            .await?
            .repository::<Checkpoint>()
            .update_or_create(Where::all(), checkpoint)
            .await?;
        debug!("Checkpoint saved");
        Ok(())
    }

    /// Moves the checkpoint to `pending` and queues it, in one transaction.
    ///
    /// Recording an already queued identity overwrites it instead of adding
    /// a second row.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the store is closed or any
    /// statement fails; nothing is written in that case.
    #[instrument(skip_all, fields(event = %pending.event, hash = %pending.hash, index = pending.index, block = pending.block))]
    pub async fn record_event(&self, pending: &PendingEvent) -> IndexerResult<()> {
        let checkpoint =
            Checkpoint::at_event(pending.block, &pending.event, &pending.hash, pending.index);

        let tx = self.database().await?.begin().await?;
        {
            tx.repository::<Checkpoint>()
                .update_or_create(Where::all(), &checkpoint)
                .await?;
            tx.repository::<PendingEvent>()
                .update_or_create(Where::matching(pending.identity()), pending)
                .await?;
        }
        tx.commit().await?;

        debug!("Event recorded");
        Ok(())
    }

    /// Every pending event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the store is closed or
    /// the query fails.
    pub async fn pending_events(&self) -> IndexerResult<Vec<PendingEvent>> {
        self.database()
            .await?
            .repository::<PendingEvent>()
            .find_all(Where::all())
            .await
    }

    /// Removes the pending event `(event, hash, index)`.
    ///
    /// Returns `true` if a row was removed.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the store is closed or
    /// the delete fails.
    pub async fn remove_pending(&self, event: &str, hash: &str, index: u32) -> IndexerResult<bool> {
        let removed = self
            .database()
            .await?
            .repository::<PendingEvent>()
            .delete(Where::matching(identity(event, hash, index)))
            .await?;
        debug!(event, hash, index, removed, "Pending event acknowledged");
        Ok(removed > 0)
    }
}
