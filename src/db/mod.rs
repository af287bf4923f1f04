//! Embedded, file-backed persistence for checkpoints and pending events.
//!
//! This module provides SQLite-based storage for:
//! - The indexer checkpoint (single row, upserted in place)
//! - Pending events awaiting acknowledgment (at-least-once delivery queue)
//!
//! # Architecture
//!
//! - `repository`: Storage-agnostic CRUD contract, filters and values
//! - `adapter`: Parameterized SQL statement builders with dialect hooks
//! - `sqlite`: SQLite repository over a pool or a transaction
//! - `models`: Records that map to database tables
//! - `store`: The indexer-facing store built on the above
//! - A single pooled connection in WAL mode (one writer per file)
//! - Migration system for schema versioning

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Sqlite, SqlitePool, Transaction,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{IndexerError, IndexerResult};

pub mod adapter;
pub mod models;
pub mod repository;
pub mod sqlite;
pub mod store;

pub use models::{Checkpoint, PendingEvent};
pub use repository::{Entity, Fields, Repository, Row, SqlValue, Where};
pub use sqlite::SqliteRepository;
pub use store::IndexerStore;

use sqlite::Executor;

/// Tables every store must contain once migrated.
const REQUIRED_TABLES: [&str; 2] = ["checkpoint", "pending_event"];

/// Creates a SQLite connection pool for the file at `path`.
///
/// # Configuration
///
/// - **WAL mode**: Readers never block the writer
/// - **Synchronous NORMAL**: Durable across application crashes
/// - **Busy timeout**: 30 seconds to ride out lock contention
/// - **Max connections**: 1 (the indexer is the only writer)
///
/// The file is created if missing. Migrations are not run; see
/// [`run_migrations`].
///
/// # Errors
///
/// Returns [`IndexerError::DatabaseError`] if the file cannot be opened.
pub async fn create_pool(path: &Path) -> IndexerResult<SqlitePool> {
    info!(path = %path.display(), "Connecting to database");

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .map_err(|e| {
            IndexerError::database(
                format!("Failed to connect to database at {}", path.display()),
                Some(Box::new(e)),
            )
        })
}

/// Runs database migrations to ensure schema is up-to-date.
///
/// Applies all pending migrations from the `migrations/` directory, in
/// order. Safe to run on every open.
///
/// # Errors
///
/// Returns [`IndexerError::DatabaseError`] if a migration fails.
pub async fn run_migrations(pool: &SqlitePool) -> IndexerResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| {
            IndexerError::database("Failed to run database migrations", Some(Box::new(e)))
        })?;

    Ok(())
}

/// Verify that required tables exist after migrations.
///
/// # Errors
///
/// Returns [`IndexerError::DatabaseError`] if a table is missing.
pub async fn verify_database(pool: &SqlitePool) -> IndexerResult<()> {
    let rows = sqlx::query_as::<_, (String,)>(
        r"
        SELECT name FROM sqlite_master
        WHERE type = 'table' AND name IN ('checkpoint', 'pending_event')
        ",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| {
        IndexerError::database("Failed to verify database schema", Some(Box::new(e)))
    })?;

    if rows.len() < REQUIRED_TABLES.len() {
        return Err(IndexerError::database(
            format!(
                "Database schema incomplete. Expected {} tables, found {}",
                REQUIRED_TABLES.len(),
                rows.len()
            ),
            None,
        ));
    }

    Ok(())
}

/// An open, migrated SQLite database.
///
/// Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Opens (creating if needed) and migrates the database at `path`.
    ///
    /// Missing parent directories are created.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the directory, the file,
    /// or the schema cannot be set up.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> IndexerResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                IndexerError::database(
                    format!("Failed to create directory {}", parent.display()),
                    Some(Box::new(e)),
                )
            })?;
        }

        let pool = create_pool(path).await?;

        info!("Running database migrations");
        run_migrations(&pool).await?;
        verify_database(&pool).await?;
        info!("Database migrations complete");

        Ok(Self { pool })
    }

    /// Closes every connection.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Database closed");
    }

    /// Returns `true` once [`SqliteDatabase::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Repository of `T` running directly on the pool.
    #[must_use]
    pub fn repository<T: Entity>(&self) -> SqliteRepository<T> {
        SqliteRepository::new(Executor::Pool(self.pool.clone()))
    }

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if `BEGIN` fails.
    pub async fn begin(&self) -> IndexerResult<SqliteTransaction> {
        let tx = self.pool.begin().await.map_err(|e| {
            IndexerError::database("Failed to begin transaction", Some(Box::new(e)))
        })?;
        Ok(SqliteTransaction {
            tx: Arc::new(Mutex::new(tx)),
        })
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A transaction whose repositories share one connection.
///
/// Dropping it without [`SqliteTransaction::commit`] rolls back.
pub struct SqliteTransaction {
    tx: Arc<Mutex<Transaction<'static, Sqlite>>>,
}

impl SqliteTransaction {
    /// Repository of `T` running inside this transaction.
    #[must_use]
    pub fn repository<T: Entity>(&self) -> SqliteRepository<T> {
        SqliteRepository::new(Executor::Transaction(Arc::clone(&self.tx)))
    }

    /// Commits the transaction.
    ///
    /// Repositories obtained from it must be dropped first.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if a repository is still
    /// alive or `COMMIT` fails.
    pub async fn commit(self) -> IndexerResult<()> {
        let tx = Arc::try_unwrap(self.tx).map_err(|_| {
            IndexerError::database("Transaction committed while still in use", None)
        })?;
        tx.into_inner().commit().await.map_err(|e| {
            IndexerError::database("Failed to commit transaction", Some(Box::new(e)))
        })
    }
}
