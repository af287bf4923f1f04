//! SQLite implementation of [`Repository`].
//!
//! A repository runs either directly on the pool or inside a transaction
//! obtained from [`SqliteDatabase::begin`](super::SqliteDatabase::begin).
//! Statements come from [`SqliteAdapter`]; rows are decoded column by column
//! from their runtime storage class so the same code serves every entity.

use super::adapter::{SqlAdapter, SqliteAdapter, Statement};
use super::repository::{Entity, Fields, Repository, Row, SqlValue, Where};
use crate::error::{IndexerError, IndexerResult};
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Database, Row as _, Sqlite, SqlitePool, Transaction, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

type SqliteQuery<'q> = Query<'q, Sqlite, <Sqlite as Database>::Arguments<'q>>;

/// Where statements run.
#[derive(Clone)]
pub(crate) enum Executor {
    Pool(SqlitePool),
    Transaction(Arc<Mutex<Transaction<'static, Sqlite>>>),
}

impl Executor {
    async fn fetch_all(&self, stmt: Statement) -> Result<Vec<SqliteRow>, sqlx::Error> {
        let query = bind_all(sqlx::query(&stmt.sql), stmt.params);
        match self {
            Self::Pool(pool) => query.fetch_all(pool).await,
            Self::Transaction(tx) => {
                let mut tx = tx.lock().await;
                query.fetch_all(&mut **tx).await
            }
        }
    }

    async fn execute(&self, stmt: Statement) -> Result<u64, sqlx::Error> {
        let query = bind_all(sqlx::query(&stmt.sql), stmt.params);
        let result = match self {
            Self::Pool(pool) => query.execute(pool).await?,
            Self::Transaction(tx) => {
                let mut tx = tx.lock().await;
                query.execute(&mut **tx).await?
            }
        };
        Ok(result.rows_affected())
    }
}

fn bind_all(query: SqliteQuery<'_>, params: Vec<SqlValue>) -> SqliteQuery<'_> {
    params.into_iter().fold(query, |query, value| match value {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Integer(v) => query.bind(v),
        SqlValue::Real(v) => query.bind(v),
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Blob(v) => query.bind(v),
        SqlValue::Json(v) => query.bind(v.to_string()),
    })
}

fn decode_row<T: Entity>(row: &SqliteRow, adapter: &SqliteAdapter) -> Result<Row, sqlx::Error> {
    let mut columns = HashMap::with_capacity(row.columns().len());
    for column in row.columns() {
        let i = column.ordinal();
        let storage = {
            let raw = row.try_get_raw(i)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };
        let value = match storage.as_deref() {
            None => SqlValue::Null,
            Some("INTEGER") => SqlValue::Integer(row.try_get(i)?),
            Some("REAL") => SqlValue::Real(row.try_get(i)?),
            Some("BLOB") => SqlValue::Blob(row.try_get(i)?),
            Some(_) => SqlValue::Text(row.try_get(i)?),
        };
        let structured = T::JSON_COLUMNS.contains(&column.name());
        columns.insert(column.name().to_string(), adapter.decode(value, structured));
    }
    Ok(Row::new(columns))
}

/// [`Repository`] of `T` backed by SQLite.
pub struct SqliteRepository<T> {
    executor: Executor,
    adapter: SqliteAdapter,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> SqliteRepository<T> {
    pub(crate) const fn new(executor: Executor) -> Self {
        Self {
            executor,
            adapter: SqliteAdapter,
            _entity: PhantomData,
        }
    }

    async fn query(&self, stmt: Statement) -> IndexerResult<Vec<T>> {
        let rows = self.executor.fetch_all(stmt).await.map_err(|e| {
            IndexerError::database(format!("Failed to query {}", T::TABLE), Some(Box::new(e)))
        })?;

        rows.iter()
            .map(|row| {
                let decoded = decode_row::<T>(row, &self.adapter).map_err(|e| {
                    IndexerError::database(
                        format!("Failed to decode row of {}", T::TABLE),
                        Some(Box::new(e)),
                    )
                })?;
                T::from_row(&decoded)
            })
            .collect()
    }

    async fn execute(&self, stmt: Statement, action: &str) -> IndexerResult<u64> {
        self.executor.execute(stmt).await.map_err(|e| {
            IndexerError::database(
                format!("Failed to {action} {}", T::TABLE),
                Some(Box::new(e)),
            )
        })
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for SqliteRepository<T> {
    async fn find_one(&self, filter: Where) -> IndexerResult<Option<T>> {
        let stmt = self.adapter.build_select::<T>(&filter, Some(1))?;
        Ok(self.query(stmt).await?.into_iter().next())
    }

    async fn find_all(&self, filter: Where) -> IndexerResult<Vec<T>> {
        let stmt = self.adapter.build_select::<T>(&filter, None)?;
        self.query(stmt).await
    }

    #[instrument(level = "debug", skip_all, fields(table = T::TABLE))]
    async fn create(&self, entity: &T) -> IndexerResult<()> {
        let stmt = self.adapter.build_insert::<T>(entity.to_fields()?)?;
        self.execute(stmt, "insert into").await?;
        debug!("Row inserted");
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(table = T::TABLE, affected = tracing::field::Empty))]
    async fn update(&self, data: Fields, filter: Where) -> IndexerResult<u64> {
        let stmt = self.adapter.build_update::<T>(data, &filter)?;
        let affected = self.execute(stmt, "update").await?;
        tracing::Span::current().record("affected", affected);
        Ok(affected)
    }

    #[instrument(level = "debug", skip_all, fields(table = T::TABLE, affected = tracing::field::Empty))]
    async fn delete(&self, filter: Where) -> IndexerResult<u64> {
        let stmt = self.adapter.build_delete::<T>(&filter)?;
        let affected = self.execute(stmt, "delete from").await?;
        tracing::Span::current().record("affected", affected);
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Checkpoint, PendingEvent};
    use crate::db::SqliteDatabase;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, SqliteDatabase) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = SqliteDatabase::open(&dir.path().join("repo.db"))
            .await
            .expect("Failed to open database");
        (dir, db)
    }

    fn pending(event: &str, hash: &str, index: u32, block: u64) -> PendingEvent {
        PendingEvent {
            event: event.to_string(),
            hash: hash.to_string(),
            index,
            block,
            data: json!({ "Transfer": ["alice", "bob", block] }),
        }
    }

    #[tokio::test]
    async fn test_create_and_find_all_in_storage_order() {
        let (_dir, db) = setup_test_db().await;
        let repo = db.repository::<PendingEvent>();

        repo.create(&pending("Transfer", "0x2", 0, 20)).await.expect("insert");
        repo.create(&pending("Transfer", "0x1", 0, 10)).await.expect("insert");

        let all = repo.find_all(Where::all()).await.expect("query");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].hash, "0x2");
        assert_eq!(all[1].hash, "0x1");
        assert_eq!(all[1].data, json!({ "Transfer": ["alice", "bob", 10] }));
    }

    #[tokio::test]
    async fn test_where_or_of_and_groups() {
        let (_dir, db) = setup_test_db().await;
        let repo = db.repository::<PendingEvent>();
        repo.create(&pending("A", "h1", 0, 1)).await.unwrap();
        repo.create(&pending("A", "h2", 0, 2)).await.unwrap();
        repo.create(&pending("B", "h3", 0, 3)).await.unwrap();

        // (event = A AND block = 1) OR (event = B)
        let filter = Where::any([
            Fields::new().set("event", "A").set("block", 1_i64),
            Fields::new().set("event", "B"),
        ]);
        let found = repo.find_all(filter).await.unwrap();
        let hashes: Vec<_> = found.iter().map(|p| p.hash.as_str()).collect();
        assert_eq!(hashes, vec!["h1", "h3"]);

        assert_eq!(repo.find_all(Where::all()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_and_delete_report_affected_rows() {
        let (_dir, db) = setup_test_db().await;
        let repo = db.repository::<PendingEvent>();
        repo.create(&pending("A", "h1", 0, 1)).await.unwrap();
        repo.create(&pending("A", "h2", 0, 1)).await.unwrap();

        let updated = repo
            .update(
                Fields::new().set("block", 5_i64),
                Where::matching(Fields::new().set("event", "A")),
            )
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let deleted = repo
            .delete(Where::matching(Fields::new().set("hash", "h1")))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.delete(Where::matching(Fields::new().set("hash", "h1"))).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_or_create_is_idempotent() {
        let (_dir, db) = setup_test_db().await;
        let repo = db.repository::<Checkpoint>();

        repo.update_or_create(Where::all(), &Checkpoint::at_block(10)).await.unwrap();
        repo.update_or_create(Where::all(), &Checkpoint::at_event(12, "A", "h", 1))
            .await
            .unwrap();

        let all = repo.find_all(Where::all()).await.unwrap();
        assert_eq!(all, vec![Checkpoint::at_event(12, "A", "h", 1)]);
    }

    #[tokio::test]
    async fn test_null_columns_read_as_none() {
        let (_dir, db) = setup_test_db().await;
        let repo = db.repository::<Checkpoint>();
        repo.create(&Checkpoint::at_block(3)).await.unwrap();

        let found = repo
            .find_one(Where::matching(Fields::new().set("event", None::<String>)))
            .await
            .unwrap()
            .expect("row should match IS NULL");
        assert_eq!(found, Checkpoint::at_block(3));
    }

    #[tokio::test]
    async fn test_transaction_rollback_on_drop() {
        let (_dir, db) = setup_test_db().await;

        {
            let tx = db.begin().await.unwrap();
            tx.repository::<PendingEvent>()
                .create(&pending("A", "h1", 0, 1))
                .await
                .unwrap();
            // dropped without commit
        }

        let all = db.repository::<PendingEvent>().find_all(Where::all()).await.unwrap();
        assert!(all.is_empty());
    }
}
