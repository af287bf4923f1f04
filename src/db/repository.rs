//! Storage-agnostic repository abstraction.
//!
//! Entities describe themselves as a table, a column list and conversions
//! to and from [`Fields`]/[`Row`]. A [`Repository`] offers parameterized CRUD
//! plus `update_or_create` over one entity type, filtered by a [`Where`]
//! clause:
//!
//! - [`Where::All`] matches every row
//! - [`Where::Any`] holds AND-groups of equalities, OR'ed together
//!
//! ```
//! use bloxer::db::repository::{Fields, Where};
//!
//! // (a = 1 AND b = 2) OR (a = 3)
//! let filter = Where::any([
//!     Fields::new().set("a", 1).set("b", 2),
//!     Fields::new().set("a", 3),
//! ]);
//! assert_eq!(filter.groups().len(), 2);
//! ```

use crate::error::{IndexerError, IndexerResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// A value bound to, or read from, a query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// Absent value.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Floating point number.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
    /// Structured value, encoded by the adapter before it is bound.
    Json(Value),
}

impl SqlValue {
    /// Returns `true` for [`SqlValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

/// SQLite integers are signed 64-bit; larger values are rejected rather
/// than clamped.
impl TryFrom<u64> for SqlValue {
    type Error = IndexerError;

    fn try_from(value: u64) -> IndexerResult<Self> {
        i64::try_from(value).map(Self::Integer).map_err(|e| {
            IndexerError::database(
                format!("Value {value} does not fit in an INTEGER column"),
                Some(Box::new(e)),
            )
        })
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        if value.is_null() {
            Self::Null
        } else {
            Self::Json(value)
        }
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Ordered column/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(Vec<(String, SqlValue)>);

impl Fields {
    /// Creates an empty field list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Sets `column`, replacing a previous value for it.
    #[must_use]
    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    /// Sets `column` in place.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        let column = column.into();
        let value = value.into();
        match self.0.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.0.push((column, value)),
        }
    }

    /// Value of `column`, if set.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.0.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no column is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over column/value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl IntoIterator for Fields {
    type Item = (String, SqlValue);
    type IntoIter = std::vec::IntoIter<(String, SqlValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Row filter: OR of AND-groups of equalities.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Where {
    /// Matches every row.
    #[default]
    All,
    /// Matches rows satisfying at least one group.
    Any(Vec<Fields>),
}

impl Where {
    /// Matches every row.
    #[must_use]
    pub const fn all() -> Self {
        Self::All
    }

    /// Matches rows where every field is equal.
    #[must_use]
    pub fn matching(fields: Fields) -> Self {
        Self::Any(vec![fields])
    }

    /// Matches rows satisfying any of `groups`.
    #[must_use]
    pub fn any(groups: impl IntoIterator<Item = Fields>) -> Self {
        Self::Any(groups.into_iter().collect())
    }

    /// AND-groups of this filter; empty for [`Where::All`].
    #[must_use]
    pub fn groups(&self) -> &[Fields] {
        match self {
            Self::All => &[],
            Self::Any(groups) => groups,
        }
    }

    /// Returns `true` when no row is excluded.
    #[must_use]
    pub fn matches_all(&self) -> bool {
        self.groups().is_empty()
    }
}

impl From<Fields> for Where {
    fn from(fields: Fields) -> Self {
        Self::matching(fields)
    }
}

/// A decoded row, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(HashMap<String, SqlValue>);

impl Row {
    /// Creates a row from decoded columns.
    #[must_use]
    pub fn new(columns: HashMap<String, SqlValue>) -> Self {
        Self(columns)
    }

    /// Raw value of `column`; missing columns read as null.
    #[must_use]
    pub fn value(&self, column: &str) -> &SqlValue {
        self.0.get(column).unwrap_or(&SqlValue::Null)
    }

    /// Integer value of `column`, `None` when null.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] on a type mismatch.
    pub fn opt_i64(&self, column: &str) -> IndexerResult<Option<i64>> {
        match self.value(column) {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(value) => Ok(Some(*value)),
            other => Err(mismatch(column, "integer", other)),
        }
    }

    /// Non-negative integer value of `column`, `None` when null.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] on a type mismatch or a
    /// negative value.
    pub fn opt_u64(&self, column: &str) -> IndexerResult<Option<u64>> {
        self.opt_i64(column)?
            .map(|value| {
                u64::try_from(value).map_err(|e| {
                    IndexerError::database(
                        format!("Column {column} holds negative value {value}"),
                        Some(Box::new(e)),
                    )
                })
            })
            .transpose()
    }

    /// Non-negative integer value of `column`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the column is null, of
    /// another type, or negative.
    pub fn u64(&self, column: &str) -> IndexerResult<u64> {
        self.opt_u64(column)?
            .ok_or_else(|| IndexerError::database(format!("Column {column} is null"), None))
    }

    /// Integer value of `column` that must fit in a `u32`, `None` when null.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] on a type mismatch or a value
    /// outside `u32`.
    pub fn opt_u32(&self, column: &str) -> IndexerResult<Option<u32>> {
        self.opt_u64(column)?
            .map(|value| {
                u32::try_from(value).map_err(|e| {
                    IndexerError::database(
                        format!("Column {column} holds {value}, out of range for u32"),
                        Some(Box::new(e)),
                    )
                })
            })
            .transpose()
    }

    /// Integer value of `column` that must fit in a `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the column is null, of
    /// another type, or out of range.
    pub fn u32(&self, column: &str) -> IndexerResult<u32> {
        self.opt_u32(column)?
            .ok_or_else(|| IndexerError::database(format!("Column {column} is null"), None))
    }

    /// Text value of `column`, `None` when null.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] on a type mismatch.
    pub fn opt_text(&self, column: &str) -> IndexerResult<Option<String>> {
        match self.value(column) {
            SqlValue::Null => Ok(None),
            SqlValue::Text(value) => Ok(Some(value.clone())),
            other => Err(mismatch(column, "text", other)),
        }
    }

    /// Text value of `column`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the column is null or of
    /// another type.
    pub fn text(&self, column: &str) -> IndexerResult<String> {
        self.opt_text(column)?
            .ok_or_else(|| IndexerError::database(format!("Column {column} is null"), None))
    }

    /// Structured value of `column`; null reads as JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if the column holds bytes
    /// that are not JSON.
    pub fn json(&self, column: &str) -> IndexerResult<Value> {
        match self.value(column) {
            SqlValue::Null => Ok(Value::Null),
            SqlValue::Json(value) => Ok(value.clone()),
            SqlValue::Integer(value) => Ok(Value::from(*value)),
            SqlValue::Real(value) => Ok(Value::from(*value)),
            SqlValue::Text(value) => Ok(Value::from(value.as_str())),
            other @ SqlValue::Blob(_) => Err(mismatch(column, "json", other)),
        }
    }
}

fn mismatch(column: &str, expected: &str, found: &SqlValue) -> IndexerError {
    IndexerError::database(
        format!("Column {column} expected {expected}, found {found:?}"),
        None,
    )
}

/// A record stored in one table.
pub trait Entity: Sized + Send + Sync + 'static {
    /// Table name.
    const TABLE: &'static str;
    /// Every column of the table, in declaration order.
    const COLUMNS: &'static [&'static str];
    /// Columns holding structured values. Only these are decoded as JSON
    /// when read back; other byte columns stay raw.
    const JSON_COLUMNS: &'static [&'static str] = &[];

    /// Columns written when the entity is saved.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if a value cannot be stored
    /// without loss.
    fn to_fields(&self) -> IndexerResult<Fields>;

    /// Rebuilds the entity from a decoded row.
    ///
    /// # Errors
    ///
    /// Returns an error if a column is missing or of the wrong type.
    fn from_row(row: &Row) -> IndexerResult<Self>;
}

/// Parameterized CRUD over one entity type.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// First matching row in storage order.
    async fn find_one(&self, filter: Where) -> IndexerResult<Option<T>>;

    /// Every matching row in storage order.
    async fn find_all(&self, filter: Where) -> IndexerResult<Vec<T>>;

    /// Inserts `entity`.
    async fn create(&self, entity: &T) -> IndexerResult<()>;

    /// Sets `data` on every matching row, returning the affected count.
    async fn update(&self, data: Fields, filter: Where) -> IndexerResult<u64>;

    /// Deletes every matching row, returning the affected count.
    async fn delete(&self, filter: Where) -> IndexerResult<u64>;

    /// Updates the matching rows with `entity` or inserts it when none match.
    async fn update_or_create(&self, filter: Where, entity: &T) -> IndexerResult<()> {
        if self.find_one(filter.clone()).await?.is_some() {
            self.update(entity.to_fields()?, filter).await?;
        } else {
            self.create(entity).await?;
        }
        Ok(())
    }
}
