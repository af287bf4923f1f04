//! Records persisted by the indexer.
//!
//! - [`Checkpoint`]: the single resume position (`checkpoint` table)
//! - [`PendingEvent`]: a delivered but unacknowledged notification
//!   (`pending_event` table)

use super::repository::{Entity, Fields, Row, SqlValue};
use crate::error::IndexerResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Primary key of the only checkpoint row.
pub const CHECKPOINT_ID: i64 = 1;

/// Resume position of an indexer.
///
/// Without `event`, `block` is the next block to scan. With `event`,
/// `(block, event, hash, index)` names the last event durably recorded:
/// scanning resumes at `block` and skips everything up to and including
/// that event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Block to resume from.
    pub block: u64,
    /// Name of the last recorded event.
    pub event: Option<String>,
    /// Hash of the last recorded event.
    pub hash: Option<String>,
    /// Index of the last recorded event within `hash`.
    pub index: Option<u32>,
}

impl Checkpoint {
    /// A pure block cursor: `block` is the next block to scan.
    #[must_use]
    pub const fn at_block(block: u64) -> Self {
        Self {
            block,
            event: None,
            hash: None,
            index: None,
        }
    }

    /// Position of a recorded event.
    #[must_use]
    pub fn at_event(block: u64, event: impl Into<String>, hash: impl Into<String>, index: u32) -> Self {
        Self {
            block,
            event: Some(event.into()),
            hash: Some(hash.into()),
            index: Some(index),
        }
    }

    /// Returns `true` if the checkpoint names an event.
    #[must_use]
    pub const fn has_event(&self) -> bool {
        self.event.is_some()
    }

    /// Returns `true` if this checkpoint names `(event, hash, index)`.
    ///
    /// A missing index compares as `0`.
    #[must_use]
    pub fn is_event(&self, event: &str, hash: &str, index: u32) -> bool {
        self.event.as_deref() == Some(event)
            && self.hash.as_deref() == Some(hash)
            && self.index.unwrap_or(0) == index
    }
}

impl Entity for Checkpoint {
    const TABLE: &'static str = "checkpoint";
    const COLUMNS: &'static [&'static str] = &["id", "block", "event", "hash", "idx", "updated_at"];

    fn to_fields(&self) -> IndexerResult<Fields> {
        Ok(Fields::new()
            .set("id", CHECKPOINT_ID)
            .set("block", SqlValue::try_from(self.block)?)
            .set("event", self.event.clone())
            .set("hash", self.hash.clone())
            .set("idx", self.index)
            .set("updated_at", chrono::Utc::now().timestamp()))
    }

    fn from_row(row: &Row) -> IndexerResult<Self> {
        Ok(Self {
            block: row.u64("block")?,
            event: row.opt_text("event")?,
            hash: row.opt_text("hash")?,
            index: row.opt_u32("idx")?,
        })
    }
}

/// A notification recorded but not yet acknowledged.
///
/// `data` holds the serialized event value. Identity is
/// `(event, hash, index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Event name.
    pub event: String,
    /// Hash the event was found in.
    pub hash: String,
    /// Position within `hash`.
    pub index: u32,
    /// Block the event was found in.
    pub block: u64,
    /// Serialized event.
    pub data: Value,
}

impl PendingEvent {
    /// Fields identifying this event.
    #[must_use]
    pub fn identity(&self) -> Fields {
        identity(&self.event, &self.hash, self.index)
    }
}

/// Fields identifying a pending event.
#[must_use]
pub fn identity(event: &str, hash: &str, index: u32) -> Fields {
    Fields::new()
        .set("event", event)
        .set("hash", hash)
        .set("idx", index)
}

impl Entity for PendingEvent {
    const TABLE: &'static str = "pending_event";
    const COLUMNS: &'static [&'static str] =
        &["id", "event", "hash", "idx", "block", "data", "created_at"];
    const JSON_COLUMNS: &'static [&'static str] = &["data"];

    fn to_fields(&self) -> IndexerResult<Fields> {
        Ok(Fields::new()
            .set("event", self.event.as_str())
            .set("hash", self.hash.as_str())
            .set("idx", self.index)
            .set("block", SqlValue::try_from(self.block)?)
            .set("data", self.data.clone())
            .set("created_at", chrono::Utc::now().timestamp()))
    }

    fn from_row(row: &Row) -> IndexerResult<Self> {
        Ok(Self {
            event: row.text("event")?,
            hash: row.text("hash")?,
            index: row.u32("idx")?,
            block: row.u64("block")?,
            data: row.json("data")?,
        })
    }
}
