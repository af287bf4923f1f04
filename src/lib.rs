//! # Bloxer
//!
//! Resumable, crash-safe block-range indexing engine.
//!
//! An indexer follows a chain over a stateful WebSocket [`connection`],
//! computes contiguous block ranges as new blocks arrive and hands them to a
//! chain-specific [`Scanner`]. Events the scanner reports are published to
//! typed listeners through an [`events::EventBus`].
//!
//! ## Features
//!
//! - **Resumable**: a checkpoint survives restarts; scanning continues
//!   where it stopped
//! - **At-least-once delivery**: published events stay queued until
//!   acknowledged and are republished after a crash
//! - **No duplicates on resume**: events up to the last recorded one are
//!   skipped when a range is scanned again
//! - **Self-healing connections**: bounded reconnection and request retries
//! - **Layered configuration**: engine, flavor and user layers deep-merged
//!   and validated up front
//!
//! ## Architecture
//!
//! 1. **Config Layer** ([`config`]) - Defaults, validation, environment
//! 2. **Connection Layer** ([`connection`]) - Contract of a chain binding
//! 3. **Events Layer** ([`events`]) - Typed event sets and the event bus
//! 4. **Persistence Layer** ([`db`]) - Checkpoint and pending-event store
//! 5. **Engine** ([`indexer`]) - Run loop, recovery and notification
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bloxer::{Indexer, IndexerContext, IndexerResult, ScanRange, Scanner};
//! use serde_json::json;
//!
//! struct TransferScanner;
//!
//! #[async_trait::async_trait]
//! impl Scanner<MyChain> for TransferScanner {
//!     async fn scan(&self, ctx: &IndexerContext<MyChain>, range: ScanRange) -> IndexerResult<u64> {
//!         for (event, hash, index, block) in fetch_logs(ctx, range).await? {
//!             ctx.notify_event(event, &hash, index, block).await?;
//!         }
//!         Ok(range.ending_block + 1)
//!     }
//! }
//!
//! let indexer = Indexer::<MyChain, _>::new(json!({ "wsUrl": "wss://node.example" }), TransferScanner)?;
//! let ctx = indexer.context();
//! indexer.on(MyEventKind::Transfer, move |event, info| {
//!     let (ctx, info) = (ctx.clone(), info.clone());
//!     println!("{event:?}");
//!     tokio::spawn(async move { ctx.acknowledge(&info).await });
//! });
//! indexer.run().await?;
//! ```
//!
//! See the `tests/` directory for a complete flavor built on a mock
//! connection.
//!
//! ## Error Handling
//!
//! All operations return [`error::IndexerResult<T>`](error::IndexerResult):
//!
//! ```rust
//! use bloxer::error::{IndexerError, IndexerResult};
//!
//! fn example() -> IndexerResult<()> {
//!     Err(IndexerError::config("wsUrl is required", None))
//! }
//!
//! assert!(example().unwrap_err().is_config());
//! ```
//!
//! ## Logging
//!
//! Logging goes through `tracing`; install a subscriber with
//! [`observability::init_tracing`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod events;
pub mod indexer;
pub mod observability;
pub mod retry;

pub use config::{BlockTag, IndexerConfig, LoggerConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionSignals, ConnectionState};
pub use error::{IndexerError, IndexerResult};
pub use events::{EventBus, EventInfo, EventSet};
pub use indexer::{Flavor, Indexer, IndexerContext, ScanRange, Scanner};
