//! Typed events and the in-process event bus.
//!
//! Each flavor declares its events as a closed sum type implementing
//! [`EventSet`]. The engine persists and republishes values of that type,
//! and listeners subscribe per [`EventSet::Kind`].
//!
//! # Example
//!
//! ```
//! use bloxer::events::{EventBus, EventInfo, EventSet};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! enum LedgerEvent {
//!     Payment { from: String, to: String, amount: u64 },
//!     Closed(u64),
//! }
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum LedgerKind {
//!     Payment,
//!     Closed,
//! }
//!
//! impl EventSet for LedgerEvent {
//!     type Kind = LedgerKind;
//!
//!     fn kind(&self) -> LedgerKind {
//!         match self {
//!             Self::Payment { .. } => LedgerKind::Payment,
//!             Self::Closed(_) => LedgerKind::Closed,
//!         }
//!     }
//!
//!     fn name(kind: LedgerKind) -> &'static str {
//!         match kind {
//!             LedgerKind::Payment => "Payment",
//!             LedgerKind::Closed => "Closed",
//!         }
//!     }
//! }
//!
//! let bus = EventBus::<LedgerEvent>::new();
//! let _sub = bus.on(LedgerKind::Closed, |event, info| {
//!     println!("{event:?} at block {}", info.block);
//! });
//! assert_eq!(bus.listener_count(LedgerKind::Closed), 1);
//! ```

mod bus;

pub use bus::{EventBus, Listener, Subscription};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// A closed set of events produced by a flavor.
///
/// The serialized form of an event is what gets stored in the pending
/// event queue, so it must round-trip through `serde_json`.
pub trait EventSet: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Discriminant used to subscribe to one kind of event.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Kind of this event.
    fn kind(&self) -> Self::Kind;

    /// Stable name of a kind, used as the persisted event name.
    fn name(kind: Self::Kind) -> &'static str;

    /// Stable name of this event.
    fn event_name(&self) -> &'static str {
        Self::name(self.kind())
    }
}

/// Identity of a delivered notification.
///
/// Listeners receive it next to the event so they can acknowledge it with
/// `event_done` once they have finished.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventInfo {
    /// Persisted event name.
    pub event: String,
    /// Transaction (or log) hash the event was found in.
    pub hash: String,
    /// Position of the event within `hash`.
    pub index: u32,
    /// Block the event was found in.
    pub block: u64,
}

impl EventInfo {
    /// Creates a new event identity.
    #[must_use]
    pub fn new(event: impl Into<String>, hash: impl Into<String>, index: u32, block: u64) -> Self {
        Self {
            event: event.into(),
            hash: hash.into(),
            index,
            block,
        }
    }
}
