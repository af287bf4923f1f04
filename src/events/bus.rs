//! Publish/subscribe bus keyed by event kind.

use super::{EventInfo, EventSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// A listener invoked with the event and its identity.
pub type Listener<E> = Arc<dyn Fn(&E, &EventInfo) + Send + Sync>;

struct Entry<E> {
    id: u64,
    once: bool,
    listener: Listener<E>,
}

struct Inner<E: EventSet> {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<E::Kind, Vec<Entry<E>>>>,
}

impl<E: EventSet> Inner<E> {
    fn lock(&self) -> MutexGuard<'_, HashMap<E::Kind, Vec<Entry<E>>>> {
        // Listeners run outside the lock, so poisoning cannot leave the map half-updated.
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, kind: E::Kind, id: u64) -> bool {
        let mut listeners = self.lock();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }
}

/// In-process event bus with durable and single-shot listeners.
///
/// Cloning the bus yields another handle to the same listener table.
pub struct EventBus<E: EventSet> {
    inner: Arc<Inner<E>>,
}

impl<E: EventSet> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: EventSet> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventSet> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.inner.lock();
        let counts: HashMap<_, _> = listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

impl<E: EventSet> EventBus<E> {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a listener for every future event of `kind`.
    pub fn on<F>(&self, kind: E::Kind, listener: F) -> Subscription<E>
    where
        F: Fn(&E, &EventInfo) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(listener))
    }

    /// Registers a listener that is removed before its first invocation.
    pub fn once<F>(&self, kind: E::Kind, listener: F) -> Subscription<E>
    where
        F: Fn(&E, &EventInfo) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(listener))
    }

    fn register(&self, kind: E::Kind, once: bool, listener: Listener<E>) -> Subscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .entry(kind)
            .or_default()
            .push(Entry { id, once, listener });

        Subscription {
            kind,
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Invokes every listener registered for the event's kind.
    ///
    /// Listeners run in registration order, outside the bus lock, so a
    /// listener may subscribe or unsubscribe. Returns `true` if at least
    /// one listener was invoked.
    pub fn emit(&self, event: &E, info: &EventInfo) -> bool {
        let kind = event.kind();
        let listeners: Vec<Listener<E>> = {
            let mut table = self.inner.lock();
            let Some(entries) = table.get_mut(&kind) else {
                return false;
            };
            let listeners = entries.iter().map(|e| Arc::clone(&e.listener)).collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                table.remove(&kind);
            }
            listeners
        };

        for listener in &listeners {
            listener(event, info);
        }
        !listeners.is_empty()
    }

    /// Number of listeners currently registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.inner.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Removes every listener registered for `kind`.
    pub fn off_all(&self, kind: E::Kind) {
        self.inner.lock().remove(&kind);
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Handle returned by [`EventBus::on`] and [`EventBus::once`].
///
/// Dropping the handle keeps the listener registered.
pub struct Subscription<E: EventSet> {
    kind: E::Kind,
    id: u64,
    bus: Weak<Inner<E>>,
}

impl<E: EventSet> Subscription<E> {
    /// Kind the listener is registered for.
    #[must_use]
    pub const fn kind(&self) -> E::Kind {
        self.kind
    }

    /// Removes the listener.
    ///
    /// Returns `false` if it was already gone (a fired `once` listener,
    /// `off_all`, or a dropped bus).
    pub fn unsubscribe(self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|inner| inner.remove(self.kind, self.id))
    }
}

impl<E: EventSet> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum Token {
        Transfer(String, String, u64),
        Approval(String),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TokenKind {
        Transfer,
        Approval,
    }

    impl EventSet for Token {
        type Kind = TokenKind;

        fn kind(&self) -> TokenKind {
            match self {
                Self::Transfer(..) => TokenKind::Transfer,
                Self::Approval(_) => TokenKind::Approval,
            }
        }

        fn name(kind: TokenKind) -> &'static str {
            match kind {
                TokenKind::Transfer => "Transfer",
                TokenKind::Approval => "Approval",
            }
        }
    }

    fn transfer() -> Token {
        Token::Transfer("alice".into(), "bob".into(), 10)
    }

    fn info() -> EventInfo {
        EventInfo::new("Transfer", "0xabc", 0, 1)
    }

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::<Token>::new();
        assert!(!bus.emit(&transfer(), &info()));
    }

    #[test]
    fn test_on_receives_every_event() {
        let bus = EventBus::<Token>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = bus.on(TokenKind::Transfer, move |event, info| {
            assert!(matches!(event, Token::Transfer(..)));
            assert_eq!(info.hash, "0xabc");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.emit(&transfer(), &info()));
        assert!(bus.emit(&transfer(), &info()));
        assert!(!bus.emit(&Token::Approval("carol".into()), &info()));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let bus = EventBus::<Token>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = bus.once(TokenKind::Transfer, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.listener_count(TokenKind::Transfer), 1);
        assert!(bus.emit(&transfer(), &info()));
        assert!(!bus.emit(&transfer(), &info()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(TokenKind::Transfer), 0);
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn test_unsubscribe_removes_only_that_listener() {
        let bus = EventBus::<Token>::new();
        let first = bus.on(TokenKind::Transfer, |_, _| {});
        let _second = bus.on(TokenKind::Transfer, |_, _| {});
        assert_eq!(bus.listener_count(TokenKind::Transfer), 2);

        assert!(first.unsubscribe());
        assert_eq!(bus.listener_count(TokenKind::Transfer), 1);
    }

    #[test]
    fn test_off_all_and_clear() {
        let bus = EventBus::<Token>::new();
        let _a = bus.on(TokenKind::Transfer, |_, _| {});
        let _b = bus.on(TokenKind::Approval, |_, _| {});

        bus.off_all(TokenKind::Transfer);
        assert_eq!(bus.listener_count(TokenKind::Transfer), 0);
        assert_eq!(bus.listener_count(TokenKind::Approval), 1);

        bus.clear();
        assert_eq!(bus.listener_count(TokenKind::Approval), 0);
    }

    #[test]
    fn test_listener_may_subscribe_during_emit() {
        let bus = EventBus::<Token>::new();
        let handle = bus.clone();
        let _sub = bus.once(TokenKind::Transfer, move |_, _| {
            let _ = handle.on(TokenKind::Approval, |_, _| {});
        });

        assert!(bus.emit(&transfer(), &info()));
        assert_eq!(bus.listener_count(TokenKind::Approval), 1);
    }

    #[test]
    fn test_event_name() {
        assert_eq!(transfer().event_name(), "Transfer");
        assert_eq!(Token::name(TokenKind::Approval), "Approval");
    }
}
