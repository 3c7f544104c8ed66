//! Multi-subscriber notification registry.
//!
//! Handlers dipanggil berurutan pada thread yang memicu event
//! (completion driver, accept loop, atau worker).

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// One notification kind. Any number of handlers may subscribe; every
/// emission is delivered to all of them, fire-and-forget.
pub struct Event<T> {
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler. Handlers run in registration order.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Deliver `value` to every current subscriber.
    ///
    /// The handler list is snapshotted first, so a handler may subscribe
    /// further handlers without deadlocking; those see the next emission.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = self.handlers.read().clone();
        for handler in snapshot {
            handler(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscriber_count() == 0
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_every_subscriber() {
        let event: Event<usize> = Event::new();
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = Arc::clone(&total);
            event.subscribe(move |n| {
                total.fetch_add(*n, Ordering::SeqCst);
            });
        }

        event.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 15);
        assert_eq!(event.subscriber_count(), 3);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let event: Event<String> = Event::default();
        assert!(event.is_empty());
        event.emit(&"ignored".to_string());
    }

    #[test]
    fn test_subscribe_from_handler() {
        let event: Arc<Event<()>> = Arc::new(Event::new());
        let inner = Arc::clone(&event);
        event.subscribe(move |_| inner.subscribe(|_| {}));

        event.emit(&());
        assert_eq!(event.subscriber_count(), 2);
    }
}
