use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::lock;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<T>>,
}

/// Ordered set of callbacks with synchronous fan-out.
///
/// Handlers run in subscription order. The handler list is snapshotted before
/// delivery, so a handler may subscribe, unsubscribe, or trigger another
/// notification without deadlocking.
pub struct Listeners<T> {
    registry: Mutex<Registry<T>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                handlers: BTreeMap::new(),
            }),
        })
    }

    /// Register a handler. It stays registered until the returned
    /// `Subscription` is dropped or unsubscribed.
    pub fn add<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.insert(id, Arc::new(handler));
            id
        };

        let weak = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                lock(&listeners.registry).handlers.remove(&id);
            }
        })
    }

    /// Deliver `value` to every current handler. Returns how many ran.
    pub fn notify(&self, value: &T) -> usize {
        let handlers: Vec<Handler<T>> = lock(&self.registry).handlers.values().cloned().collect();
        for handler in &handlers {
            handler(value);
        }
        handlers.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a registered callback. Dropping it removes the callback.
#[must_use = "dropping a Subscription immediately unsubscribes its handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the handler now.
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_runs_handlers_in_subscription_order() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = Arc::clone(&seen);
            listeners.add(move |v| lock(&seen).push(("first", *v)))
        };
        let second = {
            let seen = Arc::clone(&seen);
            listeners.add(move |v| lock(&seen).push(("second", *v)))
        };

        assert_eq!(listeners.notify(&7), 2);
        assert_eq!(*lock(&seen), vec![("first", 7), ("second", 7)]);

        drop(first);
        drop(second);
    }

    #[test]
    fn test_dropping_subscription_removes_handler() {
        let listeners = Listeners::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let sub = {
            let count = Arc::clone(&count);
            listeners.add(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        listeners.notify(&());
        drop(sub);
        listeners.notify(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let listeners = Listeners::<()>::new();
        let sub = listeners.add(|_| {});
        assert_eq!(listeners.len(), 1);
        sub.unsubscribe();
        assert_eq!(listeners.len(), 0);
    }

    #[test]
    fn test_handler_can_reenter_registry() {
        let listeners = Listeners::<u32>::new();
        let inner = Arc::clone(&listeners);
        let nested = Arc::new(Mutex::new(Vec::new()));

        let sub = {
            let nested = Arc::clone(&nested);
            listeners.add(move |_| {
                // Subscribing from inside a handler must not deadlock
                let extra = inner.add(|_| {});
                lock(&nested).push(extra);
            })
        };

        listeners.notify(&1);
        assert_eq!(listeners.len(), 2);

        lock(&nested).clear();
        drop(sub);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_subscription_outliving_listeners_is_harmless() {
        let listeners = Listeners::<()>::new();
        let sub = listeners.add(|_| {});
        drop(listeners);
        drop(sub);
    }
}
