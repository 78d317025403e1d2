//! SessionUpdateDispatcher - fans typed events out to registered subscribers.
//!
//! Subscribers are plain synchronous callbacks. Delivery happens in
//! registration order and one event is fully delivered before the next one
//! starts, even when events are published from several tasks. A subscriber
//! that panics is isolated: the panic is logged and the remaining
//! subscribers still receive the event.
//!
//! Callbacks must not publish into the same registry re-entrantly.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::api::types::{ApiError, SessionId, SessionUpdate, SessionUpdateEvent};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by `subscribe`.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
/// The callback is also released when the registry itself goes away.
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Detach>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the callback. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<T>)>>,
    /// Held for the whole fan-out of one event
    delivery: Mutex<()>,
}

impl<T: 'static> Detach for Registry<T> {
    fn detach(&self, id: u64) {
        lock(&self.entries).retain(|(entry_id, _)| *entry_id != id);
    }
}

/// An ordered list of callbacks for one event type.
pub struct Subscribers<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T: 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
                delivery: Mutex::new(()),
            }),
        }
    }

    /// Register a callback; it runs after every previously registered one.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.entries).push((id, Arc::new(callback)));

        let registry: Arc<dyn Detach> = self.registry.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Deliver `event` to every subscriber in registration order.
    ///
    /// Returns the number of subscribers that handled it without panicking.
    pub fn emit(&self, event: &T) -> usize {
        let _delivery = lock(&self.registry.delivery);
        let snapshot: Vec<(u64, Callback<T>)> = lock(&self.registry.entries).clone();

        let mut delivered = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    log::error!(
                        "Subscriber panicked, continuing: subscription={id}, reason={reason}"
                    );
                }
            }
        }
        delivered
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.registry.entries).len()
    }
}

/// Fan-out point for session updates and connection errors.
///
/// Cheap to clone; clones share the same subscriber lists.
#[derive(Clone, Default)]
pub struct SessionUpdateDispatcher {
    updates: Subscribers<SessionUpdateEvent>,
    errors: Subscribers<ApiError>,
}

impl SessionUpdateDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionUpdateEvent) + Send + Sync + 'static,
    {
        self.updates.subscribe(callback)
    }

    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ApiError) + Send + Sync + 'static,
    {
        self.errors.subscribe(callback)
    }

    /// Publish one update to every update subscriber.
    pub fn publish(&self, session_id: Option<SessionId>, update: SessionUpdate) {
        let event = SessionUpdateEvent { session_id, update };
        let delivered = self.updates.emit(&event);
        log::trace!("Dispatched session update: delivered={delivered}");
    }

    /// Report an error to every error subscriber.
    pub fn report_error(&self, error: &ApiError) {
        log::error!("Agent connection error: {error}");
        self.errors.emit(error);
    }

    pub fn update_subscriber_count(&self) -> usize {
        self.updates.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
