//! Listener registries.
//!
//! A `Listeners` set is an append-safe multiset of callbacks. Dispatch
//! iterates over a snapshot, so user code never runs under the registry's
//! write lock and a callback may register or remove listeners freely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

struct ListenersInner<F: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Arc<F>)>>,
}

/// An append-safe multiset of callbacks with snapshot iteration.
pub struct Listeners<F: ?Sized> {
    inner: Arc<ListenersInner<F>>,
}

impl<F: ?Sized + Send + Sync + 'static> Default for Listeners<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized + Send + Sync + 'static> Listeners<F> {
    /// Create an empty listener set.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListenersInner {
                next_id: AtomicU64::new(0),
                entries: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Add a callback. The returned handle detaches it again.
    pub fn add(&self, callback: Arc<F>) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.write().push((id, callback));

        let inner: Weak<ListenersInner<F>> = Arc::downgrade(&self.inner);
        ListenerHandle {
            detach: Some(Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.entries.write().retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Snapshot the current callbacks for dispatch.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.inner
            .entries
            .read()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// True when no callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a registered listener.
///
/// Dropping the handle leaves the listener registered; call
/// [`close`](Self::close) to detach it.
pub struct ListenerHandle {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    /// Detach the listener from its registry.
    pub fn close(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Callback = dyn Fn() + Send + Sync;

    #[test]
    fn test_add_snapshot_and_close() {
        let listeners: Listeners<Callback> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = hits.clone();
        let handle_a = listeners.add(Arc::new(move || {
            hits_a.fetch_add(1, Ordering::SeqCst);
        }));
        let hits_b = hits.clone();
        let _handle_b = listeners.add(Arc::new(move || {
            hits_b.fetch_add(10, Ordering::SeqCst);
        }));

        for callback in listeners.snapshot() {
            callback();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        handle_a.close();
        assert_eq!(listeners.len(), 1);

        for callback in listeners.snapshot() {
            callback();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn test_dropping_handle_keeps_listener() {
        let listeners: Listeners<Callback> = Listeners::new();
        {
            let _handle = listeners.add(Arc::new(|| {}));
        }
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_callback_may_mutate_registry_during_dispatch() {
        let listeners: Arc<Listeners<Callback>> = Arc::new(Listeners::new());
        let registry = listeners.clone();
        let added = Arc::new(AtomicUsize::new(0));

        let added_inner = added.clone();
        let _handle = listeners.add(Arc::new(move || {
            let counter = added_inner.clone();
            let _ = registry.add(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        // Dispatch over a snapshot: the addition does not deadlock and does
        // not run in the same pass.
        for callback in listeners.snapshot() {
            callback();
        }
        assert_eq!(listeners.len(), 2);
        assert_eq!(added.load(Ordering::SeqCst), 0);
    }
}
