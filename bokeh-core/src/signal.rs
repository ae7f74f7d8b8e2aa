//! Typed observer lists.
//!
//! A [`Signal`] keeps one list of listeners per event kind. Emission is
//! synchronous and runs against a snapshot of the list, so a listener may
//! disconnect itself (or others) while being called.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Slots<T> = Mutex<Vec<(u64, Slot<T>)>>;

pub struct Signal<T> {
    slots: Arc<Slots<T>>,
    next_id: AtomicU64,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener. The returned handle removes it again.
    pub fn connect<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push((id, Arc::new(listener)));

        let slots: Weak<Slots<T>> = Arc::downgrade(&self.slots);
        Subscription {
            id,
            detach: Some(Box::new(move || {
                if let Some(slots) = slots.upgrade() {
                    slots.lock().retain(|(slot_id, _)| *slot_id != id);
                }
            })),
        }
    }

    /// Call every listener registered at the time of the call.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Slot<T>> = self.slots.lock().iter().map(|(_, s)| s.clone()).collect();
        for slot in snapshot {
            slot(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Signal::connect`].
///
/// Dropping the handle leaves the listener connected; call
/// [`Subscription::disconnect`] to remove it.
pub struct Subscription {
    id: u64,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn disconnect(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_all_listeners() {
        let signal = Signal::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = total.clone();
            signal.connect(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }

        signal.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_disconnect() {
        let signal = Signal::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        signal.emit(&());
        sub.disconnect();
        signal.emit(&());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn test_disconnect_after_signal_dropped() {
        let signal = Signal::<()>::new();
        let sub = signal.connect(|_| {});
        drop(signal);
        sub.disconnect();
    }
}
