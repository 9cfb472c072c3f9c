use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`Observers::register`]; pass it back to unregister.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ObserverId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Explicit observer list owned by the object that emits `E`.
pub struct Observers<E> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(ObserverId, Callback<E>)>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

impl<E> Observers<E> {
    pub fn register(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the id was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        callbacks.len() != before
    }

    /// Calls every observer in registration order. The list is snapshotted
    /// first so observers may (un)register while being notified.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in snapshot {
            cb(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
