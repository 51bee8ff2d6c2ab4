use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;

/// Single-slot, overwrite-on-write cell shared between one producer and any
/// number of readers. Readers never block the producer for longer than a
/// pointer swap and always observe the most recent value.
#[derive(Debug)]
pub struct Latest<T> {
    slot: RwLock<Option<Arc<T>>>,
    version: AtomicU64,
}

impl<T> Latest<T> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            version: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, value: T) {
        self.publish_arc(Arc::new(value));
    }

    pub fn publish_arc(&self, value: Arc<T>) {
        // Swap under the lock, drop the previous value outside of it.
        let previous = {
            let mut slot = self.slot.write();
            self.version.fetch_add(1, Ordering::Release);
            slot.replace(value)
        };
        drop(previous);
    }

    /// Most recently published value, `None` until the first publish.
    pub fn read_latest(&self) -> Option<Arc<T>> {
        self.slot.read().clone()
    }

    /// Incremented on every publish and clear; lets pollers detect changes
    /// without comparing payloads.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        let previous = {
            let mut slot = self.slot.write();
            self.version.fetch_add(1, Ordering::Release);
            slot.take()
        };
        drop(previous);
    }
}

impl<T> Default for Latest<T> {
    fn default() -> Self {
        Self::new()
    }
}
