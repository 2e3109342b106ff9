//! Bounded object pool for reusable batch containers.
//!
//! Exporters group items into per-scope containers and serialize them into
//! byte buffers on every export. Recycling those allocations through a pool
//! keeps the steady state allocation-free under high throughput.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Values that can be cleared for reuse without dropping their allocation.
pub trait Reset {
    fn reset(&mut self);
}

impl<T> Reset for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Reset for String {
    fn reset(&mut self) {
        self.clear();
    }
}

/// A lock-guarded free list with an upper bound on retained values.
#[derive(Debug)]
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    max_retained: usize,
    created: AtomicU64,
    reused: AtomicU64,
}

impl<T: Default + Reset> ObjectPool<T> {
    /// Creates a pool that keeps at most `max_retained` idle values.
    pub fn new(max_retained: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_retained)),
            max_retained,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        })
    }

    /// Takes an idle value or creates a fresh one.
    pub fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let value = match recycled {
            Some(value) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                T::default()
            }
        };

        Pooled {
            value,
            pool: Arc::clone(self),
            detached: false,
        }
    }

    fn release(&self, mut value: T) {
        value.reset();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_retained {
            free.push(value);
        }
    }

    /// Values currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Values allocated because the pool was empty.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Acquisitions served from the free list.
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

/// RAII handle: the value is reset and returned to its pool on drop.
pub struct Pooled<T: Default + Reset> {
    value: T,
    pool: Arc<ObjectPool<T>>,
    detached: bool,
}

impl<T: Default + Reset> Pooled<T> {
    /// Detaches the value from the pool.
    pub fn into_inner(mut self) -> T {
        self.detached = true;
        std::mem::take(&mut self.value)
    }
}

impl<T: Default + Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Default + Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Default + Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.pool.release(std::mem::take(&mut self.value));
        }
    }
}

impl<T: Default + Reset + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}
