use crate::invariants::{
    debug_assert_bounded_count, debug_assert_monotonic, debug_assert_removed_not_past_added,
};
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

// =============================================================================
// SLOT PROTOCOL
// =============================================================================
//
// `added` (head) and `removed` (tail) are unbounded u64 sequence numbers; the
// slot for sequence `s` is `slots[s % capacity]`.
//
// **Producer (`try_add`):**
// 1. Load `removed` with Acquire, then `added` with Acquire. Reading `removed`
//    first guarantees `added >= removed` in the snapshot.
// 2. Full if `added - removed >= capacity` → hand the item back.
// 3. CAS `added` from the snapshot to snapshot + 1. Losing the race costs one
//    unit of the caller's spin budget.
// 4. Write the item into the slot, then store `ready = true` with Release.
//
// **Consumer (`read`):**
// 1. Load `removed` Relaxed (single writer), `added` Acquire.
// 2. Empty if equal.
// 3. Wait for the oldest slot's `ready` with Acquire. A producer may have
//    reserved the sequence but not yet published the value.
// 4. Move the value out, store `ready = false`, store `removed + 1` Release.
//
// A producer reserving sequence `s` observed `removed > s - capacity`, so the
// consumer's Release store on `removed` ordered the clearing of the previous
// occupant's `ready` flag before the producer's write into the same slot.
//
// =============================================================================

/// Error returned when constructing a [`CircularBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Capacity must be a positive number of slots.
    #[error("circular buffer capacity must be greater than zero")]
    ZeroCapacity,
}

struct Slot<T> {
    ready: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            ready: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Bounded multi-producer single-consumer ring of telemetry items.
///
/// Any number of threads may call [`try_add`](Self::try_add) concurrently.
/// Exactly one thread at a time may consume through [`read`](Self::read)
/// (usually via a [`Batch`](crate::Batch)); a second concurrent reader panics
/// instead of racing on a slot.
///
/// The buffer never grows. When it is full new items are refused and the
/// items already queued are kept.
pub struct CircularBuffer<T> {
    /// Total successful reservations (`AddedCount`).
    added: CachePadded<AtomicU64>,
    /// Total completed reads (`RemovedCount`), written only by the consumer.
    removed: CachePadded<AtomicU64>,
    /// Held for the duration of a `read` call.
    consumer_active: AtomicBool,
    capacity: usize,
    slots: Box<[Slot<T>]>,
}

// SAFETY: items move between threads through the slot protocol above; the
// consumer flag serializes reads. `T: Send` is all that is required.
unsafe impl<T: Send> Send for CircularBuffer<T> {}
unsafe impl<T: Send> Sync for CircularBuffer<T> {}

impl<T> CircularBuffer<T> {
    /// Creates a buffer with `capacity` slots.
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let slots: Box<[Slot<T>]> = (0..capacity).map(|_| Slot::empty()).collect();

        Ok(Self {
            added: CachePadded::new(AtomicU64::new(0)),
            removed: CachePadded::new(AtomicU64::new(0)),
            consumer_active: AtomicBool::new(false),
            capacity,
            slots,
        })
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of items ever accepted.
    #[inline]
    pub fn added_count(&self) -> u64 {
        self.added.load(Ordering::Acquire)
    }

    /// Total number of items ever read.
    #[inline]
    pub fn removed_count(&self) -> u64 {
        self.removed.load(Ordering::Acquire)
    }

    /// Items currently buffered (`added_count - removed_count`).
    #[inline]
    pub fn count(&self) -> usize {
        // Load removed first so the difference can never underflow.
        let removed = self.removed.load(Ordering::Acquire);
        let added = self.added.load(Ordering::Acquire);
        added.saturating_sub(removed) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[inline]
    fn index(&self, sequence: u64) -> usize {
        (sequence % self.capacity as u64) as usize
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Attempts to enqueue `item` without blocking.
    ///
    /// The slot reservation is a compare-and-swap loop that gives up after
    /// `max_spin_count` lost races. A full buffer fails immediately. On
    /// failure the item is handed back so the caller can account for the drop.
    pub fn try_add(&self, item: T, max_spin_count: usize) -> Result<(), T> {
        let backoff = Backoff::new();
        let mut spins = 0usize;

        loop {
            let removed = self.removed.load(Ordering::Acquire);
            let added = self.added.load(Ordering::Acquire);

            if added.wrapping_sub(removed) >= self.capacity as u64 {
                return Err(item);
            }

            if self
                .added
                .compare_exchange(added, added + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug_assert_bounded_count!((added + 1 - removed) as usize, self.capacity);

                let slot = &self.slots[self.index(added)];
                debug_assert!(
                    !slot.ready.load(Ordering::Relaxed),
                    "slot for sequence {} still holds an unread item",
                    added
                );

                // SAFETY: the CAS above gave this thread exclusive ownership of
                // sequence `added`; the consumer will not touch the slot until
                // `ready` is published below, and the previous occupant was
                // moved out before `removed` passed it.
                unsafe {
                    (*slot.value.get()).write(item);
                }
                slot.ready.store(true, Ordering::Release);
                return Ok(());
            }

            spins += 1;
            if spins >= max_spin_count {
                return Err(item);
            }
            backoff.spin();
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Removes and returns the oldest item, or `None` when empty.
    ///
    /// Consumer-only. If the oldest sequence has been reserved but its value is
    /// not yet published, waits for the producer to finish writing it.
    ///
    /// # Panics
    ///
    /// Panics if another thread is inside `read` at the same time.
    pub fn read(&self) -> Option<T> {
        let _consumer = ConsumerGuard::acquire(&self.consumer_active);

        let removed = self.removed.load(Ordering::Relaxed);
        let added = self.added.load(Ordering::Acquire);
        if added == removed {
            return None;
        }

        let slot = &self.slots[self.index(removed)];
        let backoff = Backoff::new();
        while !slot.ready.load(Ordering::Acquire) {
            backoff.snooze();
        }

        // SAFETY: `ready` was published with Release after the value was
        // written; the Acquire load above makes the write visible. Only this
        // consumer reads the slot and it clears `ready` before releasing it.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.ready.store(false, Ordering::Relaxed);

        let new_removed = removed + 1;
        debug_assert_removed_not_past_added!(new_removed, added);
        debug_assert_monotonic!("removed", removed, new_removed);
        self.removed.store(new_removed, Ordering::Release);

        Some(item)
    }
}

impl<T> Drop for CircularBuffer<T> {
    fn drop(&mut self) {
        let removed = *self.removed.get_mut();
        let added = *self.added.get_mut();

        for sequence in removed..added {
            let idx = (sequence % self.capacity as u64) as usize;
            let slot = &mut self.slots[idx];
            if *slot.ready.get_mut() {
                // SAFETY: `ready` marks an initialized value that was never read.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

impl<T> std::fmt::Debug for CircularBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularBuffer")
            .field("capacity", &self.capacity)
            .field("added", &self.added_count())
            .field("removed", &self.removed_count())
            .finish()
    }
}

/// Exclusive consumer marker for the duration of one `read`.
struct ConsumerGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ConsumerGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Self {
        assert!(
            !flag.swap(true, Ordering::Acquire),
            "CircularBuffer::read called from two consumers concurrently"
        );
        Self { flag }
    }
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
