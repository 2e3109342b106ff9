//! Property-based tests for the circular buffer and batch invariants.
//!
//! Invariants covered:
//! - Bounded count: `0 <= added - removed <= capacity`
//! - Monotonic progress: counters never decrease
//! - At-most-once: every accepted item is read exactly once, in FIFO order
//! - Batch snapshot: a batch never yields more than it captured

use proptest::prelude::*;
use ringbatch::{Batch, CircularBuffer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Add(u32),
    Read,
    Drain(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<u32>().prop_map(Op::Add),
        2 => Just(Op::Read),
        1 => (1usize..8).prop_map(Op::Drain),
    ]
}

// =============================================================================
// Bounded count and monotonic progress
// =============================================================================

proptest! {
    #[test]
    fn prop_count_stays_within_capacity(
        capacity in 1usize..16,
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let buffer = CircularBuffer::new(capacity).unwrap();
        let mut last_added = 0;
        let mut last_removed = 0;

        for op in ops {
            match op {
                Op::Add(v) => {
                    let before = buffer.count();
                    let accepted = buffer.try_add(v, 10).is_ok();
                    prop_assert_eq!(accepted, before < capacity,
                        "add outcome must depend only on fullness");
                }
                Op::Read => {
                    let before = buffer.count();
                    let read = buffer.read();
                    prop_assert_eq!(read.is_some(), before > 0);
                }
                Op::Drain(max) => {
                    let before = buffer.count();
                    let batch = Batch::drain(&buffer, max);
                    prop_assert_eq!(batch.len(), before.min(max));
                    prop_assert_eq!(batch.into_iter().count(), before.min(max));
                }
            }

            prop_assert!(buffer.count() <= capacity,
                "count {} > capacity {}", buffer.count(), capacity);
            prop_assert!(buffer.added_count() >= last_added);
            prop_assert!(buffer.removed_count() >= last_removed);
            prop_assert!(buffer.removed_count() <= buffer.added_count());
            last_added = buffer.added_count();
            last_removed = buffer.removed_count();
        }
    }
}

// =============================================================================
// At-most-once, FIFO
// =============================================================================

proptest! {
    #[test]
    fn prop_every_accepted_item_read_once_in_order(
        capacity in 1usize..32,
        ops in prop::collection::vec(op_strategy(), 1..300),
    ) {
        let buffer = CircularBuffer::new(capacity).unwrap();
        let mut accepted = Vec::new();
        let mut read = Vec::new();

        for op in ops {
            match op {
                Op::Add(v) => {
                    if buffer.try_add(v, 10).is_ok() {
                        accepted.push(v);
                    }
                }
                Op::Read => read.extend(buffer.read()),
                Op::Drain(max) => read.extend(Batch::drain(&buffer, max)),
            }
        }
        read.extend(Batch::drain(&buffer, capacity));

        prop_assert_eq!(read, accepted);
        prop_assert!(buffer.is_empty());
    }
}

// =============================================================================
// Batch snapshot and drop accounting
// =============================================================================

proptest! {
    #[test]
    fn prop_partial_batch_consumption_releases_whole_range(
        fill in 1usize..32,
        max in 1usize..32,
        take in 0usize..32,
    ) {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let buffer = CircularBuffer::new(32).unwrap();
        for _ in 0..fill {
            prop_assert!(buffer.try_add(Tracked(Arc::clone(&dropped)), 10).is_ok());
        }

        let expected = fill.min(max);
        {
            let mut iter = Batch::drain(&buffer, max).into_iter();
            for _ in 0..take.min(expected) {
                prop_assert!(iter.next().is_some());
            }
        }

        prop_assert_eq!(dropped.load(Ordering::SeqCst), expected);
        prop_assert_eq!(buffer.count(), fill - expected);

        drop(buffer);
        prop_assert_eq!(dropped.load(Ordering::SeqCst), fill);
    }

    #[test]
    fn prop_filter_never_changes_len_or_consumption(
        values in prop::collection::vec(any::<u16>(), 1..64),
        modulus in 1u16..8,
    ) {
        let buffer = CircularBuffer::new(64).unwrap();
        for v in &values {
            prop_assert!(buffer.try_add(*v, 10).is_ok());
        }

        let batch = Batch::drain(&buffer, values.len()).with_filter(move |v| v % modulus == 0);
        prop_assert_eq!(batch.len(), values.len());

        let kept: Vec<u16> = batch.into_iter().collect();
        let expected: Vec<u16> = values.iter().copied().filter(|v| v % modulus == 0).collect();
        prop_assert_eq!(kept, expected);
        prop_assert!(buffer.is_empty());
    }
}
