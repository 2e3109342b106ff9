//! Debug assertion macros for circular buffer and batch invariants.
//!
//! Only active in debug builds (`debug_assert!`), so release builds pay nothing.
//! Used by `CircularBuffer<T>` and `Batch<'_, T>`.

// =============================================================================
// Bounded count: 0 <= added - removed <= capacity
// =============================================================================

/// Assert that the number of buffered items does not exceed capacity.
///
/// Used in: `CircularBuffer::try_add()` after a successful reservation
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "bounded count violated: count {} exceeds capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that the consumer never reads past what producers reserved.
///
/// Used in: `CircularBuffer::read()` before advancing the removed counter
macro_rules! debug_assert_removed_not_past_added {
    ($new_removed:expr, $added:expr) => {
        debug_assert!(
            $new_removed <= $added,
            "removed count {} advanced beyond added count {}",
            $new_removed,
            $added
        )
    };
}

// =============================================================================
// Monotonic progress: counters never decrease
// =============================================================================

macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

// =============================================================================
// Batch snapshot: a buffer-backed batch never reads past its captured target
// =============================================================================

/// Used in: `Batch` iteration and drain-on-drop
macro_rules! debug_assert_within_target {
    ($removed:expr, $target:expr) => {
        debug_assert!(
            $removed <= $target,
            "batch consumed past its snapshot: removed {} > target {}",
            $removed,
            $target
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_removed_not_past_added;
pub(crate) use debug_assert_within_target;
