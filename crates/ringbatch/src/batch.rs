//! Read-once batch views handed to exporters.
//!
//! A [`Batch`] is a tagged union over the three places a batch can come from:
//! a single item, a range of a [`CircularBuffer`], or an owned vector. The
//! exporter consumes it exactly once through [`IntoIterator`]; there is no way
//! to rewind.
//!
//! A buffer-backed batch captures `target = removed_count + min(max_size, count)`
//! when it is created. Items producers add after that point belong to the next
//! batch. Dropping the batch (or its iterator) early drains the rest of the
//! range so the buffer counters stay consistent and skipped items are released.

use crate::invariants::debug_assert_within_target;
use crate::CircularBuffer;
use std::fmt;
use thiserror::Error;

/// Error returned when constructing a [`Batch`] from a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("batch count {count} exceeds the {available} items provided")]
    CountOutOfRange { count: usize, available: usize },
}

type Filter<'a, T> = Box<dyn Fn(&T) -> bool + Send + Sync + 'a>;

enum Source<'a, T> {
    Empty,
    Single(Option<T>),
    Buffer {
        buffer: &'a CircularBuffer<T>,
        target: u64,
    },
    Items(std::vec::IntoIter<T>),
}

impl<T> Source<'_, T> {
    fn next_item(&mut self) -> Option<T> {
        match self {
            Source::Empty => None,
            Source::Single(item) => item.take(),
            Source::Buffer { buffer, target } => {
                let removed = buffer.removed_count();
                debug_assert_within_target!(removed, *target);
                if removed < *target {
                    buffer.read()
                } else {
                    None
                }
            }
            Source::Items(items) => items.next(),
        }
    }

    fn remaining(&self) -> usize {
        match self {
            Source::Empty => 0,
            Source::Single(item) => usize::from(item.is_some()),
            Source::Buffer { buffer, target } => {
                target.saturating_sub(buffer.removed_count()) as usize
            }
            Source::Items(items) => items.len(),
        }
    }
}

impl<T> Drop for Source<'_, T> {
    fn drop(&mut self) {
        if let Source::Buffer { buffer, target } = self {
            while buffer.removed_count() < *target {
                if buffer.read().is_none() {
                    break;
                }
            }
        }
    }
}

/// A bounded, single-pass batch of telemetry items.
pub struct Batch<'a, T> {
    source: Source<'a, T>,
    len: usize,
    filter: Option<Filter<'a, T>>,
}

impl<'a, T> Batch<'a, T> {
    /// A batch holding exactly one item.
    pub fn single(item: T) -> Self {
        Self {
            source: Source::Single(Some(item)),
            len: 1,
            filter: None,
        }
    }

    /// A batch over the first `count` items of `items`.
    ///
    /// Items past `count` are dropped immediately.
    pub fn from_vec(mut items: Vec<T>, count: usize) -> Result<Self, BatchError> {
        if count > items.len() {
            return Err(BatchError::CountOutOfRange {
                count,
                available: items.len(),
            });
        }
        items.truncate(count);
        Ok(Self {
            source: Source::Items(items.into_iter()),
            len: count,
            filter: None,
        })
    }

    /// Takes up to `max_size` of the items currently in `buffer`.
    ///
    /// Only the buffer's consumer may create buffer-backed batches.
    pub fn drain(buffer: &'a CircularBuffer<T>, max_size: usize) -> Self {
        debug_assert!(max_size > 0, "max_size should be a positive number");

        let len = max_size.min(buffer.count());
        let target = buffer.removed_count() + len as u64;

        Self {
            source: Source::Buffer { buffer, target },
            len,
            filter: None,
        }
    }

    /// Number of items captured when the batch was created.
    ///
    /// Filters applied with [`with_filter`](Self::with_filter) do not change it.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a batch that also skips items for which `keep` returns false.
    ///
    /// Composes with any existing filter using logical AND. Skipped items are
    /// dropped as iteration passes them.
    pub fn with_filter<F>(self, keep: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'a,
        T: 'a,
    {
        let filter: Filter<'a, T> = match self.filter {
            None => Box::new(keep),
            Some(existing) => Box::new(move |item: &T| existing(item) && keep(item)),
        };
        Self {
            source: self.source,
            len: self.len,
            filter: Some(filter),
        }
    }
}

impl<T> Default for Batch<'_, T> {
    fn default() -> Self {
        Self {
            source: Source::Empty,
            len: 0,
            filter: None,
        }
    }
}

impl<T> fmt::Debug for Batch<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.source {
            Source::Empty => "empty",
            Source::Single(_) => "single",
            Source::Buffer { .. } => "circular_buffer",
            Source::Items(_) => "items",
        };
        f.debug_struct("Batch")
            .field("source", &kind)
            .field("len", &self.len)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl<'a, T> IntoIterator for Batch<'a, T> {
    type Item = T;
    type IntoIter = BatchIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        BatchIter {
            source: self.source,
            filter: self.filter,
        }
    }
}

/// Forward-only iterator over a [`Batch`].
pub struct BatchIter<'a, T> {
    source: Source<'a, T>,
    filter: Option<Filter<'a, T>>,
}

impl<T> Iterator for BatchIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let item = self.source.next_item()?;
            match &self.filter {
                Some(keep) if !keep(&item) => continue,
                _ => return Some(item),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.source.remaining();
        if self.filter.is_some() {
            (0, Some(remaining))
        } else {
            (remaining, Some(remaining))
        }
    }
}
