//! RingBatch - Bounded MPSC Circular Buffer with Batch Views
//!
//! The buffering core of the telemetry export pipeline. Any number of
//! application threads hand finished telemetry items to a fixed-capacity
//! [`CircularBuffer`]; a single export worker drains them in bounded,
//! read-once [`Batch`]es.
//!
//! # Key Features
//!
//! - Monotonic `added`/`removed` counters on separate cache lines
//! - Bounded-spin slot reservation (producers never block)
//! - Snapshot batches: items added during an export wait for the next batch
//! - Drain-on-drop, so a partially consumed batch still releases its range
//! - [`ObjectPool`] for recycling serializer buffers between exports
//!
//! # Example
//!
//! ```
//! use ringbatch::{Batch, CircularBuffer};
//!
//! let buffer = CircularBuffer::<u64>::new(8).unwrap();
//!
//! // Producers: non-blocking add with a bounded spin budget
//! for i in 0..5 {
//!     buffer.try_add(i, 100).unwrap();
//! }
//!
//! // Consumer: take at most 3 items, filtered to even values
//! let batch = Batch::drain(&buffer, 3).with_filter(|v| v % 2 == 0);
//! assert_eq!(batch.len(), 3);
//! let exported: Vec<u64> = batch.into_iter().collect();
//! assert_eq!(exported, vec![0, 2]);
//!
//! assert_eq!(buffer.count(), 2);
//! ```

mod batch;
mod circular;
mod invariants;
pub mod pool;

pub use batch::{Batch, BatchError, BatchIter};
pub use circular::{BufferError, CircularBuffer};
pub use pool::{ObjectPool, Pooled, Reset};
