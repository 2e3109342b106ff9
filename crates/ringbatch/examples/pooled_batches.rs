use ringbatch::{Batch, CircularBuffer, ObjectPool};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn main() {
    println!("RingBatch Pooled Export Example");
    println!("===============================\n");

    const N_PRODUCERS: u64 = 4;
    const ITEMS: u64 = 250_000;
    const MAX_BATCH: usize = 512;

    let buffer = Arc::new(CircularBuffer::<u64>::new(2048).unwrap());
    let pool = ObjectPool::<Vec<u8>>::new(4);

    println!("Configuration:");
    println!("  Buffer capacity: {} slots", buffer.capacity());
    println!("  Producers: {}", N_PRODUCERS);
    println!("  Items per producer: {}", ITEMS);
    println!("  Max batch size: {}\n", MAX_BATCH);

    let start = Instant::now();

    let handles: Vec<_> = (0..N_PRODUCERS)
        .map(|p| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut dropped = 0u64;
                for i in 0..ITEMS {
                    if buffer.try_add(p * ITEMS + i, 50_000).is_err() {
                        dropped += 1;
                    }
                }
                dropped
            })
        })
        .collect();

    let mut exported = 0u64;
    let mut batches = 0u64;
    let mut bytes = 0usize;
    loop {
        let producers_done = handles.iter().all(thread::JoinHandle::is_finished);
        let batch = Batch::drain(&buffer, MAX_BATCH);
        if batch.is_empty() {
            if producers_done && buffer.is_empty() {
                break;
            }
            thread::yield_now();
            continue;
        }

        // Serialize into a recycled buffer, as an exporter would.
        let mut payload = pool.acquire();
        for item in batch {
            payload.extend_from_slice(&item.to_le_bytes());
            exported += 1;
        }
        bytes += payload.len();
        batches += 1;
    }

    let dropped: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let duration = start.elapsed();

    println!("Results:");
    println!("  Exported: {}", exported);
    println!("  Dropped (buffer full): {}", dropped);
    println!("  Batches: {} ({} bytes)", batches, bytes);
    println!("  Payload buffers allocated: {}", pool.created());
    println!("  Duration: {:.2?}", duration);
    println!(
        "  Throughput: {:.2} million items/sec",
        exported as f64 / duration.as_secs_f64() / 1_000_000.0
    );
}
