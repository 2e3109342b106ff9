//! # Batch Export Pipeline Demo
//!
//! End-to-end run of the pipeline against a simulated backend:
//!
//! 1. A [`FnTransport`] stands in for the network. It answers a share of
//!    requests with `503 Service Unavailable` and a `Retry-After` hint.
//! 2. [`build_handler`] picks the retry strategy: in-memory backoff by
//!    default, or the disk spool with `--disk`.
//! 3. Several producer threads call `on_end` on one [`BatchExportProcessor`];
//!    unsampled records are filtered out before serialization.
//! 4. Shutdown drains the buffer and closes the transmission layer.
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (4 producers, 250 records each)
//! cargo run -p batch_export --features demo --bin demo --release -- --quick
//!
//! # Full mode (8 producers, 2000 records each)
//! cargo run -p batch_export --features demo --bin demo --release
//!
//! # Spool failed requests to disk instead of retrying in memory
//! cargo run -p batch_export --features demo --bin demo --release -- --disk
//!
//! # Debug logging from the pipeline
//! RUST_LOG=batch_export=debug cargo run -p batch_export --features demo --bin demo -- --verbose
//! ```

use batch_export::{
    build_handler, BatchConfig, BatchExportProcessor, FnTransport, JsonSerializer, RetryMode,
    RetryPolicy, Scope, SendOutcome, StorageConfig, TelemetryRecord, TransmissionConfig,
    TransmittingExporter,
};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

const SCOPES: [&str; 4] = ["http.server", "db.client", "cache", "messaging"];

/// Counters kept by the simulated backend.
#[derive(Default)]
struct BackendStats {
    requests: AtomicU64,
    rejected: AtomicU64,
    bytes: AtomicU64,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let quick = args.iter().any(|a| a == "--quick");
    let verbose = args.iter().any(|a| a == "--verbose");
    let disk = args.iter().any(|a| a == "--disk");

    let default_level = if verbose { "batch_export=debug" } else { "batch_export=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let (num_producers, records_per_producer) = if quick { (4, 250) } else { (8, 2000) };

    println!("\n================ Batch Export Pipeline Demo ================\n");

    // =========================================================================
    // Phase 1: transmission
    // =========================================================================
    println!("Phase 1: Configuring Transmission\n");

    let backend = Arc::new(BackendStats::default());
    let failure_rate = 0.2;
    let transport = {
        let backend = Arc::clone(&backend);
        FnTransport::new("simulated-backend", move |payload: &[u8], _deadline| {
            backend.requests.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(2));
            if rand::thread_rng().gen_bool(failure_rate) {
                backend.rejected.fetch_add(1, Ordering::Relaxed);
                return SendOutcome::from_http_status(503, Some(Duration::from_millis(20)));
            }
            backend.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
            SendOutcome::Success
        })
    };

    let spool_dir = std::env::temp_dir().join(format!("batch_export_demo_{}", std::process::id()));
    let transmission = TransmissionConfig::default()
        .with_export_timeout(Duration::from_secs(2))
        .with_retry(if disk { RetryMode::Disk } else { RetryMode::InMemory })
        .with_retry_policy(RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 1.5,
        })
        .with_storage(StorageConfig {
            retry_interval: Duration::from_millis(200),
            ..StorageConfig::at(&spool_dir)
        });

    let handler = match build_handler(Arc::new(transport), &transmission) {
        Ok(handler) => handler,
        Err(e) => {
            eprintln!("   failed to build transmission handler: {e}");
            std::process::exit(1);
        }
    };
    println!("   Retry mode:     {:?}", transmission.retry);
    println!("   Export timeout: {:?}", transmission.export_timeout);
    println!("   Backend:        {:.0}% of requests answered with 503", failure_rate * 100.0);
    if disk {
        println!("   Spool dir:      {}", spool_dir.display());
    }
    println!();

    let exporter = Arc::new(TransmittingExporter::<TelemetryRecord, _>::new(
        JsonSerializer::new(),
        handler,
    ));

    // =========================================================================
    // Phase 2: processor
    // =========================================================================
    println!("Phase 2: Configuring Processor\n");

    let config = match BatchConfig::builder()
        .with_max_queue_size(4096)
        .with_max_export_batch_size(256)
        .with_scheduled_delay(Duration::from_millis(100))
        .with_exporter_timeout(Duration::from_secs(5))
        .build()
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("   invalid batch config: {e}");
            std::process::exit(1);
        }
    };
    println!("   Queue size:       {}", config.max_queue_size);
    println!("   Max batch size:   {}", config.max_export_batch_size);
    println!("   Scheduled delay:  {:?}", config.scheduled_delay);
    println!("   Worker:           {:?}", config.worker);
    println!();

    let processor = match BatchExportProcessor::<TelemetryRecord>::builder(Arc::clone(&exporter))
        .with_batch_config(config)
        .with_filter(TelemetryRecord::is_recorded)
        .build()
    {
        Ok(processor) => Arc::new(processor),
        Err(e) => {
            eprintln!("   failed to start processor: {e}");
            std::process::exit(1);
        }
    };

    // =========================================================================
    // Phase 3: producers
    // =========================================================================
    println!("Phase 3: Starting {num_producers} Producer Threads\n");

    let start = Instant::now();
    let handles: Vec<_> = (0..num_producers)
        .map(|id| {
            let processor = Arc::clone(&processor);
            thread::spawn(move || run_producer(id, records_per_producer, &processor))
        })
        .collect();

    let mut unsampled = 0u64;
    for (id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(skipped) => {
                unsampled += skipped;
                if verbose {
                    println!("   Producer {id} done ({skipped} unsampled)");
                }
            }
            Err(_) => eprintln!("   Producer {id} panicked"),
        }
    }
    let generation_time = start.elapsed();
    println!("   All producers finished in {generation_time:?}\n");

    // =========================================================================
    // Phase 4: shutdown
    // =========================================================================
    println!("Phase 4: Graceful Shutdown\n");

    if !processor.force_flush(Some(Duration::from_secs(10))) {
        println!("   force_flush timed out; shutdown will drain the rest");
    }
    if disk {
        // Give the sweep one interval to resend what the backend rejected.
        thread::sleep(Duration::from_millis(400));
    }
    let clean = processor.shutdown(Some(Duration::from_secs(10)));
    println!("   Shutdown {}\n", if clean { "complete" } else { "timed out" });

    // =========================================================================
    // Phase 5: statistics
    // =========================================================================
    let total_time = start.elapsed();
    let metrics = exporter.transmission_metrics();
    let worker = processor.worker_metrics();
    let requests = backend.requests.load(Ordering::Relaxed);
    let rejected = backend.rejected.load(Ordering::Relaxed);

    println!("Phase 5: Final Statistics\n");
    println!("   PRODUCERS");
    println!("     records submitted:      {:>10}", processor.received_count());
    println!("     unsampled (filtered):   {:>10}", unsampled);
    println!("     dropped (buffer full):  {:>10}", processor.dropped_count());
    println!("   PROCESSOR");
    println!("     records processed:      {:>10}", processor.processed_count());
    println!("     batches exported:       {:>10}", worker.batches_exported());
    println!("     export failures:        {:>10}", worker.export_failures());
    println!("   TRANSMISSION");
    println!("     payloads submitted:     {:>10}", metrics.submitted());
    println!("     delivered:              {:>10}", metrics.succeeded());
    println!("     retried:                {:>10}", metrics.retried());
    println!("     spooled to disk:        {:>10}", metrics.persisted());
    println!("     failed:                 {:>10}", metrics.failed());
    println!("   BACKEND");
    println!("     requests:               {:>10}", requests);
    println!("     rejected (503):         {:>10}", rejected);
    println!("     bytes accepted:         {:>10}", backend.bytes.load(Ordering::Relaxed));
    println!();
    println!(
        "   Throughput: {:.0} records/s over {:.2?}",
        processor.received_count() as f64 / total_time.as_secs_f64(),
        total_time
    );

    if disk {
        let _ = std::fs::remove_dir_all(&spool_dir);
    }
    println!("\nDemo completed.\n");
}

/// Emits `count` records and returns how many were left unsampled.
fn run_producer(id: u64, count: u64, processor: &BatchExportProcessor<TelemetryRecord>) -> u64 {
    let mut rng = rand::thread_rng();
    let mut unsampled = 0;

    for seq in 0..count {
        let scope = SCOPES[(seq % SCOPES.len() as u64) as usize];
        let start = now_unix_nanos();
        let duration = rng.gen_range(50_000..5_000_000);
        let recorded = rng.gen_bool(0.9);
        if !recorded {
            unsampled += 1;
        }

        let record = TelemetryRecord::span(Scope::new(scope).with_version("0.1.0"), operation(scope))
            .with_ids(rng.gen(), rng.gen())
            .with_times(start, start + duration)
            .with_attribute("producer.id", id as i64)
            .with_attribute("sequence", seq as i64)
            .with_attribute("error", rng.gen_bool(0.05))
            .with_recorded(recorded);
        processor.on_end(record);

        if seq % 64 == 0 {
            thread::sleep(Duration::from_micros(200));
        }
    }
    unsampled
}

fn operation(scope: &str) -> &'static str {
    match scope {
        "http.server" => "GET /api/orders",
        "db.client" => "SELECT orders",
        "cache" => "cache.get",
        _ => "publish order.created",
    }
}

fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
