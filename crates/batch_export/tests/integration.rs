use batch_export::{
    build_handler, BatchConfig, BatchExportProcessor, Deadline, ExportResult, Exporter,
    FnTransport, InMemoryExporter, JsonSerializer, PersistentTransmission, RetryMode, RetryPolicy,
    Scope, SendOutcome, StorageConfig, TelemetryRecord, TransmissionConfig, TransmissionHandler,
    TransmittingExporter, Transport, WorkerKind,
};
use ringbatch::Batch;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Records batch sizes and items, sleeping before each export.
struct SlowExporter {
    delay: Duration,
    items: Mutex<Vec<u64>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl SlowExporter {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            items: Mutex::new(Vec::new()),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    fn exported_count(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

impl Exporter<u64> for SlowExporter {
    fn export(&self, batch: Batch<'_, u64>) -> ExportResult {
        thread::sleep(self.delay);
        self.batch_sizes.lock().unwrap().push(batch.len());
        self.items.lock().unwrap().extend(batch);
        Ok(())
    }
}

/// Transport whose health can be flipped by the test.
struct SwitchableTransport {
    healthy: AtomicBool,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<Vec<u8>>>,
}

impl SwitchableTransport {
    fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }
}

impl Transport for SwitchableTransport {
    fn send(&self, payload: &[u8], _deadline: Deadline) -> SendOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            self.delivered.lock().unwrap().push(payload.to_vec());
            SendOutcome::Success
        } else {
            SendOutcome::from_http_status(503, None)
        }
    }
}

fn item(producer_id: u64, seq: u64) -> u64 {
    producer_id << 48 | seq
}

fn config(queue: usize, batch: usize, delay: Duration) -> BatchConfig {
    BatchConfig::builder()
        .with_max_queue_size(queue)
        .with_max_export_batch_size(batch)
        .with_scheduled_delay(delay)
        .build()
        .unwrap()
}

#[test]
fn test_concurrent_producers_no_loss_and_fifo() {
    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 5_000;

    let exporter = InMemoryExporter::new();
    let processor = Arc::new(
        BatchExportProcessor::new(
            exporter.clone(),
            config(65_536, 512, Duration::from_millis(50)),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer_id| {
            let processor = Arc::clone(&processor);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    processor.on_end(item(producer_id, seq));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(processor.shutdown(Some(Duration::from_secs(30))));
    assert_eq!(processor.dropped_count(), 0);

    let items = exporter.exported_items();
    assert_eq!(items.len() as u64, PRODUCERS * PER_PRODUCER);
    assert!(exporter.batch_sizes().iter().all(|&n| n <= 512));

    for producer_id in 0..PRODUCERS {
        let seqs: Vec<u64> = items
            .iter()
            .filter(|&&v| v >> 48 == producer_id)
            .map(|&v| v & 0xFFFF_FFFF_FFFF)
            .collect();
        assert_eq!(seqs.len() as u64, PER_PRODUCER);
        assert!(
            seqs.windows(2).all(|w| w[0] < w[1]),
            "producer {producer_id} FIFO violated"
        );
    }
}

#[test]
fn test_size_trigger_exports_full_batch_first() {
    let exporter = Arc::new(SlowExporter::new(Duration::from_millis(20)));
    let processor = BatchExportProcessor::new(
        Arc::clone(&exporter),
        config(10, 5, Duration::from_millis(1000)),
    )
    .unwrap();

    for seq in 0..12 {
        processor.on_end(item(0, seq));
    }

    assert!(processor.force_flush(Some(Duration::from_secs(10))));
    let sizes = exporter.batch_sizes();
    assert_eq!(sizes[0], 5);
    assert!(sizes.len() >= 2);
    assert!(sizes.iter().all(|&n| n <= 5));

    // The queue holds 10, so at most two of the 12 can have been dropped.
    let dropped = processor.dropped_count();
    assert!(dropped <= 2);
    assert_eq!(exporter.exported_count() as u64 + dropped, 12);
    assert_eq!(processor.received_count(), 12);
}

#[test]
fn test_drops_accounted_against_received() {
    let exporter = Arc::new(SlowExporter::new(Duration::from_millis(50)));
    let processor = BatchExportProcessor::new(
        Arc::clone(&exporter),
        config(16, 16, Duration::from_secs(60)),
    )
    .unwrap();

    for seq in 0..1_000 {
        processor.on_end(item(0, seq));
    }

    assert!(processor.dropped_count() > 0);
    assert_eq!(processor.received_count(), 1_000);
    assert!(processor.shutdown(Some(Duration::from_secs(10))));
    assert_eq!(
        exporter.exported_count() as u64 + processor.dropped_count(),
        1_000
    );
    assert_eq!(processor.processed_count(), exporter.exported_count() as u64);
}

#[test]
fn test_force_flush_respects_timeout_with_slow_exporter() {
    let exporter = Arc::new(SlowExporter::new(Duration::from_millis(300)));
    let processor = BatchExportProcessor::new(
        Arc::clone(&exporter),
        config(64, 1, Duration::from_secs(60)),
    )
    .unwrap();

    for seq in 0..4 {
        processor.on_end(item(0, seq));
    }

    let start = Instant::now();
    assert!(!processor.force_flush(Some(Duration::from_millis(100))));
    assert!(start.elapsed() < Duration::from_millis(250));

    // A zero timeout triggers but never waits.
    let start = Instant::now();
    assert!(!processor.force_flush(Some(Duration::ZERO)));
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn test_concurrent_shutdown_is_idempotent() {
    let exporter = InMemoryExporter::new();
    let processor = Arc::new(
        BatchExportProcessor::new(exporter.clone(), config(128, 16, Duration::from_secs(60)))
            .unwrap(),
    );
    for seq in 0..100 {
        processor.on_end(item(0, seq));
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let processor = Arc::clone(&processor);
            thread::spawn(move || processor.shutdown(Some(Duration::from_secs(10))))
        })
        .collect();
    let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.iter().all(|&ok| ok));
    assert_eq!(exporter.exported_count(), 100);

    processor.on_end(item(0, 100));
    assert_eq!(processor.dropped_count(), 1);
    assert_eq!(exporter.exported_count(), 100);
}

#[test]
fn test_task_worker_processor_on_tokio_runtime() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let exporter = InMemoryExporter::new();
    let config = BatchConfig::builder()
        .with_max_queue_size(1024)
        .with_max_export_batch_size(64)
        .with_scheduled_delay(Duration::from_millis(20))
        .with_worker(WorkerKind::Task)
        .build()
        .unwrap();
    let processor = Arc::new(
        BatchExportProcessor::builder(exporter.clone())
            .with_batch_config(config)
            .with_runtime(rt.handle().clone())
            .build()
            .unwrap(),
    );

    // Producers may themselves be runtime tasks; on_end never blocks.
    rt.block_on(async {
        let tasks: Vec<_> = (0..4u64)
            .map(|producer_id| {
                let processor = Arc::clone(&processor);
                tokio::spawn(async move {
                    for seq in 0..200 {
                        processor.on_end(item(producer_id, seq));
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
    });

    assert!(processor.force_flush(Some(Duration::from_secs(10))));
    assert_eq!(exporter.exported_count(), 800);
    assert!(processor.shutdown(Some(Duration::from_secs(10))));
}

#[test]
fn test_in_memory_retry_succeeds_on_third_attempt() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let transport = {
        let attempts = Arc::clone(&attempts);
        Arc::new(FnTransport::new("flaky", move |_: &[u8], _| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                SendOutcome::network_error()
            } else {
                SendOutcome::Success
            }
        }))
    };
    let config = TransmissionConfig::default()
        .with_retry(RetryMode::InMemory)
        .with_export_timeout(Duration::from_millis(2000))
        .with_retry_policy(RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            ..RetryPolicy::default()
        });
    let handler = build_handler(transport, &config).unwrap();

    assert!(handler.try_submit_request(b"payload"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(handler.metrics().retried(), 2);
}

#[test]
fn test_disk_retry_spools_then_sweep_delivers() {
    let dir = TempDir::new().unwrap();
    let transport = SwitchableTransport::new(false);
    let mut storage = StorageConfig::at(dir.path());
    storage.retry_interval = Duration::from_secs(3600);
    let handler =
        PersistentTransmission::new(transport.clone(), Duration::from_secs(1), &storage).unwrap();

    assert!(handler.try_submit_request(b"original payload"));

    let files: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    assert_eq!(fs::read(&files[0]).unwrap(), b"original payload");

    transport.healthy.store(true, Ordering::SeqCst);
    let report = handler.retry_stored_requests();
    assert_eq!(report.sent, 1);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    assert_eq!(
        transport.delivered.lock().unwrap().as_slice(),
        &[b"original payload".to_vec()]
    );
    assert!(handler.shutdown(Some(Duration::from_secs(5))));
}

#[test]
fn test_records_flow_through_serializer_and_transmission() {
    let transport = SwitchableTransport::new(true);
    let handler = build_handler(transport.clone(), &TransmissionConfig::default()).unwrap();
    let exporter = TransmittingExporter::<TelemetryRecord, _>::new(JsonSerializer::new(), handler);

    let processor = BatchExportProcessor::builder(exporter)
        .with_batch_config(config(64, 8, Duration::from_secs(60)))
        .with_filter(TelemetryRecord::is_recorded)
        .build()
        .unwrap();

    for i in 0..6u64 {
        let record = TelemetryRecord::span(Scope::new("checkout"), format!("step-{i}"))
            .with_ids(7, i)
            .with_recorded(i != 3);
        processor.on_end(record);
    }
    assert!(processor.force_flush(Some(Duration::from_secs(5))));

    let delivered = transport.delivered.lock().unwrap().clone();
    let names: Vec<String> = delivered
        .iter()
        .flat_map(|payload| {
            let json: serde_json::Value = serde_json::from_slice(payload).unwrap();
            json["scopes"][0]["records"]
                .as_array()
                .unwrap()
                .iter()
                .map(|r| r["name"].as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(names, ["step-0", "step-1", "step-2", "step-4", "step-5"]);
    assert!(processor.shutdown(Some(Duration::from_secs(5))));
}
