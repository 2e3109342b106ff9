use crate::error::ExportError;
use crate::exporter::{ExportResult, Exporter};
use crate::serializer::Serializer;
use crate::transmission::{TransmissionHandler, TransmissionMetrics};
use ringbatch::{Batch, ObjectPool};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Serialized payload buffers kept between exports. The worker exports one
/// batch at a time, so one is enough in steady state.
const MAX_POOLED_PAYLOADS: usize = 2;

/// Exporter that serializes each batch into a pooled buffer and hands the
/// bytes to a [`TransmissionHandler`].
pub struct TransmittingExporter<T, S> {
    serializer: S,
    handler: Arc<dyn TransmissionHandler>,
    payloads: Arc<ObjectPool<Vec<u8>>>,
    is_shutdown: AtomicBool,
    _items: PhantomData<fn(T)>,
}

impl<T, S: Serializer<T>> TransmittingExporter<T, S> {
    pub fn new(serializer: S, handler: Arc<dyn TransmissionHandler>) -> Self {
        Self {
            serializer,
            handler,
            payloads: ObjectPool::new(MAX_POOLED_PAYLOADS),
            is_shutdown: AtomicBool::new(false),
            _items: PhantomData,
        }
    }

    pub fn transmission_metrics(&self) -> &TransmissionMetrics {
        self.handler.metrics()
    }
}

impl<T, S: Serializer<T>> Exporter<T> for TransmittingExporter<T, S> {
    fn export(&self, batch: Batch<'_, T>) -> ExportResult {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(ExportError::Shutdown);
        }

        let mut payload = self.payloads.acquire();
        let stats = self.serializer.serialize(batch, &mut payload)?;
        if stats.records == 0 {
            debug!(skipped = stats.skipped, "nothing to transmit after serialization");
            return Ok(());
        }

        if self.handler.try_submit_request(&payload) {
            Ok(())
        } else {
            Err(ExportError::Transmission(format!(
                "payload of {} records ({} bytes) was not delivered",
                stats.records, stats.bytes
            )))
        }
    }

    fn shutdown(&self, timeout: Option<Duration>) -> bool {
        self.is_shutdown.store(true, Ordering::Release);
        self.handler.shutdown(timeout)
    }
}

impl<T, S: fmt::Debug> fmt::Debug for TransmittingExporter<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmittingExporter")
            .field("serializer", &self.serializer)
            .field("is_shutdown", &self.is_shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Scope, TelemetryRecord};
    use crate::serializer::JsonSerializer;
    use crate::transmission::tests::ScriptedTransport;
    use crate::transmission::PlainTransmission;
    use crate::transport::SendOutcome;

    fn records(n: u64) -> Vec<TelemetryRecord> {
        (0..n)
            .map(|i| TelemetryRecord::span(Scope::new("test"), format!("op-{i}")).with_ids(1, i))
            .collect()
    }

    #[test]
    fn test_export_serializes_and_submits() {
        let transport = ScriptedTransport::new([]);
        let handler = Arc::new(PlainTransmission::new(transport.clone(), Duration::from_secs(1)));
        let exporter = TransmittingExporter::<TelemetryRecord, _>::new(JsonSerializer::new(), handler);

        exporter
            .export(Batch::from_vec(records(3), 3).unwrap())
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(json["scopes"][0]["records"].as_array().unwrap().len(), 3);
        assert_eq!(exporter.transmission_metrics().succeeded(), 1);
    }

    #[test]
    fn test_failed_submission_is_export_error() {
        let transport = ScriptedTransport::new([SendOutcome::from_http_status(500, None)]);
        let handler = Arc::new(PlainTransmission::new(transport, Duration::from_secs(1)));
        let exporter = TransmittingExporter::<TelemetryRecord, _>::new(JsonSerializer::new(), handler);

        let err = exporter
            .export(Batch::from_vec(records(2), 2).unwrap())
            .unwrap_err();
        assert!(matches!(err, ExportError::Transmission(_)));
    }

    #[test]
    fn test_empty_batch_is_not_transmitted() {
        let transport = ScriptedTransport::new([]);
        let handler = Arc::new(PlainTransmission::new(transport.clone(), Duration::from_secs(1)));
        let exporter = TransmittingExporter::<TelemetryRecord, _>::new(JsonSerializer::new(), handler);

        exporter.export(Batch::default()).unwrap();
        assert_eq!(transport.attempts(), 0);
    }

    #[test]
    fn test_shutdown_closes_handler() {
        let transport = ScriptedTransport::new([]);
        let handler = Arc::new(PlainTransmission::new(transport, Duration::from_secs(1)));
        let exporter = TransmittingExporter::<TelemetryRecord, _>::new(JsonSerializer::new(), handler);

        assert!(Exporter::<TelemetryRecord>::shutdown(&exporter, Some(Duration::from_secs(1))));
        assert_eq!(
            exporter.export(Batch::single(records(1).remove(0))),
            Err(ExportError::Shutdown)
        );
    }
}
