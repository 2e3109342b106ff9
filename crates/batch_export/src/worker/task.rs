use super::{ExportWorker, WorkerCore};
use crate::timeout::Deadline;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Export loop as a task on a tokio runtime.
///
/// The exporter is still called synchronously, from inside the task, so a
/// slow exporter occupies one runtime worker thread while it runs.
/// `wait_for_export` and `shutdown` block the calling thread; call them from
/// outside the runtime (or from `spawn_blocking`).
pub struct TaskWorker<T> {
    core: Arc<WorkerCore<T>>,
    trigger: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> TaskWorker<T> {
    pub(crate) fn spawn(core: Arc<WorkerCore<T>>, runtime: &Handle) -> Self {
        let trigger = Arc::new(Notify::new());

        let loop_core = Arc::clone(&core);
        let loop_trigger = Arc::clone(&trigger);
        let handle = runtime.spawn(async move {
            run(&loop_core, &loop_trigger).await;
        });

        Self {
            core,
            trigger,
            handle: Mutex::new(Some(handle)),
        }
    }
}

async fn run<T: Send + 'static>(core: &WorkerCore<T>, trigger: &Notify) {
    debug!("export task started");
    loop {
        if core.should_wait() {
            // `Notify` stores one permit, so a trigger that fires before we
            // start waiting is not lost.
            let _ = tokio::time::timeout(core.scheduled_delay(), trigger.notified()).await;
        }

        core.export_once();

        if core.drained() {
            break;
        }
        // A full buffer skips the wait above; let other tasks on this
        // runtime run between batches.
        tokio::task::yield_now().await;
    }
    core.mark_stopped();
    debug!("export task stopped");
}

impl<T: Send + 'static> ExportWorker for TaskWorker<T> {
    fn trigger_export(&self) -> bool {
        if self.core.shutdown_requested() {
            return false;
        }
        self.trigger.notify_one();
        true
    }

    fn wait_for_export(&self, timeout: Option<Duration>) -> bool {
        self.core.wait_for_export(timeout, || self.trigger_export())
    }

    fn shutdown(&self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::after(timeout);
        self.core.request_shutdown();
        self.trigger.notify_one();

        if !self.core.wait_stopped(deadline) {
            warn!(?timeout, "export task did not stop within the shutdown timeout");
            return false;
        }

        // Finished tasks need no join; dropping the handle detaches it.
        drop(
            self.handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        true
    }
}

impl<T> fmt::Debug for TaskWorker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWorker")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;
    use ringbatch::CircularBuffer;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_task_worker_flushes_and_shuts_down() {
        let rt = runtime();
        let exporter = InMemoryExporter::new();
        let buffer = Arc::new(CircularBuffer::new(32).unwrap());
        let core = Arc::new(WorkerCore::new(
            Arc::clone(&buffer),
            Arc::new(exporter.clone()),
            None,
            4,
            Duration::from_secs(60),
        ));
        let worker = TaskWorker::spawn(core, rt.handle());

        for i in 0..10u32 {
            buffer.try_add(i, 10).unwrap();
        }
        assert!(worker.wait_for_export(Some(Duration::from_secs(5))));
        assert_eq!(exporter.exported_items(), (0..10).collect::<Vec<_>>());
        assert_eq!(exporter.batch_sizes(), vec![4, 4, 2]);

        buffer.try_add(10, 10).unwrap();
        assert!(worker.shutdown(Some(Duration::from_secs(5))));
        assert_eq!(exporter.exported_count(), 11);
        assert!(!worker.trigger_export());
    }

    #[test]
    fn test_task_worker_exports_on_schedule() {
        let rt = runtime();
        let exporter = InMemoryExporter::new();
        let buffer = Arc::new(CircularBuffer::new(8).unwrap());
        let core = Arc::new(WorkerCore::new(
            Arc::clone(&buffer),
            Arc::new(exporter.clone()),
            None,
            8,
            Duration::from_millis(20),
        ));
        let worker = TaskWorker::spawn(core, rt.handle());

        buffer.try_add(1, 10).unwrap();
        let start = std::time::Instant::now();
        while exporter.exported_count() == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(exporter.exported_items(), vec![1]);
        assert!(worker.shutdown(None));
    }

    #[test]
    fn test_backlog_does_not_starve_current_thread_runtime() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let exporter = InMemoryExporter::new();
        let buffer = Arc::new(CircularBuffer::new(256).unwrap());
        let core = Arc::new(WorkerCore::new(
            Arc::clone(&buffer),
            Arc::new(exporter.clone()),
            None,
            1,
            Duration::from_secs(60),
        ));
        let _worker = TaskWorker::spawn(core, rt.handle());

        for i in 0..200u32 {
            buffer.try_add(i, 10).unwrap();
        }

        // Queued behind the export task; it only runs if the export task
        // gives the thread back between batches.
        let observer = exporter.clone();
        let observed = rt.spawn(async move { observer.exported_count() });
        let seen = rt.block_on(observed).unwrap();
        assert!(seen < 200, "observer only ran after {seen} exports");

        rt.block_on(async {
            while exporter.exported_count() < 200 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        assert_eq!(exporter.exported_items(), (0..200).collect::<Vec<_>>());
    }
}
