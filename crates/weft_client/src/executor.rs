//! Serial execution contexts for completions and events.

use crate::error::{SyncError, SyncResult};
use std::panic::{self, AssertUnwindSafe};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::warn;

/// A unit of work queued on an [`ExecutionContext`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks one at a time, in submission order.
///
/// Every completion and event of a client goes through its context, so
/// callbacks of one client never run concurrently with each other.
pub trait ExecutionContext: Send + Sync {
    /// Queues a task.
    fn execute(&self, task: Task);
}

/// Default context: a single Tokio task draining a FIFO channel.
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl SerialQueue {
    /// Starts a queue on the current Tokio runtime.
    pub fn new() -> SyncResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| SyncError::Generic(format!("no Tokio runtime: {e}")))?;
        Ok(Self::on(&handle))
    }

    /// Starts a queue on the given runtime.
    pub fn on(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                run_guarded(task);
            }
        });
        Self { tx }
    }
}

impl ExecutionContext for SerialQueue {
    fn execute(&self, task: Task) {
        // Fails only once the runtime is gone
        let _ = self.tx.send(task);
    }
}

/// Runs tasks immediately on the submitting thread.
///
/// Ordering holds only if tasks are submitted from one thread at a time.
/// Callbacks run while the client holds internal locks, so they must not
/// call back into the client.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineContext;

impl ExecutionContext for InlineContext {
    fn execute(&self, task: Task) {
        run_guarded(task);
    }
}

/// Runs a task, containing any panic so the queue keeps going.
fn run_guarded(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!("callback panicked; continuing with next task");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[test]
    fn serial_queue_needs_runtime() {
        assert!(matches!(SerialQueue::new(), Err(SyncError::Generic(_))));
    }

    #[tokio::test]
    async fn serial_queue_preserves_order() {
        let queue = SerialQueue::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            queue.execute(Box::new(move || seen.lock().push(i)));
        }
        let (tx, rx) = oneshot::channel();
        queue.execute(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.await.unwrap();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_queue() {
        let queue = SerialQueue::new().unwrap();
        queue.execute(Box::new(|| panic!("observer bug")));

        let (tx, rx) = oneshot::channel();
        queue.execute(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[test]
    fn inline_context_runs_immediately() {
        let hit = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&hit);
        InlineContext.execute(Box::new(move || *flag.lock() = true));
        assert!(*hit.lock());
    }
}
