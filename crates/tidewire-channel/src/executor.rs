//! Execution contexts for handler work.
//!
//! A channel's receive loop runs on its own task. Inbound commands and
//! events are handed to an [`Executor`] so a slow handler never stalls the
//! loop (and with it the answers other callers are waiting for).

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

/// Runs submitted units of work.
pub trait Executor: Send + Sync + 'static {
    /// Submits a task. Must not block the caller.
    fn execute(&self, task: BoxFuture<'static, ()>);
}

impl Executor for Handle {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        self.spawn(task);
    }
}

/// Returns an executor that spawns onto the current tokio runtime.
///
/// # Panics
///
/// Panics when called outside a tokio runtime.
pub fn current() -> Arc<dyn Executor> {
    Arc::new(Handle::current())
}

/// Runs tasks one at a time, in submission order, on a single worker task.
#[derive(Clone)]
pub struct SerialExecutor {
    queue: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl SerialExecutor {
    /// Starts the worker on the given runtime.
    pub fn spawn_on(handle: &Handle) -> Self {
        let (queue, mut tasks) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        handle.spawn(async move {
            while let Some(task) = tasks.recv().await {
                task.await;
            }
            debug!("Serial executor stopped");
        });
        Self { queue }
    }

    /// Starts the worker on the current runtime.
    pub fn new() -> Self {
        Self::spawn_on(&Handle::current())
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        if self.queue.send(task).is_err() {
            debug!("Serial executor is gone, dropping task");
        }
    }
}
