//! Tokio-backed execution contexts: blocking pool for payload work, one serial task for completions.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tubeshare_core::{Contexts, Executor, Job};

/// Runs each job on the blocking pool.
pub struct BlockingExecutor {
    handle: Handle,
}

impl Executor for BlockingExecutor {
    fn execute(&self, job: Job) {
        self.handle.spawn_blocking(job);
    }
}

/// Runs jobs one at a time, in submission order, on a single task.
pub struct SerialExecutor {
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialExecutor {
    pub fn spawn(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { tx }
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::warn!(event = "main_context_gone");
        }
    }
}

/// Contexts on the current runtime. Must be called from within it.
pub fn contexts() -> Contexts {
    let handle = Handle::current();
    Contexts {
        worker: Arc::new(BlockingExecutor {
            handle: handle.clone(),
        }),
        main: Arc::new(SerialExecutor::spawn(&handle)),
    }
}
