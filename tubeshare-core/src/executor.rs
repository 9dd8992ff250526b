//! Execution contexts: a worker for payload processing and a serial main context for completions.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs somewhere. Implementations decide threading; the core never spawns threads itself.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Worker context for slow work, main context for completion handlers that touch shared state.
#[derive(Clone)]
pub struct Contexts {
    pub worker: Arc<dyn Executor>,
    pub main: Arc<dyn Executor>,
}

/// Executor that queues jobs until the owner runs them.
#[derive(Default)]
pub struct QueuedExecutor {
    jobs: Mutex<VecDeque<Job>>,
}

impl QueuedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the oldest job. False if none was queued.
    pub fn run_one(&self) -> bool {
        let job = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run until empty, including jobs queued by jobs. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut n = 0;
        while self.run_one() {
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Executor for QueuedExecutor {
    fn execute(&self, job: Job) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(job);
    }
}

/// FIFO of payloads drained by one worker job. When intake stops and the queue is empty,
/// `done` runs on the main context with the number of items handled.
pub struct PayloadQueue<T> {
    tx: Option<mpsc::Sender<T>>,
}

impl<T: Send + 'static> PayloadQueue<T> {
    pub fn spawn<H, E, D>(contexts: &Contexts, mut handler: H, done: D) -> Self
    where
        H: FnMut(T) -> Result<(), E> + Send + 'static,
        E: Display,
        D: FnOnce(usize) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<T>();
        let main = Arc::clone(&contexts.main);
        contexts.worker.execute(Box::new(move || {
            let mut handled = 0usize;
            for item in rx {
                if let Err(e) = handler(item) {
                    warn!(event = "payload_handler_failed", error = %e);
                }
                handled += 1;
            }
            debug!(event = "payload_queue_drained", handled);
            main.execute(Box::new(move || done(handled)));
        }));
        Self { tx: Some(tx) }
    }

    /// Enqueue a payload. False once intake has stopped.
    pub fn push(&self, item: T) -> bool {
        match &self.tx {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Stop intake; the worker flushes what remains.
    pub fn finish(&mut self) {
        self.tx = None;
    }

    pub fn is_finished(&self) -> bool {
        self.tx.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contexts() -> (Arc<QueuedExecutor>, Arc<QueuedExecutor>, Contexts) {
        let worker = Arc::new(QueuedExecutor::new());
        let main = Arc::new(QueuedExecutor::new());
        let ctx = Contexts {
            worker: worker.clone(),
            main: main.clone(),
        };
        (worker, main, ctx)
    }

    #[test]
    fn queued_executor_runs_in_order() {
        let ex = QueuedExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            ex.execute(Box::new(move || log.lock().unwrap().push(i)));
        }
        assert_eq!(ex.len(), 3);
        assert_eq!(ex.run_pending(), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert!(!ex.run_one());
    }

    #[test]
    fn payloads_processed_on_worker_then_done_on_main() {
        let (worker, main, ctx) = contexts();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Mutex::new(None));
        let (s, d) = (seen.clone(), done.clone());
        let mut q = PayloadQueue::spawn(
            &ctx,
            move |x: u32| -> Result<(), String> {
                s.lock().unwrap().push(x);
                Ok(())
            },
            move |n| *d.lock().unwrap() = Some(n),
        );
        assert!(q.push(1));
        assert!(q.push(2));
        q.finish();
        assert!(!q.push(3));

        assert!(main.is_empty());
        assert_eq!(worker.run_pending(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(*done.lock().unwrap(), None);
        assert_eq!(main.run_pending(), 1);
        assert_eq!(*done.lock().unwrap(), Some(2));
    }

    #[test]
    fn handler_errors_are_not_fatal() {
        let (worker, main, ctx) = contexts();
        let done = Arc::new(Mutex::new(None));
        let d = done.clone();
        let mut q = PayloadQueue::spawn(
            &ctx,
            |x: u32| if x % 2 == 0 { Err("even") } else { Ok(()) },
            move |n| *d.lock().unwrap() = Some(n),
        );
        for i in 0..4 {
            q.push(i);
        }
        q.finish();
        worker.run_pending();
        main.run_pending();
        assert_eq!(*done.lock().unwrap(), Some(4));
    }

    #[test]
    fn dropping_queue_stops_intake() {
        let (worker, main, ctx) = contexts();
        let done = Arc::new(Mutex::new(None));
        let d = done.clone();
        let q = PayloadQueue::spawn(&ctx, |_: u8| Ok::<(), String>(()), move |n| {
            *d.lock().unwrap() = Some(n)
        });
        q.push(9);
        drop(q);
        worker.run_pending();
        main.run_pending();
        assert_eq!(*done.lock().unwrap(), Some(1));
    }
}
