//! Crypto work queue.
//!
//! A fixed pool of OS threads runs asymmetric crypto jobs (signature checks,
//! key agreement) so they never run on the network context. Jobs come from a
//! bounded queue; each job's result is posted back through a bounded tokio
//! channel that only the network context reads.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, trace, warn};

/// A unit of crypto work producing a completion value.
pub type Job<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// Work queue errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkQueueError {
    /// Queue is full; the caller must shed load.
    #[error("crypto work queue saturated")]
    Saturated,

    /// Pool has been stopped.
    #[error("crypto work queue stopped")]
    Stopped,

    /// A worker thread could not be spawned.
    #[error("worker spawn failed: {0}")]
    Spawn(String),
}

/// Fixed-size crypto worker pool with a bounded job queue.
pub struct WorkQueue<T: Send + 'static> {
    jobs: Option<SyncSender<Job<T>>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Spawn `workers` threads sharing a queue of at most `depth` jobs.
    ///
    /// Completed results are sent on `completions`. A worker blocks when that
    /// channel is full, which stalls the pool instead of growing memory.
    pub fn start(
        workers: usize,
        depth: usize,
        completions: tokio_mpsc::Sender<T>,
    ) -> Result<Self, WorkQueueError> {
        let (tx, rx) = mpsc::sync_channel::<Job<T>>(depth);
        let rx = Arc::new(Mutex::new(rx));

        let mut queue = Self {
            jobs: Some(tx),
            workers: Vec::with_capacity(workers),
        };

        for index in 0..workers {
            let rx = Arc::clone(&rx);
            let completions = completions.clone();
            let handle = thread::Builder::new()
                .name(format!("iwp-crypto-{index}"))
                .spawn(move || worker_loop(index, rx, completions))
                .map_err(|e| WorkQueueError::Spawn(e.to_string()));

            match handle {
                Ok(handle) => queue.workers.push(handle),
                Err(e) => {
                    queue.stop();
                    return Err(e);
                }
            }
        }

        debug!(workers, depth, "crypto work queue started");
        Ok(queue)
    }

    /// Submit a job without blocking.
    ///
    /// # Errors
    /// `Saturated` when `depth` jobs are already waiting, `Stopped` after
    /// [`WorkQueue::stop`].
    pub fn submit<F>(&self, job: F) -> Result<(), WorkQueueError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or(WorkQueueError::Stopped)?;
        jobs.try_send(Box::new(job)).map_err(|e| match e {
            TrySendError::Full(_) => WorkQueueError::Saturated,
            TrySendError::Disconnected(_) => WorkQueueError::Stopped,
        })
    }

    /// Number of worker threads still attached.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool accepts jobs.
    pub fn is_running(&self) -> bool {
        self.jobs.is_some()
    }

    /// Stop accepting jobs and join every worker.
    ///
    /// Workers finish the jobs already queued first. Close the completion
    /// receiver before calling this, or workers may block on a full channel.
    pub fn stop(&mut self) {
        if self.jobs.take().is_none() && self.workers.is_empty() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("crypto worker exited abnormally");
            }
        }
        debug!("crypto work queue stopped");
    }
}

impl<T: Send + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Send + 'static> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("workers", &self.workers.len())
            .field("running", &self.jobs.is_some())
            .finish()
    }
}

fn worker_loop<T: Send + 'static>(
    index: usize,
    jobs: Arc<Mutex<Receiver<Job<T>>>>,
    completions: tokio_mpsc::Sender<T>,
) {
    loop {
        // The guard is released before the job runs.
        let next = match jobs.lock() {
            Ok(rx) => rx.recv(),
            Err(poisoned) => poisoned.into_inner().recv(),
        };
        let Ok(job) = next else {
            break;
        };

        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => {
                if completions.blocking_send(result).is_err() {
                    trace!(worker = index, "completion channel closed");
                    break;
                }
            }
            Err(_) => warn!(worker = index, "crypto job panicked; dropped"),
        }
    }
    trace!(worker = index, "crypto worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_complete() {
        let (tx, mut rx) = tokio_mpsc::channel(16);
        let mut queue = WorkQueue::start(2, 16, tx).unwrap();
        assert_eq!(queue.worker_count(), 2);

        for i in 0..10u32 {
            queue.submit(move || i * 2).unwrap();
        }

        let mut results: Vec<u32> = (0..10).map(|_| rx.blocking_recv().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());

        queue.stop();
        assert!(!queue.is_running());
    }

    #[test]
    fn test_completions_run_off_caller_thread() {
        let (tx, mut rx) = tokio_mpsc::channel(1);
        let queue = WorkQueue::start(1, 1, tx).unwrap();

        queue
            .submit(|| thread::current().name().map(str::to_owned))
            .unwrap();
        let name = rx.blocking_recv().unwrap();
        assert_eq!(name.as_deref(), Some("iwp-crypto-0"));
    }

    #[test]
    fn test_saturated_queue_rejects() {
        let (tx, rx) = tokio_mpsc::channel(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let mut queue = WorkQueue::start(1, 1, tx).unwrap();

        // Occupy the only worker.
        queue
            .submit(move || {
                let _ = gate_rx.recv();
            })
            .unwrap();

        // Wait until the worker has taken the first job off the queue.
        let mut filled = false;
        for _ in 0..100 {
            if queue.submit(|| ()).is_ok() {
                filled = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(filled);
        assert_eq!(queue.submit(|| ()), Err(WorkQueueError::Saturated));

        gate_tx.send(()).unwrap();
        drop(rx);
        queue.stop();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let (tx, mut rx) = tokio_mpsc::channel(4);
        let queue = WorkQueue::start(1, 4, tx).unwrap();

        queue.submit(|| panic!("malformed input")).unwrap();
        queue.submit(|| 7u8).unwrap();

        assert_eq!(rx.blocking_recv(), Some(7));
    }

    #[test]
    fn test_submit_after_stop() {
        let (tx, rx) = tokio_mpsc::channel::<()>(1);
        let mut queue = WorkQueue::start(1, 1, tx).unwrap();
        drop(rx);
        queue.stop();
        queue.stop();
        assert_eq!(queue.submit(|| ()), Err(WorkQueueError::Stopped));
    }

    #[test]
    fn test_every_job_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio_mpsc::channel(64);
        let mut queue = WorkQueue::start(4, 64, tx).unwrap();

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            queue
                .submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        for _ in 0..50 {
            rx.blocking_recv().unwrap();
        }
        queue.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
