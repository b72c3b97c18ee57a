//! Serialized work queues.
//!
//! A [`Sequence`] runs submitted jobs one at a time, in submission order.
//! Jobs do blocking storage I/O, so each one runs on tokio's blocking pool
//! while the worker task waits for it. Everything that writes the ledger
//! goes through a sequence, so two blocks, or a block and a pool tick, never
//! interleave their writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("sequence {0} is closed")]
    Closed(&'static str),
}

pub type Result<T> = std::result::Result<T, SequenceError>;

/// An ordered, single-worker job queue.
#[derive(Clone)]
pub struct Sequence {
    name: &'static str,
    jobs: mpsc::UnboundedSender<Job>,
    depth: Arc<AtomicUsize>,
    warn_depth: usize,
}

impl Sequence {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(name: &'static str, warn_depth: usize) -> Self {
        let (jobs, mut receiver) = mpsc::unbounded_channel::<Job>();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = depth.clone();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                if let Err(err) = tokio::task::spawn_blocking(job).await {
                    warn!(sequence = name, error = %err, "Sequence job panicked, closing");
                    break;
                }
                worker_depth.fetch_sub(1, Ordering::SeqCst);
            }
            debug!(sequence = name, "Sequence worker stopped");
        });
        Self {
            name,
            jobs,
            depth,
            warn_depth,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Jobs submitted but not yet finished.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Run `job` after everything submitted before it and wait for its result.
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let result = self.submit(job)?;
        result.await.map_err(|_| SequenceError::Closed(self.name))
    }

    /// Enqueue `job` and return a receiver for its result.
    ///
    /// A queue deeper than the warning threshold is logged but still accepted.
    pub fn submit<T, F>(&self, job: F) -> Result<oneshot::Receiver<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done, result) = oneshot::channel();
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > self.warn_depth {
            warn!(sequence = self.name, depth, limit = self.warn_depth, "Sequence queue is backing up");
        }

        let job: Job = Box::new(move || {
            // The caller may have stopped waiting; the work still counts.
            let _ = done.send(job());
        });
        if self.jobs.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(SequenceError::Closed(self.name));
        }
        Ok(result)
    }
}
