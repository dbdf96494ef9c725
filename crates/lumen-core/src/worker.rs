//! Single background worker for network and pairing jobs.
//!
//! Jobs run one at a time in submission order. Each job runs in its own task
//! so a panic is reported through its completion callback instead of taking
//! the worker down.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why a job produced no value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("job cancelled")]
    Cancelled,
}

impl From<tokio::task::JoinError> for JobError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            JobError::Panicked(msg)
        } else {
            JobError::Cancelled
        }
    }
}

/// The worker has shut down and accepts no more jobs.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("worker is closed")]
pub struct WorkerClosed;

/// FIFO background worker.
pub struct Worker {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn the worker loop on the current runtime.
    pub fn spawn(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(worker = name, "worker queue closed");
        });
        Self { name, tx, handle }
    }

    /// Queue `job`; `on_done` receives its output, or the panic it raised.
    pub fn submit<F, T, C>(&self, job: F, on_done: C) -> Result<(), WorkerClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Result<T, JobError>) + Send + 'static,
    {
        let name = self.name;
        let wrapped: Job = Box::pin(async move {
            let result = tokio::spawn(job).await.map_err(JobError::from);
            if let Err(e) = &result {
                error!(worker = name, error = %e, "background job failed");
            }
            on_done(result);
        });
        self.tx.send(wrapped).map_err(|_| WorkerClosed)
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            error!(worker = self.name, error = %e, "worker loop ended abnormally");
        }
    }
}
