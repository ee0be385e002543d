//! Bounded worker pool for handler dispatch
//!
//! A fixed set of tokio tasks drains a bounded job queue. When the queue is
//! full `submit` waits, which pushes backpressure onto the receive loop
//! instead of spawning unbounded concurrent handlers.

use crate::config::PoolConfig;
use crate::error::{Result, TransitError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A unit of work run on a pool worker
pub type Job = BoxFuture<'static, ()>;

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `config.workers` workers sharing a queue of `config.queue_capacity`
    pub fn new(config: &PoolConfig) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel::<Job>(config.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..config.workers)
            .map(|worker| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };

                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            tracing::error!(worker, "Job panicked on pool worker");
                        }
                    }
                    tracing::debug!(worker, "Pool worker stopped");
                })
            })
            .collect();

        tracing::debug!(
            workers = config.workers,
            queue = config.queue_capacity,
            "Worker pool started"
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size: config.workers,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job, waiting while the queue is full
    pub async fn submit(&self, job: Job) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|e| TransitError::Provider(format!("Pool lock poisoned: {}", e)))?
            .clone()
            .ok_or_else(|| TransitError::Provider("Worker pool is shut down".to_string()))?;

        sender
            .send(job)
            .await
            .map_err(|_| TransitError::Provider("Worker pool is shut down".to_string()))
    }

    /// Stop accepting jobs and wait for queued and running jobs to finish
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = {
            let mut sender = self
                .sender
                .lock()
                .map_err(|e| TransitError::Provider(format!("Pool lock poisoned: {}", e)))?;
            sender.take();

            let mut workers = self
                .workers
                .lock()
                .map_err(|e| TransitError::Provider(format!("Pool lock poisoned: {}", e)))?;
            workers.drain(..).collect()
        };

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Pool worker ended abnormally");
            }
        }

        tracing::debug!("Worker pool drained");
        Ok(())
    }
}
