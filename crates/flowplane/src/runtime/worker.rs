//! Job worker.
//!
//! Polls the queue, leases a batch, and processes jobs concurrently up to
//! the configured limit. Shutdown is cooperative: the cancellation token
//! stops new leases and the worker drains jobs already in flight before
//! returning.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::engine::WorkflowEngine;

pub struct JobWorker {
    engine: Arc<WorkflowEngine>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl JobWorker {
    pub fn new(engine: Arc<WorkflowEngine>, config: WorkerConfig) -> Self {
        let shutdown = engine.cancellation_token();
        Self {
            engine,
            config,
            shutdown,
        }
    }

    /// Run until the engine's cancellation token fires, then drain.
    pub async fn run(self) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let queue = self.engine.job_queue();

        tracing::info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "job worker started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let batch = match queue
                .dequeue_batch(&self.config.worker_id, self.config.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(worker_id = %self.config.worker_id, error = %e, "dequeue failed");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for job in batch {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    engine.process_job(&job).await;
                    drop(permit);
                });
            }
        }

        // Drain: wait for all in-flight jobs by taking every permit.
        let _ = semaphore.acquire_many(self.config.concurrency as u32).await;
        tracing::info!(worker_id = %self.config.worker_id, "job worker stopped");
    }
}
