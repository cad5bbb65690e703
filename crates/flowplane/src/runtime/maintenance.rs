//! Maintenance loop.
//!
//! Periodically recovers stuck jobs (leased by a worker that died) and
//! purges old finished job rows. Instances and events are never touched.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::engine::WorkflowEngine;

pub struct MaintenanceLoop {
    engine: Arc<WorkflowEngine>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl MaintenanceLoop {
    pub fn new(engine: Arc<WorkflowEngine>, config: WorkerConfig) -> Self {
        let shutdown = engine.cancellation_token();
        Self {
            engine,
            config,
            shutdown,
        }
    }

    /// Run both sweeps on their intervals until shutdown.
    pub async fn run(self) {
        let mut recovery = tokio::time::interval(self.config.recovery_interval);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        // The first tick of an interval fires immediately.
        recovery.tick().await;
        cleanup.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = recovery.tick() => {
                    if let Err(e) = self.engine.recover_stuck_jobs(self.config.stuck_timeout).await {
                        tracing::error!(error = %e, "stuck-job recovery failed");
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.engine.cleanup_finished_jobs(self.config.cleanup_retention).await {
                        tracing::error!(error = %e, "job cleanup failed");
                    }
                }
            }
        }
        tracing::info!("maintenance loop stopped");
    }
}
