//! Persistence ports.
//!
//! The engine depends on these traits only; concrete storage (a relational
//! database in production deployments) is an external collaborator. The
//! [`memory`] module provides reference implementations backed by in-process
//! maps, used by the runtime in tests and embedded scenarios.
//!
//! Two contracts here carry the engine's concurrency model:
//!
//! - [`InstanceRepository::try_update_with_lock`] is a compare-and-swap on
//!   the instance's version token. All engine writes go through it; losing
//!   the swap means another worker advanced the instance first.
//! - [`JobQueue::dequeue_batch`] leases jobs atomically (Pending -> Leased),
//!   so two workers can never both hold the same job.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::model::{
    AssignmentKind, InstanceStatus, WorkflowDefinition, WorkflowEvent, WorkflowInstance,
    WorkflowJob, WorkflowTask,
};

pub use memory::{
    MemoryDefinitionRepository, MemoryEventRepository, MemoryInstanceRepository, MemoryJobQueue,
    MemoryTaskRepository,
};

/// Filter for instance listing.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub definition_id: Option<Uuid>,
    pub status: Option<InstanceStatus>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Versioned definition storage.
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Insert a new (id, version) row. Fails on duplicates.
    async fn insert(&self, definition: WorkflowDefinition) -> EngineResult<()>;

    /// Replace an existing (id, version) row.
    async fn update(&self, definition: WorkflowDefinition) -> EngineResult<()>;

    /// Fetch a pinned (id, version).
    async fn get(&self, id: Uuid, version: u32) -> EngineResult<Option<WorkflowDefinition>>;

    /// Fetch the highest version for an id.
    async fn latest(&self, id: Uuid) -> EngineResult<Option<WorkflowDefinition>>;

    /// Fetch the highest published version for an id.
    async fn latest_published(&self, id: Uuid) -> EngineResult<Option<WorkflowDefinition>>;

    /// All published definitions whose entity-event trigger matches.
    async fn find_published_by_trigger(
        &self,
        entity_type: &str,
        entity_event: &str,
    ) -> EngineResult<Vec<WorkflowDefinition>>;

    /// List all definitions (every version).
    async fn list(&self) -> EngineResult<Vec<WorkflowDefinition>>;
}

/// Instance storage with optimistic concurrency.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn insert(&self, instance: WorkflowInstance) -> EngineResult<()>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<WorkflowInstance>>;

    /// Compare-and-swap write. Persists `instance` with its version bumped
    /// to `expected_version + 1` only if the stored version still equals
    /// `expected_version`. Returns false when the swap is lost.
    async fn try_update_with_lock(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> EngineResult<bool>;

    async fn list(&self, filter: &InstanceFilter) -> EngineResult<Vec<WorkflowInstance>>;
}

/// Task storage enforcing the one-open-task-per-step invariant.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a task unless an open task already exists for the same
    /// (instance, step_key). Returns false without inserting when one does.
    async fn insert_open(&self, task: WorkflowTask) -> EngineResult<bool>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<WorkflowTask>>;

    async fn update(&self, task: WorkflowTask) -> EngineResult<()>;

    /// Open tasks for an instance.
    async fn list_open_for_instance(&self, instance_id: Uuid) -> EngineResult<Vec<WorkflowTask>>;

    /// All tasks for an instance, newest last.
    async fn list_for_instance(&self, instance_id: Uuid) -> EngineResult<Vec<WorkflowTask>>;

    /// Open tasks for an assignee worklist.
    async fn list_open_for_assignee(
        &self,
        kind: AssignmentKind,
        target: &str,
    ) -> EngineResult<Vec<WorkflowTask>>;
}

/// Append-only event log.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append one event. Events are never updated or deleted.
    async fn append(&self, event: WorkflowEvent) -> EngineResult<()>;

    /// Events for an instance in insertion order.
    async fn list_for_instance(&self, instance_id: Uuid) -> EngineResult<Vec<WorkflowEvent>>;
}

/// Durable job queue coordinating workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: WorkflowJob) -> EngineResult<()>;

    /// Lease up to `count` due jobs for a worker. Ordering is
    /// `scheduled_for` ascending, then priority descending. The
    /// Pending -> Leased flip is atomic per job.
    async fn dequeue_batch(&self, worker_id: &str, count: usize)
        -> EngineResult<Vec<WorkflowJob>>;

    /// Lease a single due job.
    async fn dequeue(&self, worker_id: &str) -> EngineResult<Option<WorkflowJob>> {
        Ok(self.dequeue_batch(worker_id, 1).await?.into_iter().next())
    }

    /// Mark a leased job completed.
    async fn complete(&self, job_id: Uuid, result: Option<Value>) -> EngineResult<()>;

    /// Mark a leased job failed. With `retry_at`, the job is re-queued
    /// Pending at that time with its attempt count incremented; without,
    /// it is terminal.
    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()>;

    /// Reset jobs leased longer than `timeout` back to Pending. Returns the
    /// number recovered.
    async fn recover_stuck(&self, timeout: Duration) -> EngineResult<u64>;

    /// Purge Completed/Failed job rows finished more than `older_than` ago.
    /// Returns the number purged. Events and instances are never touched.
    async fn cleanup_finished(&self, older_than: Duration) -> EngineResult<u64>;
}
