//! In-memory reference implementations of the persistence ports.
//!
//! Backed by `tokio::sync::RwLock`-guarded maps. Suitable for tests and
//! embedded use; a relational backend replaces these in production
//! deployments. The lock scope of each method is the atomicity unit: lease
//! flips and the instance version compare-and-swap happen entirely inside
//! one write lock, which is what makes them behave like their SQL
//! counterparts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{
    AssignmentKind, DefinitionStatus, JobStatus, WorkflowDefinition, WorkflowEvent,
    WorkflowInstance, WorkflowJob, WorkflowTask,
};

use super::{
    DefinitionRepository, EventRepository, InstanceFilter, InstanceRepository, JobQueue,
    TaskRepository,
};

/// In-memory definition store keyed by (id, version).
#[derive(Default, Clone)]
pub struct MemoryDefinitionRepository {
    rows: Arc<RwLock<HashMap<(Uuid, u32), WorkflowDefinition>>>,
}

impl MemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionRepository for MemoryDefinitionRepository {
    async fn insert(&self, definition: WorkflowDefinition) -> EngineResult<()> {
        let mut rows = self.rows.write().await;
        let key = (definition.id, definition.version);
        if rows.contains_key(&key) {
            return Err(EngineError::Validation(format!(
                "definition {} version {} already exists",
                definition.id, definition.version
            )));
        }
        rows.insert(key, definition);
        Ok(())
    }

    async fn update(&self, definition: WorkflowDefinition) -> EngineResult<()> {
        let mut rows = self.rows.write().await;
        let key = (definition.id, definition.version);
        if !rows.contains_key(&key) {
            return Err(EngineError::DefinitionNotFound(definition.id.to_string()));
        }
        rows.insert(key, definition);
        Ok(())
    }

    async fn get(&self, id: Uuid, version: u32) -> EngineResult<Option<WorkflowDefinition>> {
        Ok(self.rows.read().await.get(&(id, version)).cloned())
    }

    async fn latest(&self, id: Uuid) -> EngineResult<Option<WorkflowDefinition>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|d| d.id == id)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn latest_published(&self, id: Uuid) -> EngineResult<Option<WorkflowDefinition>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|d| d.id == id && d.status == DefinitionStatus::Published)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn find_published_by_trigger(
        &self,
        entity_type: &str,
        entity_event: &str,
    ) -> EngineResult<Vec<WorkflowDefinition>> {
        let rows = self.rows.read().await;
        // Latest published version per definition id.
        let mut latest: HashMap<Uuid, WorkflowDefinition> = HashMap::new();
        for def in rows.values() {
            if def.status != DefinitionStatus::Published
                || !def.trigger.matches(entity_type, entity_event)
            {
                continue;
            }
            match latest.get(&def.id) {
                Some(existing) if existing.version >= def.version => {}
                _ => {
                    latest.insert(def.id, def.clone());
                }
            }
        }
        let mut matches: Vec<WorkflowDefinition> = latest.into_values().collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matches)
    }

    async fn list(&self) -> EngineResult<Vec<WorkflowDefinition>> {
        let rows = self.rows.read().await;
        let mut all: Vec<WorkflowDefinition> = rows.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(all)
    }
}

/// In-memory instance store with a version-token compare-and-swap.
#[derive(Default, Clone)]
pub struct MemoryInstanceRepository {
    rows: Arc<RwLock<HashMap<Uuid, WorkflowInstance>>>,
}

impl MemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for MemoryInstanceRepository {
    async fn insert(&self, instance: WorkflowInstance) -> EngineResult<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&instance.id) {
            return Err(EngineError::Validation(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        rows.insert(instance.id, instance);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<WorkflowInstance>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn try_update_with_lock(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> EngineResult<bool> {
        let mut rows = self.rows.write().await;
        let stored = rows
            .get(&instance.id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance.id.to_string()))?;
        if stored.version != expected_version {
            return Ok(false);
        }
        let mut updated = instance.clone();
        updated.version = expected_version + 1;
        rows.insert(updated.id, updated);
        Ok(true)
    }

    async fn list(&self, filter: &InstanceFilter) -> EngineResult<Vec<WorkflowInstance>> {
        let rows = self.rows.read().await;
        let mut matches: Vec<WorkflowInstance> = rows
            .values()
            .filter(|i| {
                filter.definition_id.is_none_or(|d| i.definition_id == d)
                    && filter.status.is_none_or(|s| i.status == s)
                    && filter
                        .entity_type
                        .as_deref()
                        .is_none_or(|t| i.entity_type.as_deref() == Some(t))
                    && filter
                        .entity_id
                        .as_deref()
                        .is_none_or(|e| i.entity_id.as_deref() == Some(e))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(50).min(200);
        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }
}

/// In-memory task store enforcing at most one open task per
/// (instance, step_key).
#[derive(Default, Clone)]
pub struct MemoryTaskRepository {
    rows: Arc<RwLock<HashMap<Uuid, WorkflowTask>>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn insert_open(&self, task: WorkflowTask) -> EngineResult<bool> {
        let mut rows = self.rows.write().await;
        let already_open = rows.values().any(|t| {
            t.instance_id == task.instance_id
                && t.step_key == task.step_key
                && t.status.is_open()
        });
        if already_open {
            return Ok(false);
        }
        rows.insert(task.id, task);
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<WorkflowTask>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn update(&self, task: WorkflowTask) -> EngineResult<()> {
        let mut rows = self.rows.write().await;
        if !rows.contains_key(&task.id) {
            return Err(EngineError::TaskNotFound(task.id.to_string()));
        }
        rows.insert(task.id, task);
        Ok(())
    }

    async fn list_open_for_instance(&self, instance_id: Uuid) -> EngineResult<Vec<WorkflowTask>> {
        let rows = self.rows.read().await;
        let mut tasks: Vec<WorkflowTask> = rows
            .values()
            .filter(|t| t.instance_id == instance_id && t.status.is_open())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn list_for_instance(&self, instance_id: Uuid) -> EngineResult<Vec<WorkflowTask>> {
        let rows = self.rows.read().await;
        let mut tasks: Vec<WorkflowTask> = rows
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn list_open_for_assignee(
        &self,
        kind: AssignmentKind,
        target: &str,
    ) -> EngineResult<Vec<WorkflowTask>> {
        let rows = self.rows.read().await;
        let mut tasks: Vec<WorkflowTask> = rows
            .values()
            .filter(|t| {
                t.status.is_open() && t.assignment.kind == kind && t.assignment.target == target
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }
}

/// In-memory append-only event log.
#[derive(Default, Clone)]
pub struct MemoryEventRepository {
    rows: Arc<RwLock<Vec<WorkflowEvent>>>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn append(&self, event: WorkflowEvent) -> EngineResult<()> {
        self.rows.write().await.push(event);
        Ok(())
    }

    async fn list_for_instance(&self, instance_id: Uuid) -> EngineResult<Vec<WorkflowEvent>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }
}

/// In-memory job queue with atomic leasing.
#[derive(Default, Clone)]
pub struct MemoryJobQueue {
    rows: Arc<RwLock<HashMap<Uuid, WorkflowJob>>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending + leased job count, for tests and monitoring.
    pub async fn outstanding(&self) -> usize {
        let rows = self.rows.read().await;
        rows.values()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Leased))
            .count()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: WorkflowJob) -> EngineResult<()> {
        self.rows.write().await.insert(job.id, job);
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        worker_id: &str,
        count: usize,
    ) -> EngineResult<Vec<WorkflowJob>> {
        let now = Utc::now();
        let mut rows = self.rows.write().await;

        let mut due: Vec<Uuid> = rows
            .values()
            .filter(|j| j.is_due(now))
            .map(|j| j.id)
            .collect();
        due.sort_by(|a, b| {
            let ja = &rows[a];
            let jb = &rows[b];
            ja.scheduled_for
                .cmp(&jb.scheduled_for)
                .then(jb.priority.cmp(&ja.priority))
        });

        let mut leased = Vec::new();
        for id in due.into_iter().take(count) {
            // Flip inside the same write lock: this is the CAS that keeps
            // two workers from leasing the same job.
            if let Some(job) = rows.get_mut(&id) {
                job.status = JobStatus::Leased;
                job.leased_by = Some(worker_id.to_string());
                job.leased_at = Some(now);
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn complete(&self, job_id: Uuid, result: Option<Value>) -> EngineResult<()> {
        let mut rows = self.rows.write().await;
        let job = rows
            .get_mut(&job_id)
            .ok_or_else(|| EngineError::Internal(format!("job not found: {}", job_id)))?;
        job.status = JobStatus::Completed;
        job.result = result;
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        let mut rows = self.rows.write().await;
        let job = rows
            .get_mut(&job_id)
            .ok_or_else(|| EngineError::Internal(format!("job not found: {}", job_id)))?;
        job.error = Some(error.to_string());
        match retry_at {
            Some(at) => {
                job.status = JobStatus::Pending;
                job.scheduled_for = at;
                job.attempt += 1;
                job.leased_by = None;
                job.leased_at = None;
            }
            None => {
                job.status = JobStatus::Failed;
                job.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn recover_stuck(&self, timeout: Duration) -> EngineResult<u64> {
        let now = Utc::now();
        let mut rows = self.rows.write().await;
        let mut recovered = 0;
        for job in rows.values_mut() {
            if job.is_stuck(now, timeout) {
                job.status = JobStatus::Pending;
                job.leased_by = None;
                job.leased_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn cleanup_finished(&self, older_than: Duration) -> EngineResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, j| {
            !(matches!(j.status, JobStatus::Completed | JobStatus::Failed)
                && j.finished_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - rows.len()) as u64)
    }
}
