//! Workflow engine façade.
//!
//! Single entry point for definition lifecycle, instance control, task
//! actions, and job processing. All instance writes go through the
//! repository's compare-and-swap; a lost swap surfaces as
//! `ConcurrencyConflict`, which job processing absorbs as a benign no-op
//! (the winner's state stands) and API callers see as a retryable error.

pub mod requests;

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::executor::{
    ApiCallExecutor, AutomatedExecutor, ConditionExecutor, DelayExecutor, EndExecutor,
    ExecutorRegistry, ParallelExecutor, StepExecutionContext, StepExecutionResult,
    SubWorkflowExecutor, UserActionExecutor,
};
use crate::model::{
    Actor, AssignmentKind, DefinitionStatus, DefinitionValidator, EventType, InstanceStatus,
    JobType, StepType, TaskStatus, ValidationReport, WorkflowDefinition, WorkflowEvent,
    WorkflowInstance, WorkflowJob, WorkflowStep, WorkflowTask,
};
use crate::notify::{LogNotifier, Notifier};
use crate::store::{
    DefinitionRepository, EventRepository, InstanceFilter, InstanceRepository, JobQueue,
    MemoryDefinitionRepository, MemoryEventRepository, MemoryInstanceRepository, MemoryJobQueue,
    MemoryTaskRepository, TaskRepository,
};

pub use requests::{
    CompleteTaskRequest, InstanceDetail, InstanceProgress, ReassignTaskRequest,
    StartWorkflowRequest,
};

const JOIN_PREFIX: &str = "_join.";

/// How a processed job was finalized.
enum JobOutcome {
    /// Mark the job completed with this result.
    Done(Option<Value>),
    /// The job was already re-queued for retry; leave it alone.
    Requeued,
}

enum JoinArrival {
    NotAJoin,
    Waiting,
    Ready,
}

/// The workflow engine.
pub struct WorkflowEngine {
    definitions: Arc<dyn DefinitionRepository>,
    instances: Arc<dyn InstanceRepository>,
    tasks: Arc<dyn TaskRepository>,
    events: Arc<dyn EventRepository>,
    jobs: Arc<dyn JobQueue>,
    registry: ExecutorRegistry,
    validator: DefinitionValidator,
    notifier: Arc<dyn Notifier>,
    cancellation: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        instances: Arc<dyn InstanceRepository>,
        tasks: Arc<dyn TaskRepository>,
        events: Arc<dyn EventRepository>,
        jobs: Arc<dyn JobQueue>,
        registry: ExecutorRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            definitions,
            instances,
            tasks,
            events,
            jobs,
            registry,
            validator: DefinitionValidator::new(),
            notifier,
            cancellation: CancellationToken::new(),
        }
    }

    /// Engine with in-memory stores, the full executor set, and a logging
    /// notifier.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryDefinitionRepository::new()),
            Arc::new(MemoryInstanceRepository::new()),
            Arc::new(MemoryTaskRepository::new()),
            Arc::new(MemoryEventRepository::new()),
            Arc::new(MemoryJobQueue::new()),
            default_registry(),
            Arc::new(LogNotifier::new()),
        )
    }

    /// Token observed by executors; cancelling it drains in-flight work.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn job_queue(&self) -> Arc<dyn JobQueue> {
        self.jobs.clone()
    }

    // ---- definition lifecycle ----

    /// Store a new draft definition.
    pub async fn create_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> EngineResult<WorkflowDefinition> {
        if definition.status != DefinitionStatus::Draft {
            return Err(EngineError::Validation(
                "new definitions must be created as drafts".into(),
            ));
        }
        self.definitions.insert(definition.clone()).await?;
        tracing::info!(definition_id = %definition.id, name = %definition.name, "definition created");
        Ok(definition)
    }

    /// Replace a draft in place. Published and deprecated versions are
    /// frozen.
    pub async fn update_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> EngineResult<WorkflowDefinition> {
        let existing = self
            .definitions
            .get(definition.id, definition.version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition.id.to_string()))?;
        if existing.status != DefinitionStatus::Draft {
            return Err(EngineError::Validation(format!(
                "definition {} v{} is not a draft; only drafts are editable",
                definition.id, definition.version
            )));
        }
        let mut updated = definition;
        updated.status = DefinitionStatus::Draft;
        updated.updated_at = Utc::now();
        self.definitions.update(updated.clone()).await?;
        Ok(updated)
    }

    /// Validate a definition without publishing it: structural checks plus
    /// each step executor's configuration validation.
    pub fn validate_definition(&self, definition: &WorkflowDefinition) -> ValidationReport {
        let mut report = self.validator.validate(definition);
        for step in &definition.steps {
            match self.registry.get(step.step_type) {
                Ok(executor) => report.merge(executor.validate_config(step)),
                Err(e) => report.merge(ValidationReport {
                    is_valid: false,
                    errors: vec![format!("step '{}': {}", step.step_key, e)],
                    ..Default::default()
                }),
            }
        }
        report.is_valid = report.errors.is_empty();
        report
    }

    /// Validate and publish a draft, freezing its steps.
    pub async fn publish_definition(
        &self,
        id: Uuid,
        version: u32,
    ) -> EngineResult<WorkflowDefinition> {
        let mut definition = self
            .definitions
            .get(id, version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))?;
        if definition.status != DefinitionStatus::Draft {
            return Err(EngineError::Validation(format!(
                "definition {} v{} is not a draft",
                id, version
            )));
        }

        let report = self.validate_definition(&definition);
        if !report.is_valid {
            return Err(EngineError::Validation(format!(
                "definition failed validation: {}",
                report.errors.join("; ")
            )));
        }

        definition.status = DefinitionStatus::Published;
        definition.updated_at = Utc::now();
        self.definitions.update(definition.clone()).await?;
        tracing::info!(definition_id = %id, version, "definition published");
        Ok(definition)
    }

    /// Retire a published version. Running instances keep executing it.
    pub async fn deprecate_definition(
        &self,
        id: Uuid,
        version: u32,
    ) -> EngineResult<WorkflowDefinition> {
        let mut definition = self
            .definitions
            .get(id, version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))?;
        if definition.status != DefinitionStatus::Published {
            return Err(EngineError::Validation(format!(
                "definition {} v{} is not published",
                id, version
            )));
        }
        definition.status = DefinitionStatus::Deprecated;
        definition.updated_at = Utc::now();
        self.definitions.update(definition.clone()).await?;
        Ok(definition)
    }

    /// Copy the latest version of a definition into a new editable draft.
    pub async fn new_definition_version(&self, id: Uuid) -> EngineResult<WorkflowDefinition> {
        let latest = self
            .definitions
            .latest(id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))?;
        let draft = latest.next_version_draft();
        self.definitions.insert(draft.clone()).await?;
        Ok(draft)
    }

    pub async fn get_definition(&self, id: Uuid, version: u32) -> EngineResult<WorkflowDefinition> {
        self.definitions
            .get(id, version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    pub async fn list_definitions(&self) -> EngineResult<Vec<WorkflowDefinition>> {
        self.definitions.list().await
    }

    // ---- instance lifecycle ----

    /// Start a workflow instance and enqueue its first job.
    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> EngineResult<WorkflowInstance> {
        let definition = match request.definition_version {
            Some(version) => self
                .definitions
                .get(request.definition_id, version)
                .await?
                .ok_or_else(|| EngineError::DefinitionNotFound(request.definition_id.to_string()))?,
            None => match self.definitions.latest_published(request.definition_id).await? {
                Some(definition) => definition,
                // A definition with only draft or deprecated versions exists
                // but cannot run.
                None => match self.definitions.latest(request.definition_id).await? {
                    Some(latest) => {
                        return Err(EngineError::DefinitionNotExecutable(format!(
                            "definition {} has no published version (latest is v{})",
                            latest.id, latest.version
                        )))
                    }
                    None => {
                        return Err(EngineError::DefinitionNotFound(
                            request.definition_id.to_string(),
                        ))
                    }
                },
            },
        };

        if !definition.is_published() {
            return Err(EngineError::DefinitionNotExecutable(format!(
                "definition {} v{} is not published",
                definition.id, definition.version
            )));
        }
        if definition.start_step().is_none() {
            return Err(EngineError::DefinitionNotExecutable(format!(
                "definition {} v{} has no unique start step",
                definition.id, definition.version
            )));
        }

        let mut instance = WorkflowInstance::new(definition.id, definition.version);
        instance.entity_type = request.entity_type;
        instance.entity_id = request.entity_id;
        instance.entity_reference = request.entity_reference;
        instance.variables = request.variables;
        instance.priority = request.priority.unwrap_or(definition.priority);
        instance.started_by = request.started_by;
        instance.parent_instance_id = request.parent_instance_id;

        self.instances.insert(instance.clone()).await?;

        let actor = Actor::from_user_id(instance.started_by.as_deref());
        self.events
            .append(
                WorkflowEvent::new(instance.id, EventType::Started)
                    .with_actor(actor)
                    .with_message(format!("{} v{}", definition.name, definition.version)),
            )
            .await?;

        self.jobs
            .enqueue(
                WorkflowJob::new(instance.id, JobType::ProcessStep)
                    .with_priority(instance.priority),
            )
            .await?;

        tracing::info!(
            instance_id = %instance.id,
            definition_id = %definition.id,
            version = definition.version,
            "workflow started"
        );
        Ok(instance)
    }

    /// Enqueue a processing job for an instance (manual nudge). Idempotent:
    /// a terminal instance is left alone rather than rejected.
    pub async fn process_workflow(&self, instance_id: Uuid) -> EngineResult<WorkflowInstance> {
        let instance = self.load_instance(instance_id).await?;
        if instance.status.is_terminal() || instance.status == InstanceStatus::Failed {
            return Ok(instance);
        }
        self.jobs
            .enqueue(
                WorkflowJob::new(instance_id, JobType::ProcessStep)
                    .with_priority(instance.priority),
            )
            .await?;
        Ok(instance)
    }

    /// Suspend a running or task-waiting instance.
    pub async fn pause_workflow(
        &self,
        instance_id: Uuid,
        user_id: Option<&str>,
    ) -> EngineResult<WorkflowInstance> {
        let mut instance = self.load_instance(instance_id).await?;
        if !instance.transition_to(InstanceStatus::Suspended) {
            return Err(EngineError::InstanceNotRunnable(format!(
                "instance {} cannot be paused from {}",
                instance_id, instance.status
            )));
        }
        self.commit(&mut instance).await?;
        self.events
            .append(
                WorkflowEvent::new(instance_id, EventType::Paused)
                    .with_actor(Actor::from_user_id(user_id)),
            )
            .await?;
        Ok(instance)
    }

    /// Resume a suspended instance. Lands in WaitingForTask when an open
    /// task exists, Running (with a fresh job) otherwise.
    pub async fn resume_workflow(
        &self,
        instance_id: Uuid,
        user_id: Option<&str>,
    ) -> EngineResult<WorkflowInstance> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.status != InstanceStatus::Suspended {
            return Err(EngineError::InstanceNotRunnable(format!(
                "instance {} is {}, not suspended",
                instance_id, instance.status
            )));
        }
        let open_tasks = self.tasks.list_open_for_instance(instance_id).await?;

        instance.transition_to(InstanceStatus::Running);
        if !open_tasks.is_empty() {
            instance.transition_to(InstanceStatus::WaitingForTask);
        }
        self.commit(&mut instance).await?;

        self.events
            .append(
                WorkflowEvent::new(instance_id, EventType::Resumed)
                    .with_actor(Actor::from_user_id(user_id)),
            )
            .await?;

        if open_tasks.is_empty() {
            self.jobs
                .enqueue(
                    WorkflowJob::new(instance_id, JobType::ProcessStep)
                        .with_priority(instance.priority),
                )
                .await?;
        }
        Ok(instance)
    }

    /// Cancel an instance and its open tasks. Queued jobs become no-ops
    /// when dispatched.
    pub async fn cancel_workflow(
        &self,
        instance_id: Uuid,
        user_id: Option<&str>,
        reason: Option<&str>,
    ) -> EngineResult<WorkflowInstance> {
        let mut instance = self.load_instance(instance_id).await?;
        if !instance.transition_to(InstanceStatus::Cancelled) {
            return Err(EngineError::InstanceNotRunnable(format!(
                "instance {} is already {}",
                instance_id, instance.status
            )));
        }
        self.commit(&mut instance).await?;

        for mut task in self.tasks.list_open_for_instance(instance_id).await? {
            task.cancel();
            self.tasks.update(task).await?;
        }

        let mut event = WorkflowEvent::new(instance_id, EventType::Cancelled)
            .with_actor(Actor::from_user_id(user_id));
        if let Some(reason) = reason {
            event = event.with_message(reason);
        }
        self.events.append(event).await?;
        self.notifier.instance_finished(&instance).await;
        Ok(instance)
    }

    /// Re-enter the failed step of a failed instance. The attempt counter
    /// carries over, so the step gets exactly one more try per retry call.
    pub async fn retry_workflow(
        &self,
        instance_id: Uuid,
        user_id: Option<&str>,
    ) -> EngineResult<WorkflowInstance> {
        let mut instance = self.load_instance(instance_id).await?;
        if instance.status != InstanceStatus::Failed {
            return Err(EngineError::InstanceNotRunnable(format!(
                "instance {} is {}, not failed",
                instance_id, instance.status
            )));
        }
        if instance.current_step_key.is_none() {
            return Err(EngineError::InstanceNotRunnable(format!(
                "instance {} has no step to retry",
                instance_id
            )));
        }

        instance.transition_to(InstanceStatus::Running);
        instance.error_message = None;
        self.commit(&mut instance).await?;

        self.events
            .append(
                WorkflowEvent::new(instance_id, EventType::Resumed)
                    .with_actor(Actor::from_user_id(user_id))
                    .with_message("manual retry of failed step"),
            )
            .await?;

        self.jobs
            .enqueue(WorkflowJob::new(instance_id, JobType::Retry).with_priority(instance.priority))
            .await?;
        Ok(instance)
    }

    /// Start instances for every published definition whose trigger matches
    /// an entity event. One definition failing to start never blocks the
    /// others.
    pub async fn trigger_workflows(
        &self,
        entity_type: &str,
        entity_event: &str,
        entity_id: &str,
        variables: Map<String, Value>,
    ) -> EngineResult<Vec<Uuid>> {
        let matches = self
            .definitions
            .find_published_by_trigger(entity_type, entity_event)
            .await?;

        let mut started = Vec::new();
        for definition in matches {
            let request = StartWorkflowRequest {
                definition_id: definition.id,
                definition_version: Some(definition.version),
                entity_type: Some(entity_type.to_string()),
                entity_id: Some(entity_id.to_string()),
                entity_reference: None,
                variables: variables.clone(),
                priority: None,
                started_by: None,
                parent_instance_id: None,
            };
            match self.start_workflow(request).await {
                Ok(instance) => started.push(instance.id),
                Err(e) => {
                    tracing::warn!(
                        definition_id = %definition.id,
                        entity_type,
                        entity_event,
                        error = %e,
                        "triggered workflow failed to start"
                    );
                }
            }
        }
        Ok(started)
    }

    // ---- queries ----

    pub async fn get_instance(&self, instance_id: Uuid) -> EngineResult<WorkflowInstance> {
        self.load_instance(instance_id).await
    }

    pub async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> EngineResult<Vec<WorkflowInstance>> {
        self.instances.list(filter).await
    }

    /// Instance with its open tasks, audit trail, and progress.
    pub async fn get_instance_detail(&self, instance_id: Uuid) -> EngineResult<InstanceDetail> {
        let instance = self.load_instance(instance_id).await?;
        let definition = self
            .definitions
            .get(instance.definition_id, instance.definition_version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(instance.definition_id.to_string()))?;
        let open_tasks = self.tasks.list_open_for_instance(instance_id).await?;
        let events = self.events.list_for_instance(instance_id).await?;

        let completed: std::collections::HashSet<&str> = events
            .iter()
            .filter(|e| e.event_type == EventType::StepCompleted)
            .filter_map(|e| e.step_key.as_deref())
            .collect();
        let total_steps = definition.steps.len();
        let completed_steps = completed.len();
        let percent = if instance.status == InstanceStatus::Completed {
            100
        } else if total_steps == 0 {
            0
        } else {
            ((completed_steps * 100) / total_steps).min(99) as u8
        };

        Ok(InstanceDetail {
            instance,
            definition_name: definition.name,
            definition_version: definition.version,
            steps: definition.steps,
            open_tasks,
            events,
            progress: InstanceProgress {
                total_steps,
                completed_steps,
                percent,
            },
        })
    }

    pub async fn list_tasks_for_instance(
        &self,
        instance_id: Uuid,
    ) -> EngineResult<Vec<WorkflowTask>> {
        self.tasks.list_for_instance(instance_id).await
    }

    /// Open tasks in an assignee's worklist, highest priority first.
    pub async fn list_open_tasks(
        &self,
        kind: AssignmentKind,
        target: &str,
    ) -> EngineResult<Vec<WorkflowTask>> {
        self.tasks.list_open_for_assignee(kind, target).await
    }

    // ---- task actions ----

    /// Claim a pending task for a user.
    pub async fn claim_task(&self, task_id: Uuid, user_id: &str) -> EngineResult<WorkflowTask> {
        let mut task = self.load_task(task_id).await?;
        if !task.claim(user_id) {
            return Err(EngineError::TaskNotActionable(format!(
                "task {} is not pending",
                task_id
            )));
        }
        self.tasks.update(task.clone()).await?;
        Ok(task)
    }

    /// Complete a task and resume its instance along the chosen action's
    /// transition.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        request: CompleteTaskRequest,
    ) -> EngineResult<WorkflowInstance> {
        let mut task = self.load_task(task_id).await?;
        if !task.status.is_open() {
            return Err(EngineError::TaskNotActionable(format!(
                "task {} is no longer open",
                task_id
            )));
        }

        let mut instance = self.load_instance(task.instance_id).await?;
        if instance.status != InstanceStatus::WaitingForTask {
            return Err(EngineError::InstanceNotRunnable(format!(
                "instance {} is {}, not waiting for a task",
                instance.id, instance.status
            )));
        }

        let definition = self
            .definitions
            .get(instance.definition_id, instance.definition_version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(instance.definition_id.to_string()))?;
        let step = definition.get_step(&task.step_key).ok_or_else(|| {
            EngineError::Internal(format!(
                "task {} references unknown step '{}'",
                task_id, task.step_key
            ))
        })?;
        let next = step.next_for(&request.action).ok_or_else(|| {
            EngineError::Validation(format!(
                "action '{}' is not valid for step '{}'",
                request.action, task.step_key
            ))
        })?;

        if !task.complete(&request.action, request.comments.clone(), request.form_data.clone()) {
            return Err(EngineError::TaskNotActionable(format!(
                "task {} is no longer open",
                task_id
            )));
        }
        self.tasks.update(task.clone()).await?;

        if let Some(Value::Object(form)) = &request.form_data {
            instance.merge_variables(form);
        }
        instance.transition_to(InstanceStatus::Running);
        instance.current_step_key = Some(next.to_string());
        instance.attempt = 1;
        self.commit(&mut instance).await?;

        self.events
            .append(
                WorkflowEvent::new(instance.id, EventType::TaskCompleted)
                    .with_step(&task.step_key)
                    .with_actor(Actor::user(&request.user_id))
                    .with_message(request.action.clone()),
            )
            .await?;
        // The user-action step completes with its task.
        self.events
            .append(
                WorkflowEvent::new(instance.id, EventType::StepCompleted)
                    .with_step(&task.step_key)
                    .with_actor(Actor::user(&request.user_id)),
            )
            .await?;
        self.events
            .append(
                WorkflowEvent::new(instance.id, EventType::StepEntered)
                    .with_step(instance.current_step_key.as_deref().unwrap_or_default()),
            )
            .await?;

        self.jobs
            .enqueue(
                WorkflowJob::new(instance.id, JobType::ProcessStep)
                    .with_priority(instance.priority),
            )
            .await?;

        tracing::info!(
            task_id = %task_id,
            instance_id = %instance.id,
            action = %request.action,
            "task completed"
        );
        Ok(instance)
    }

    /// Reassign an open task back to Pending under the new assignee.
    pub async fn reassign_task(
        &self,
        task_id: Uuid,
        request: ReassignTaskRequest,
    ) -> EngineResult<WorkflowTask> {
        let mut task = self.load_task(task_id).await?;
        if !task.status.is_open() {
            return Err(EngineError::TaskNotActionable(format!(
                "task {} is no longer open",
                task_id
            )));
        }

        let previous = task.assignment.target.clone();
        task.assignment = request.assignment;
        task.status = TaskStatus::Pending;
        task.claimed_by = None;
        task.claimed_at = None;
        self.tasks.update(task.clone()).await?;

        let mut event = WorkflowEvent::new(task.instance_id, EventType::TaskReassigned)
            .with_step(&task.step_key)
            .with_actor(Actor::user(&request.user_id))
            .with_message(format!("{} -> {}", previous, task.assignment.target));
        if let Some(reason) = &request.reason {
            event = event.with_details(json!({"reason": reason}));
        }
        self.events.append(event).await?;
        self.notifier.task_reassigned(&task, &previous).await;
        Ok(task)
    }

    // ---- job processing ----

    /// Process one leased job to completion. Infallible from the worker's
    /// point of view: every outcome, including benign conflicts and step
    /// failures, is recorded on the job itself.
    pub async fn process_job(&self, job: &WorkflowJob) {
        match self.process_job_inner(job).await {
            Ok(JobOutcome::Done(result)) => {
                if let Err(e) = self.jobs.complete(job.id, result).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to mark job completed");
                }
            }
            Ok(JobOutcome::Requeued) => {}
            Err(e) if e.is_benign() => {
                if job.step_key.is_some() {
                    // Branch jobs carry work nobody else re-issues (the join
                    // arrival); a lost swap means redeliver, not drop.
                    tracing::debug!(job_id = %job.id, reason = %e, "branch job lost the swap, redelivering");
                    if let Err(e) = self.jobs.fail(job.id, &e.to_string(), Some(Utc::now())).await
                    {
                        tracing::error!(job_id = %job.id, error = %e, "failed to re-queue job");
                    }
                } else {
                    // Main-path loser: the winner already advanced the cursor
                    // and enqueued the follow-up.
                    tracing::debug!(job_id = %job.id, reason = %e, "job absorbed as no-op");
                    if let Err(e) = self
                        .jobs
                        .complete(job.id, Some(json!({"skipped": "concurrency_conflict"})))
                        .await
                    {
                        tracing::error!(job_id = %job.id, error = %e, "failed to mark job completed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    instance_id = %job.instance_id,
                    error = %e,
                    "job failed"
                );
                if let Err(e) = self.jobs.fail(job.id, &e.to_string(), None).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to mark job failed");
                }
            }
        }
    }

    async fn process_job_inner(&self, job: &WorkflowJob) -> EngineResult<JobOutcome> {
        let mut instance = self.load_instance(job.instance_id).await?;

        // Jobs queued before a cancel, pause, or completion dispatch as
        // no-ops.
        if instance.status.is_terminal() || instance.status == InstanceStatus::Suspended {
            return Ok(JobOutcome::Done(Some(
                json!({"skipped": instance.status.to_string()}),
            )));
        }
        if instance.status == InstanceStatus::WaitingForTask {
            return Ok(JobOutcome::Done(Some(json!({"skipped": "waiting_for_task"}))));
        }
        if instance.status == InstanceStatus::Failed {
            return Ok(JobOutcome::Done(Some(json!({"skipped": "failed"}))));
        }

        let definition = self
            .definitions
            .get(instance.definition_id, instance.definition_version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(instance.definition_id.to_string()))?;

        // First dispatch moves Pending onto the start step.
        if instance.status == InstanceStatus::Pending {
            let start = definition.start_step().ok_or_else(|| {
                EngineError::DefinitionNotExecutable(format!(
                    "definition {} v{} has no unique start step",
                    definition.id, definition.version
                ))
            })?;
            instance.transition_to(InstanceStatus::Running);
            instance.current_step_key = Some(start.step_key.clone());
            instance.attempt = 1;
            self.commit(&mut instance).await?;
            self.events
                .append(
                    WorkflowEvent::new(instance.id, EventType::StepEntered)
                        .with_step(&start.step_key)
                        .with_correlation(job.correlation_id),
                )
                .await?;
        }

        let step_key = job
            .step_key
            .clone()
            .or_else(|| instance.current_step_key.clone())
            .ok_or_else(|| {
                EngineError::Internal(format!("instance {} has no current step", instance.id))
            })?;
        let step = definition.get_step(&step_key).ok_or_else(|| {
            EngineError::Internal(format!(
                "instance {} references unknown step '{}'",
                instance.id, step_key
            ))
        })?;

        // A resume job does not re-execute the delay; it advances past it.
        if job.job_type == JobType::ResumeDelayed && step.step_type == StepType::Delay {
            let next = step.default_next().ok_or_else(|| {
                EngineError::StepExecution(format!(
                    "delay step '{}' has no default transition",
                    step.step_key
                ))
            })?;
            self.append_step_completed(&instance, step, job, 0).await?;
            return self
                .apply_result(instance, step, job, StepExecutionResult::advance(next))
                .await;
        }

        let attempt = if job.step_key.is_some() {
            job.attempt
        } else {
            instance.attempt
        };
        let ctx = StepExecutionContext {
            instance: &instance,
            definition: &definition,
            step,
            variables: &instance.variables,
            attempt,
            correlation_id: job.correlation_id,
            cancellation: self.cancellation.clone(),
        };

        let executor = self.registry.get(step.step_type)?;
        let started = std::time::Instant::now();
        match executor.execute(&ctx).await {
            Ok(result) => {
                // A step parked on a task or a timer has not completed yet;
                // StepCompleted is logged when the task completes or the
                // resume job fires.
                if result.task.is_none() && result.resume_at.is_none() {
                    let duration_ms = started.elapsed().as_millis() as i64;
                    self.append_step_completed(&instance, step, job, duration_ms)
                        .await?;
                }
                self.apply_result(instance, step, job, result).await
            }
            Err(e) => self.handle_step_failure(instance, step, job, attempt, e).await,
        }
    }

    async fn append_step_completed(
        &self,
        instance: &WorkflowInstance,
        step: &WorkflowStep,
        job: &WorkflowJob,
        duration_ms: i64,
    ) -> EngineResult<()> {
        self.events
            .append(
                WorkflowEvent::new(instance.id, EventType::StepCompleted)
                    .with_step(&step.step_key)
                    .with_duration_ms(duration_ms)
                    .with_correlation(job.correlation_id),
            )
            .await
    }

    /// Persist an executor's result and enqueue whatever comes next.
    async fn apply_result(
        &self,
        mut instance: WorkflowInstance,
        step: &WorkflowStep,
        job: &WorkflowJob,
        result: StepExecutionResult,
    ) -> EngineResult<JobOutcome> {
        instance.merge_variables(&result.output_variables);

        // Resolve the child definition before committing so a missing one
        // fails the step instead of half-applying.
        let mut pending_child: Option<(WorkflowDefinition, WorkflowInstance)> = None;
        if let Some(child) = &result.child_workflow {
            let child_definition = self
                .definitions
                .latest_published(child.definition_id)
                .await?
                .ok_or_else(|| {
                    EngineError::StepExecution(format!(
                        "sub-workflow definition {} has no published version",
                        child.definition_id
                    ))
                })?;
            let mut child_instance =
                WorkflowInstance::new(child_definition.id, child_definition.version);
            child_instance.variables = child.initial_variables.clone();
            child_instance.priority = child_definition.priority;
            child_instance.parent_instance_id = Some(instance.id);
            child_instance.entity_type = instance.entity_type.clone();
            child_instance.entity_id = instance.entity_id.clone();
            if let Some(var) = &child.output_variable {
                instance
                    .variables
                    .insert(var.clone(), json!(child_instance.id.to_string()));
            }
            pending_child = Some((child_definition, child_instance));
        }

        if let Some(task_spec) = result.task {
            // Park for human input.
            instance.transition_to(InstanceStatus::WaitingForTask);
            self.commit(&mut instance).await?;

            let mut task = WorkflowTask::new(
                instance.id,
                &step.step_key,
                &task_spec.title,
                task_spec.assignment,
            );
            task.instructions = task_spec.instructions;
            task.due_at = task_spec.due_at;
            task.form_schema = task_spec.form_schema;
            task.priority = instance.priority;

            let created = self.tasks.insert_open(task.clone()).await?;
            if created {
                self.events
                    .append(
                        WorkflowEvent::new(instance.id, EventType::TaskCreated)
                            .with_step(&step.step_key)
                            .with_message(task.title.clone())
                            .with_correlation(job.correlation_id),
                    )
                    .await?;
                self.notifier.task_created(&task).await;
            }
            return Ok(JobOutcome::Done(Some(json!({"task_created": created}))));
        }

        if let Some(resume_at) = result.resume_at {
            // Park on the delay step until the resume job fires.
            self.commit(&mut instance).await?;
            let mut resume = WorkflowJob::new(instance.id, JobType::ResumeDelayed)
                .with_priority(instance.priority)
                .scheduled_at(resume_at);
            resume.step_key = job.step_key.clone().or_else(|| Some(step.step_key.clone()));
            self.jobs.enqueue(resume).await?;
            return Ok(JobOutcome::Done(Some(
                json!({"resume_at": resume_at.to_rfc3339()}),
            )));
        }

        let mut followup_jobs: Vec<WorkflowJob> = Vec::new();
        let mut followup_events: Vec<WorkflowEvent> = Vec::new();

        if !result.fan_out.is_empty() {
            for branch in &result.fan_out {
                followup_jobs.push(
                    WorkflowJob::new(instance.id, JobType::ProcessStep)
                        .with_step(branch)
                        .with_priority(instance.priority),
                );
                followup_events.push(
                    WorkflowEvent::new(instance.id, EventType::StepEntered)
                        .with_step(branch)
                        .with_correlation(job.correlation_id),
                );
            }
        } else if result.complete {
            instance.transition_to(InstanceStatus::Completed);
            let mut event = WorkflowEvent::new(instance.id, EventType::Completed)
                .with_correlation(job.correlation_id);
            if let Some(outcome) = &result.outcome {
                event = event.with_message(outcome.clone());
            }
            followup_events.push(event);
        } else if let Some(next) = &result.next_step_key {
            match self.register_join_arrival(&mut instance, next) {
                JoinArrival::NotAJoin => {
                    if job.step_key.is_some() {
                        // Branch context: chain via embedded step keys,
                        // leaving the instance's own cursor alone.
                        followup_jobs.push(
                            WorkflowJob::new(instance.id, JobType::ProcessStep)
                                .with_step(next)
                                .with_priority(instance.priority),
                        );
                    } else {
                        instance.current_step_key = Some(next.clone());
                        instance.attempt = 1;
                        followup_jobs.push(
                            WorkflowJob::new(instance.id, JobType::ProcessStep)
                                .with_priority(instance.priority),
                        );
                    }
                    followup_events.push(
                        WorkflowEvent::new(instance.id, EventType::StepEntered)
                            .with_step(next)
                            .with_correlation(job.correlation_id),
                    );
                }
                JoinArrival::Waiting => {
                    // Branch ends here; the last arrival dispatches the join.
                }
                JoinArrival::Ready => {
                    instance.current_step_key = Some(next.clone());
                    instance.attempt = 1;
                    followup_jobs.push(
                        WorkflowJob::new(instance.id, JobType::ProcessStep)
                            .with_priority(instance.priority),
                    );
                    followup_events.push(
                        WorkflowEvent::new(instance.id, EventType::StepEntered)
                            .with_step(next)
                            .with_correlation(job.correlation_id),
                    );
                }
            }
        }

        self.commit(&mut instance).await?;

        if let Some((child_definition, child_instance)) = pending_child {
            if let Err(e) = self
                .start_child_instance(child_definition, child_instance)
                .await
            {
                tracing::warn!(
                    parent_instance_id = %instance.id,
                    error = %e,
                    "child workflow failed to start"
                );
            }
        }
        for event in followup_events {
            self.events.append(event).await?;
        }
        for followup in followup_jobs {
            self.jobs.enqueue(followup).await?;
        }

        if instance.status == InstanceStatus::Completed {
            self.notifier.instance_finished(&instance).await;
        }
        Ok(JobOutcome::Done(None))
    }

    async fn start_child_instance(
        &self,
        definition: WorkflowDefinition,
        instance: WorkflowInstance,
    ) -> EngineResult<()> {
        self.instances.insert(instance.clone()).await?;
        self.events
            .append(
                WorkflowEvent::new(instance.id, EventType::Started)
                    .with_message(format!("{} v{}", definition.name, definition.version)),
            )
            .await?;
        self.jobs
            .enqueue(
                WorkflowJob::new(instance.id, JobType::ProcessStep)
                    .with_priority(instance.priority),
            )
            .await?;
        Ok(())
    }

    async fn handle_step_failure(
        &self,
        mut instance: WorkflowInstance,
        step: &WorkflowStep,
        job: &WorkflowJob,
        attempt: u32,
        error: EngineError,
    ) -> EngineResult<JobOutcome> {
        self.events
            .append(
                WorkflowEvent::new(instance.id, EventType::StepFailed)
                    .with_step(&step.step_key)
                    .with_error(error.to_string())
                    .with_details(json!({"attempt": attempt}))
                    .with_correlation(job.correlation_id),
            )
            .await?;

        if step.retry.should_retry(attempt) {
            let delay = step.retry.delay_for_attempt(attempt);
            let retry_at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);

            if job.step_key.is_none() {
                instance.attempt = attempt + 1;
                self.commit(&mut instance).await?;
            }

            tracing::info!(
                instance_id = %instance.id,
                step_key = %step.step_key,
                attempt,
                retry_in_secs = delay.as_secs(),
                "step failed, retry scheduled"
            );
            // Re-queue the same job; for branch jobs its attempt counter
            // carries the retry state.
            self.jobs
                .fail(job.id, &error.to_string(), Some(retry_at))
                .await?;
            return Ok(JobOutcome::Requeued);
        }

        instance.error_message = Some(error.to_string());
        instance.transition_to(InstanceStatus::Failed);
        self.commit(&mut instance).await?;

        tracing::warn!(
            instance_id = %instance.id,
            step_key = %step.step_key,
            attempt,
            error = %error,
            "step exhausted retries, instance failed"
        );
        self.notifier.instance_finished(&instance).await;
        Ok(JobOutcome::Done(Some(json!({"failed": true}))))
    }

    /// Record a branch arrival when `next` is a registered join step.
    fn register_join_arrival(&self, instance: &mut WorkflowInstance, next: &str) -> JoinArrival {
        let counter_key = instance.variables.iter().find_map(|(k, v)| {
            (k.starts_with(JOIN_PREFIX)
                && v.get("join_step").and_then(Value::as_str) == Some(next))
            .then(|| k.clone())
        });
        let Some(counter_key) = counter_key else {
            return JoinArrival::NotAJoin;
        };

        let Some(counter) = instance.variables.get_mut(&counter_key) else {
            return JoinArrival::NotAJoin;
        };
        let arrived = counter.get("arrived").and_then(Value::as_u64).unwrap_or(0) + 1;
        let required = counter.get("required").and_then(Value::as_u64).unwrap_or(1);

        if arrived >= required {
            instance.variables.remove(&counter_key);
            JoinArrival::Ready
        } else {
            counter["arrived"] = json!(arrived);
            JoinArrival::Waiting
        }
    }

    // ---- maintenance ----

    /// Reset jobs held past the lease timeout. Called by the maintenance
    /// loop.
    pub async fn recover_stuck_jobs(&self, timeout: std::time::Duration) -> EngineResult<u64> {
        let recovered = self.jobs.recover_stuck(timeout).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "recovered stuck jobs");
        }
        Ok(recovered)
    }

    /// Purge old finished jobs. Events and instances are retained.
    pub async fn cleanup_finished_jobs(
        &self,
        older_than: std::time::Duration,
    ) -> EngineResult<u64> {
        let purged = self.jobs.cleanup_finished(older_than).await?;
        if purged > 0 {
            tracing::debug!(purged, "purged finished jobs");
        }
        Ok(purged)
    }

    // ---- helpers ----

    async fn load_instance(&self, instance_id: Uuid) -> EngineResult<WorkflowInstance> {
        self.instances
            .get(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }

    async fn load_task(&self, task_id: Uuid) -> EngineResult<WorkflowTask> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// CAS write; bumps the local version token on success so later writes
    /// in the same operation stay consistent.
    async fn commit(&self, instance: &mut WorkflowInstance) -> EngineResult<()> {
        let expected = instance.version;
        if self.instances.try_update_with_lock(instance, expected).await? {
            instance.version = expected + 1;
            Ok(())
        } else {
            Err(EngineError::ConcurrencyConflict(format!(
                "instance {} was modified concurrently",
                instance.id
            )))
        }
    }
}

/// Registry with every built-in executor.
pub fn default_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    let executors: Vec<Arc<dyn crate::executor::StepExecutor>> = vec![
        Arc::new(UserActionExecutor::new()),
        Arc::new(AutomatedExecutor::new()),
        Arc::new(DelayExecutor::new()),
        Arc::new(ConditionExecutor::new()),
        Arc::new(ParallelExecutor::new()),
        Arc::new(ApiCallExecutor::new()),
        Arc::new(SubWorkflowExecutor::new()),
        Arc::new(EndExecutor::new()),
    ];
    for executor in executors {
        // Distinct step types by construction.
        let registered = registry.register(executor);
        debug_assert!(registered.is_ok(), "built-in step types collide");
    }
    registry
}
