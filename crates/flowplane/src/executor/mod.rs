//! Step executors.
//!
//! Each step type maps to one [`StepExecutor`]. Executors are pure with
//! respect to engine state: they read a snapshot of the instance and its
//! variables and report what should happen next through a
//! [`StepExecutionResult`]. The engine alone persists, so an executor can be
//! retried safely after a crash or a lost optimistic-lock race.

pub mod api_call;
pub mod automated;
pub mod condition;
pub mod delay;
pub mod end;
pub mod parallel;
pub mod registry;
pub mod sub_workflow;
pub mod user_action;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::model::{
    StepConfig, StepType, TaskAssignment, ValidationReport, WorkflowDefinition, WorkflowInstance,
    WorkflowStep,
};

pub use api_call::ApiCallExecutor;
pub use automated::AutomatedExecutor;
pub use condition::ConditionExecutor;
pub use delay::DelayExecutor;
pub use end::EndExecutor;
pub use parallel::ParallelExecutor;
pub use registry::ExecutorRegistry;
pub use sub_workflow::SubWorkflowExecutor;
pub use user_action::UserActionExecutor;

/// Snapshot handed to an executor for one step attempt.
pub struct StepExecutionContext<'a> {
    pub instance: &'a WorkflowInstance,
    pub definition: &'a WorkflowDefinition,
    pub step: &'a WorkflowStep,
    /// Variable bag snapshot at dispatch time.
    pub variables: &'a Map<String, Value>,
    /// Execution attempt for this step (1-based).
    pub attempt: u32,
    pub correlation_id: Uuid,
    /// Cooperative cancellation, flipped on engine shutdown.
    pub cancellation: CancellationToken,
}

/// A human task an executor wants created.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub instructions: Option<String>,
    pub assignment: TaskAssignment,
    pub due_at: Option<DateTime<Utc>>,
    pub form_schema: Option<Value>,
}

/// A child workflow an executor wants started.
#[derive(Debug, Clone)]
pub struct ChildWorkflowSpec {
    pub definition_id: Uuid,
    pub initial_variables: Map<String, Value>,
    /// Parent variable receiving the child instance id.
    pub output_variable: Option<String>,
}

/// What the engine should do after a step attempt.
///
/// Exactly one continuation applies, checked in this order: task creation,
/// scheduled resume, child workflow, fan-out, single next step, instance
/// completion.
#[derive(Debug, Clone, Default)]
pub struct StepExecutionResult {
    /// Variable delta to merge into the instance bag.
    pub output_variables: Map<String, Value>,

    /// Create this task and park the instance in WaitingForTask.
    pub task: Option<TaskSpec>,

    /// Park the instance and enqueue a resume job for this time.
    pub resume_at: Option<DateTime<Utc>>,

    /// Start a child instance before continuing.
    pub child_workflow: Option<ChildWorkflowSpec>,

    /// Fan out: one job per key, instance stays Running.
    pub fan_out: Vec<String>,

    /// Advance to this step.
    pub next_step_key: Option<String>,

    /// Complete the instance, with an optional outcome label.
    pub complete: bool,
    pub outcome: Option<String>,
}

impl StepExecutionResult {
    /// Advance along a single transition.
    pub fn advance(next_step_key: impl Into<String>) -> Self {
        Self {
            next_step_key: Some(next_step_key.into()),
            ..Default::default()
        }
    }

    /// Complete the instance.
    pub fn finished(outcome: Option<String>) -> Self {
        Self {
            complete: true,
            outcome,
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.output_variables = variables;
        self
    }
}

/// One step type's execution strategy.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Step type this executor handles.
    fn step_type(&self) -> StepType;

    /// Execute one attempt of the step.
    ///
    /// Business failures (bad config at runtime, HTTP errors, unresolvable
    /// transitions) return `Err`; the engine routes them into the step's
    /// retry policy.
    async fn execute(&self, ctx: &StepExecutionContext<'_>)
        -> EngineResult<StepExecutionResult>;

    /// Validate a step's configuration blob at publish time.
    ///
    /// The default decodes the typed config; executors override to add
    /// checks beyond the shape.
    fn validate_config(&self, step: &WorkflowStep) -> ValidationReport {
        let mut report = ValidationReport::default();
        if let Err(e) = StepConfig::decode(self.step_type(), &step.config) {
            report.errors.push(format!("step '{}': {}", step.step_key, e));
        }
        report.is_valid = report.errors.is_empty();
        report
    }
}
