//! Data model for the workflow engine.
//!
//! Definitions are versioned templates, instances are running executions,
//! tasks are human work items, events form the append-only audit trail, and
//! jobs are the durable units of asynchronous engine work.

pub mod definition;
pub mod event;
pub mod instance;
pub mod job;
pub mod step_config;
pub mod task;
pub mod validate;

pub use definition::{
    DefinitionStatus, Priority, RetrySpec, StepType, TriggerConfig, TriggerType,
    WorkflowDefinition, WorkflowStep,
};
pub use event::{Actor, ActorKind, EventType, Severity, WorkflowEvent};
pub use instance::{InstanceStatus, WorkflowInstance};
pub use job::{JobStatus, JobType, WorkflowJob};
pub use step_config::{
    ApiCallConfig, AutomatedConfig, ConditionConfig, DelayConfig, JoinPolicy, ParallelConfig,
    StepConfig, SubWorkflowConfig, UserActionConfig,
};
pub use task::{AssignmentKind, TaskAssignment, TaskStatus, WorkflowTask};
pub use validate::{DefinitionValidator, ValidationReport};
