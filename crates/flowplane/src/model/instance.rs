//! Workflow instance state machine.
//!
//! An instance is one execution of a definition bound to a business entity.
//! Status transitions are guarded by [`InstanceStatus::can_transition_to`];
//! the engine rejects anything else with `InstanceNotRunnable`. The `version`
//! field is the optimistic-concurrency token: every write goes through a
//! compare-and-swap in the instance repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::definition::Priority;

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, first step not yet dispatched.
    Pending,
    /// Actively advancing via jobs.
    Running,
    /// Blocked on an open human task.
    WaitingForTask,
    /// Paused by a user; resumable.
    Suspended,
    /// A step exhausted its retry policy.
    Failed,
    /// Terminal success.
    Completed,
    /// Terminal, explicitly cancelled.
    Cancelled,
}

impl InstanceStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Cancelled)
    }

    /// Guard for the instance state machine.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            // Terminal states are final.
            (Completed | Cancelled, _) => false,
            // Any non-terminal state can be cancelled.
            (_, Cancelled) => true,
            (Pending, Running) => true,
            (Running, WaitingForTask | Suspended | Failed | Completed) => true,
            (WaitingForTask, Running | Suspended) => true,
            (Suspended, Running) => true,
            // Retry re-enters the failed step.
            (Failed, Running) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::WaitingForTask => write!(f, "waiting_for_task"),
            Self::Suspended => write!(f, "suspended"),
            Self::Failed => write!(f, "failed"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One running execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,

    /// Pinned definition id + version.
    pub definition_id: Uuid,
    pub definition_version: u32,

    /// Business entity binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_reference: Option<String>,

    pub status: InstanceStatus,

    /// Current step; None only while Pending or after reaching a terminal
    /// state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_key: Option<String>,

    /// Attempt counter for the current step (1-based). Preserved across a
    /// retry of a failed instance.
    pub attempt: u32,

    pub priority: Priority,

    /// Variable bag. Mutated only by the engine applying executor output
    /// deltas.
    #[serde(default)]
    pub variables: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,

    /// Parent instance for sub-workflows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<Uuid>,

    /// Optimistic concurrency token, bumped on every successful write.
    pub version: u64,
}

impl WorkflowInstance {
    /// Create a pending instance pinned to a definition version.
    pub fn new(definition_id: Uuid, definition_version: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_id,
            definition_version,
            entity_type: None,
            entity_id: None,
            entity_reference: None,
            status: InstanceStatus::Pending,
            current_step_key: None,
            attempt: 1,
            priority: Priority::Normal,
            variables: Map::new(),
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            due_at: None,
            started_by: None,
            parent_instance_id: None,
            version: 0,
        }
    }

    /// Merge an output-variable delta into the bag (shallow, by key).
    pub fn merge_variables(&mut self, delta: &Map<String, Value>) {
        for (k, v) in delta {
            self.variables.insert(k.clone(), v.clone());
        }
    }

    /// Guarded status transition.
    pub fn transition_to(&mut self, next: InstanceStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.current_step_key = None;
        }
        true
    }
}
