//! Engine request and response shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::{
    Priority, TaskAssignment, WorkflowEvent, WorkflowInstance, WorkflowStep, WorkflowTask,
};

/// Request to start a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    pub definition_id: Uuid,

    /// Pin a specific version; defaults to the latest published one.
    #[serde(default)]
    pub definition_version: Option<u32>,

    /// Business entity binding.
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub entity_reference: Option<String>,

    /// Initial variable bag.
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Overrides the definition's priority.
    #[serde(default)]
    pub priority: Option<Priority>,

    #[serde(default)]
    pub started_by: Option<String>,

    /// Set when started as a sub-workflow.
    #[serde(default)]
    pub parent_instance_id: Option<Uuid>,
}

impl StartWorkflowRequest {
    pub fn new(definition_id: Uuid) -> Self {
        Self {
            definition_id,
            definition_version: None,
            entity_type: None,
            entity_id: None,
            entity_reference: None,
            variables: Map::new(),
            priority: None,
            started_by: None,
            parent_instance_id: None,
        }
    }

    pub fn with_entity(mut self, entity_type: &str, entity_id: &str) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn started_by(mut self, user_id: &str) -> Self {
        self.started_by = Some(user_id.to_string());
        self
    }
}

/// Request to complete a human task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTaskRequest {
    /// Action label; selects the user-action step's outgoing transition.
    pub action: String,
    pub user_id: String,
    #[serde(default)]
    pub comments: Option<String>,
    /// Form payload; object payloads are merged into the variable bag.
    #[serde(default)]
    pub form_data: Option<Value>,
}

/// Request to reassign an open task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignTaskRequest {
    pub assignment: TaskAssignment,
    /// Who performed the reassignment.
    pub user_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Step completion progress for an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceProgress {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub percent: u8,
}

/// Full instance view: state, steps, open tasks, audit trail, progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDetail {
    pub instance: WorkflowInstance,
    pub definition_name: String,
    pub definition_version: u32,
    /// Steps of the pinned definition version.
    pub steps: Vec<WorkflowStep>,
    pub open_tasks: Vec<WorkflowTask>,
    pub events: Vec<WorkflowEvent>,
    pub progress: InstanceProgress,
}
