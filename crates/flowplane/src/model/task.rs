//! Human work items.
//!
//! A task blocks its owning instance until an external actor completes it.
//! At most one open (Pending or Claimed) task may exist per
//! (instance, step_key); the task repository enforces this atomically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::definition::Priority;

/// Who a task is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    User,
    Group,
    Role,
}

/// Task assignment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub kind: AssignmentKind,
    /// User id, group id, or role name depending on `kind`.
    pub target: String,
}

impl TaskAssignment {
    pub fn user(id: &str) -> Self {
        Self {
            kind: AssignmentKind::User,
            target: id.to_string(),
        }
    }

    pub fn group(id: &str) -> Self {
        Self {
            kind: AssignmentKind::Group,
            target: id.to_string(),
        }
    }

    pub fn role(name: &str) -> Self {
        Self {
            kind: AssignmentKind::Role,
            target: name.to_string(),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Open tasks block their instance.
    pub fn is_open(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Claimed)
    }
}

/// A human work item blocking an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_key: String,

    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    pub status: TaskStatus,
    pub assignment: TaskAssignment,
    pub priority: Priority,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Action label the completing actor chose; selects the outgoing
    /// transition of the user-action step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_data: Option<Value>,

    pub created_at: DateTime<Utc>,
}

impl WorkflowTask {
    /// Create a pending task for an instance step.
    pub fn new(instance_id: Uuid, step_key: &str, title: &str, assignment: TaskAssignment) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            step_key: step_key.to_string(),
            title: title.to_string(),
            instructions: None,
            status: TaskStatus::Pending,
            assignment,
            priority: Priority::Normal,
            due_at: None,
            claimed_by: None,
            claimed_at: None,
            completed_at: None,
            action_taken: None,
            comments: None,
            form_schema: None,
            form_data: None,
            created_at: Utc::now(),
        }
    }

    /// Claim the task for a user. Fails if not Pending.
    pub fn claim(&mut self, user_id: &str) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Claimed;
        self.claimed_by = Some(user_id.to_string());
        self.claimed_at = Some(Utc::now());
        true
    }

    /// Complete the task with an action. Fails if not open.
    pub fn complete(&mut self, action: &str, comments: Option<String>, form_data: Option<Value>) -> bool {
        if !self.status.is_open() {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.action_taken = Some(action.to_string());
        self.comments = comments;
        self.form_data = form_data;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Cancel an open task.
    pub fn cancel(&mut self) -> bool {
        if !self.status.is_open() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        true
    }
}
