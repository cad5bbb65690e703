//! Append-only audit events.
//!
//! Events are never updated or deleted after insertion. Ordering by
//! (instance_id, created_at, sequence) reconstructs full instance history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    StepEntered,
    StepCompleted,
    StepFailed,
    TaskCreated,
    TaskCompleted,
    TaskReassigned,
    Paused,
    Resumed,
    Cancelled,
    Completed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Started => "started",
            EventType::StepEntered => "step_entered",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::TaskCreated => "task_created",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskReassigned => "task_reassigned",
            EventType::Paused => "paused",
            EventType::Resumed => "resumed",
            EventType::Cancelled => "cancelled",
            EventType::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Who caused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    System,
    User,
}

/// Event actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            kind: ActorKind::System,
            id: None,
        }
    }

    pub fn user(id: &str) -> Self {
        Self {
            kind: ActorKind::User,
            id: Some(id.to_string()),
        }
    }

    /// System actor unless a user id is present.
    pub fn from_user_id(user_id: Option<&str>) -> Self {
        match user_id {
            Some(id) => Self::user(id),
            None => Self::system(),
        }
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

/// One append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub event_type: EventType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,

    pub actor: Actor,
    pub severity: Severity,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    /// Correlates all events produced while processing one job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

impl WorkflowEvent {
    /// New system event.
    pub fn new(instance_id: Uuid, event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            event_type,
            step_key: None,
            actor: Actor::system(),
            severity: Severity::Info,
            message: None,
            duration_ms: None,
            error: None,
            details: None,
            correlation_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_key: &str) -> Self {
        self.step_key = Some(step_key.to_string());
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.severity = Severity::Error;
        self.error = Some(error.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let instance_id = Uuid::new_v4();
        let event = WorkflowEvent::new(instance_id, EventType::StepFailed)
            .with_step("charge")
            .with_error("timeout")
            .with_duration_ms(1500);

        assert_eq!(event.instance_id, instance_id);
        assert_eq!(event.step_key.as_deref(), Some("charge"));
        assert_eq!(event.severity, Severity::Error);
        assert_eq!(event.duration_ms, Some(1500));
    }

    #[test]
    fn test_actor_from_user_id() {
        assert_eq!(Actor::from_user_id(None), Actor::system());
        assert_eq!(Actor::from_user_id(Some("u1")), Actor::user("u1"));
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::new(Uuid::new_v4(), EventType::Started);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("started"));
        assert!(json.contains("system"));
    }
}
