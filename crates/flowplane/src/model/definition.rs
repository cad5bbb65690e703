//! Workflow definition types.
//!
//! A definition is a versioned template: ordered steps, a transition map per
//! step, and trigger configuration. Once published, the step list and
//! transitions are frozen; edits create a new draft version. Running
//! instances keep referencing the version they started with.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered priority shared by definitions, instances, tasks, and jobs.
///
/// Higher variants win when jobs scheduled for the same time compete for a
/// worker.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Definition lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    /// Mutable working copy.
    Draft,
    /// Frozen and executable.
    Published,
    /// Retired; no new instances, existing ones keep running.
    Deprecated,
}

/// How a definition gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Started by an explicit API call.
    Manual,
    /// Started when a matching business-entity event arrives.
    EntityEvent,
    /// Started by an external scheduler tick (cron expression stored here,
    /// firing is the host's concern).
    Scheduled,
}

/// Trigger configuration for a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub trigger_type: TriggerType,

    /// Entity type filter for entity-event triggers (e.g. "opportunity").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Entity event filter (e.g. "created", "stage_changed").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_event: Option<String>,

    /// Cron expression for scheduled triggers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

impl TriggerConfig {
    /// Manual trigger shorthand.
    pub fn manual() -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            entity_type: None,
            entity_event: None,
            cron: None,
        }
    }

    /// Entity-event trigger shorthand.
    pub fn entity_event(entity_type: &str, event: &str) -> Self {
        Self {
            trigger_type: TriggerType::EntityEvent,
            entity_type: Some(entity_type.to_string()),
            entity_event: Some(event.to_string()),
            cron: None,
        }
    }

    /// Whether this trigger matches an incoming entity event.
    pub fn matches(&self, entity_type: &str, event: &str) -> bool {
        self.trigger_type == TriggerType::EntityEvent
            && self.entity_type.as_deref() == Some(entity_type)
            && self.entity_event.as_deref() == Some(event)
    }
}

/// Step types the engine knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Human work item; pauses the instance until the task completes.
    UserAction,
    /// Built-in automated action (set variables, log, noop).
    Automated,
    /// Wall-clock delay; yields via a scheduled resume, never busy-waits.
    Delay,
    /// Conditional branch on an expression over the variable bag.
    Condition,
    /// Fan-out into concurrent branches converging at a join step.
    Parallel,
    /// Outbound HTTP call; failures flow into the retry path.
    ApiCall,
    /// Starts a child workflow instance.
    SubWorkflow,
    /// Terminal step; completes the instance.
    End,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepType::UserAction => "user_action",
            StepType::Automated => "automated",
            StepType::Delay => "delay",
            StepType::Condition => "condition",
            StepType::Parallel => "parallel",
            StepType::ApiCall => "api_call",
            StepType::SubWorkflow => "sub_workflow",
            StepType::End => "end",
        };
        write!(f, "{}", s)
    }
}

/// Per-step retry policy with exponential backoff.
///
/// Delay before attempt N+1 is `base_delay * 2^(N-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Maximum attempts including the first. 1 means no retries.
    pub max_attempts: u32,
    /// Base backoff delay in seconds.
    pub base_delay_secs: u64,
    /// Backoff cap in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_secs: 5,
            max_delay_secs: 300,
        }
    }
}

impl RetrySpec {
    /// Whether another attempt should be scheduled after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_secs.saturating_mul(multiplier);
        Duration::from_secs(delay.min(self.max_delay_secs))
    }
}

/// A single step within a definition.
///
/// `step_key` is the stable identifier transitions refer to; it is unique
/// within the definition and never reused across versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_key: String,

    /// Display name.
    pub name: String,

    pub step_type: StepType,

    /// Ordered position within the definition.
    pub position: u32,

    /// Type-specific configuration blob. Decoded into a typed
    /// [`StepConfig`](super::step_config::StepConfig) before use; the raw
    /// shape is never trusted at execution time.
    #[serde(default)]
    pub config: serde_json::Value,

    /// Transition map: label -> next step key. Conventional labels are
    /// "default", "true"/"false" for condition steps, and task action names
    /// for user-action steps.
    #[serde(default)]
    pub transitions: HashMap<String, String>,

    /// Step timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Retry policy for executor failures.
    #[serde(default)]
    pub retry: RetrySpec,

    #[serde(default)]
    pub is_start: bool,

    #[serde(default)]
    pub is_end: bool,
}

impl WorkflowStep {
    /// Create a minimal step with a default transition.
    pub fn new(step_key: &str, name: &str, step_type: StepType, position: u32) -> Self {
        Self {
            step_key: step_key.to_string(),
            name: name.to_string(),
            step_type,
            position,
            config: serde_json::Value::Null,
            transitions: HashMap::new(),
            timeout_secs: None,
            retry: RetrySpec::default(),
            is_start: false,
            is_end: false,
        }
    }

    /// Next step key for a transition label.
    pub fn next_for(&self, label: &str) -> Option<&str> {
        self.transitions.get(label).map(|s| s.as_str())
    }

    /// Default transition target.
    pub fn default_next(&self) -> Option<&str> {
        self.next_for("default")
    }
}

/// Versioned workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,

    pub name: String,

    /// Monotonic per definition id.
    pub version: u32,

    pub status: DefinitionStatus,

    pub trigger: TriggerConfig,

    pub priority: Priority,

    /// Ordered step list.
    pub steps: Vec<WorkflowStep>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Create a new draft definition at version 1.
    pub fn new_draft(name: &str, trigger: TriggerConfig, steps: Vec<WorkflowStep>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            version: 1,
            status: DefinitionStatus::Draft,
            trigger,
            priority: Priority::Normal,
            steps,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Get a step by key.
    pub fn get_step(&self, step_key: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_key == step_key)
    }

    /// The unique start step, if the definition has exactly one.
    pub fn start_step(&self) -> Option<&WorkflowStep> {
        let mut starts = self.steps.iter().filter(|s| s.is_start);
        let first = starts.next();
        if starts.next().is_some() {
            return None;
        }
        first
    }

    /// All step keys in definition order.
    pub fn step_keys(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step_key.as_str()).collect()
    }

    pub fn is_published(&self) -> bool {
        self.status == DefinitionStatus::Published
    }

    /// Copy this definition into a new draft at version + 1.
    ///
    /// The id is kept stable so instances pin (id, version).
    pub fn next_version_draft(&self) -> Self {
        let now = Utc::now();
        Self {
            id: self.id,
            name: self.name.clone(),
            version: self.version + 1,
            status: DefinitionStatus::Draft,
            trigger: self.trigger.clone(),
            priority: self.priority,
            steps: self.steps.clone(),
            description: self.description.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_retry_spec_backoff() {
        let spec = RetrySpec {
            max_attempts: 5,
            base_delay_secs: 2,
            max_delay_secs: 60,
        };
        assert_eq!(spec.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(spec.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(spec.delay_for_attempt(3), Duration::from_secs(8));
        // 2 * 2^9 = 1024, capped at 60
        assert_eq!(spec.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_spec_should_retry() {
        let spec = RetrySpec {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(spec.should_retry(1));
        assert!(spec.should_retry(2));
        assert!(!spec.should_retry(3));
    }

    #[test]
    fn test_trigger_matches() {
        let trigger = TriggerConfig::entity_event("opportunity", "stage_changed");
        assert!(trigger.matches("opportunity", "stage_changed"));
        assert!(!trigger.matches("opportunity", "created"));
        assert!(!TriggerConfig::manual().matches("opportunity", "stage_changed"));
    }

    #[test]
    fn test_start_step_requires_exactly_one() {
        let mut def = WorkflowDefinition::new_draft(
            "test",
            TriggerConfig::manual(),
            vec![
                WorkflowStep::new("a", "A", StepType::Automated, 0),
                WorkflowStep::new("b", "B", StepType::End, 1),
            ],
        );
        assert!(def.start_step().is_none());

        def.steps[0].is_start = true;
        assert_eq!(def.start_step().unwrap().step_key, "a");

        def.steps[1].is_start = true;
        assert!(def.start_step().is_none());
    }

    #[test]
    fn test_next_version_draft_keeps_id() {
        let def = WorkflowDefinition::new_draft("test", TriggerConfig::manual(), vec![]);
        let next = def.next_version_draft();
        assert_eq!(next.id, def.id);
        assert_eq!(next.version, 2);
        assert_eq!(next.status, DefinitionStatus::Draft);
    }
}
