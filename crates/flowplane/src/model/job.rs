//! Durable job queue rows.
//!
//! A job is a unit of scheduled engine work driving one instance's
//! advancement. Workers lease Pending jobs whose `scheduled_for` has passed;
//! a job leased longer than the recovery timeout without completion is
//! presumed orphaned by a dead worker and reset to Pending by the stuck-job
//! sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::definition::Priority;

/// What kind of work the job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Execute the instance's current step (or the embedded branch step).
    ProcessStep,
    /// A delay step's wall-clock wait elapsed; advance past it.
    ResumeDelayed,
    /// Re-execute a step after a backoff wait.
    Retry,
}

/// Job queue status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Completed,
    Failed,
}

/// One queued unit of asynchronous engine work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub job_type: JobType,

    /// Branch step to process. None means the instance's current step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,

    pub status: JobStatus,
    pub priority: Priority,

    /// Not dispatchable before this time.
    pub scheduled_for: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub leased_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leased_at: Option<DateTime<Utc>>,

    /// Queue-level delivery attempt (1-based).
    pub attempt: u32,

    pub correlation_id: Uuid,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowJob {
    /// New immediately-dispatchable job.
    pub fn new(instance_id: Uuid, job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            job_type,
            step_key: None,
            status: JobStatus::Pending,
            priority: Priority::Normal,
            scheduled_for: Utc::now(),
            leased_by: None,
            leased_at: None,
            attempt: 1,
            correlation_id: Uuid::new_v4(),
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn with_step(mut self, step_key: &str) -> Self {
        self.step_key = Some(step_key.to_string());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }

    /// Whether the job is dispatchable at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }

    /// Whether a leased job has exceeded the recovery timeout.
    pub fn is_stuck(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        if self.status != JobStatus::Leased {
            return false;
        }
        match self.leased_at {
            Some(leased_at) => {
                now.signed_duration_since(leased_at).num_seconds() >= timeout.as_secs() as i64
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_is_due() {
        let job = WorkflowJob::new(Uuid::new_v4(), JobType::ProcessStep);
        assert!(job.is_due(Utc::now()));

        let later = WorkflowJob::new(Uuid::new_v4(), JobType::ResumeDelayed)
            .scheduled_at(Utc::now() + chrono::Duration::minutes(5));
        assert!(!later.is_due(Utc::now()));
    }

    #[test]
    fn test_is_stuck() {
        let mut job = WorkflowJob::new(Uuid::new_v4(), JobType::ProcessStep);
        assert!(!job.is_stuck(Utc::now(), Duration::from_secs(60)));

        job.status = JobStatus::Leased;
        job.leased_by = Some("w1".to_string());
        job.leased_at = Some(Utc::now() - chrono::Duration::minutes(5));
        assert!(job.is_stuck(Utc::now(), Duration::from_secs(60)));
        assert!(!job.is_stuck(Utc::now(), Duration::from_secs(600)));
    }
}
