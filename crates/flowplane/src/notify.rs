//! Outbound notifications.
//!
//! Fire-and-forget: a notifier failure is logged and never fails the engine
//! operation that produced it. The default [`LogNotifier`] writes structured
//! log lines; hosts plug in email or chat delivery behind the same trait.

use async_trait::async_trait;

use crate::model::{WorkflowInstance, WorkflowTask};

/// Notification sink for task and instance milestones.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A new task was created for an assignee.
    async fn task_created(&self, task: &WorkflowTask);

    /// A task was reassigned.
    async fn task_reassigned(&self, task: &WorkflowTask, previous_target: &str);

    /// An instance reached a terminal or failed state.
    async fn instance_finished(&self, instance: &WorkflowInstance);
}

/// Notifier that logs instead of delivering.
#[derive(Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn task_created(&self, task: &WorkflowTask) {
        tracing::info!(
            task_id = %task.id,
            instance_id = %task.instance_id,
            assignee = %task.assignment.target,
            title = %task.title,
            "task created"
        );
    }

    async fn task_reassigned(&self, task: &WorkflowTask, previous_target: &str) {
        tracing::info!(
            task_id = %task.id,
            from = %previous_target,
            to = %task.assignment.target,
            "task reassigned"
        );
    }

    async fn instance_finished(&self, instance: &WorkflowInstance) {
        tracing::info!(
            instance_id = %instance.id,
            status = %instance.status,
            "instance finished"
        );
    }
}
