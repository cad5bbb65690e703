//! User-action step executor.
//!
//! Produces a [`TaskSpec`]; the engine creates the task (subject to the
//! one-open-task invariant) and parks the instance in WaitingForTask until
//! an actor completes it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{EngineError, EngineResult};
use crate::model::{StepConfig, StepType};
use crate::template::ExpressionEvaluator;

use super::{StepExecutionContext, StepExecutionResult, StepExecutor, TaskSpec};

pub struct UserActionExecutor {
    evaluator: Arc<ExpressionEvaluator>,
}

impl UserActionExecutor {
    pub fn new() -> Self {
        Self {
            evaluator: Arc::new(ExpressionEvaluator::new()),
        }
    }

    pub fn with_evaluator(evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl Default for UserActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for UserActionExecutor {
    fn step_type(&self) -> StepType {
        StepType::UserAction
    }

    async fn execute(
        &self,
        ctx: &StepExecutionContext<'_>,
    ) -> EngineResult<StepExecutionResult> {
        let StepConfig::UserAction(config) =
            StepConfig::decode(ctx.step.step_type, &ctx.step.config)?
        else {
            return Err(EngineError::Internal("user_action config decode mismatch".into()));
        };

        let title = self.evaluator.render(&config.title, ctx.variables)?;
        let instructions = match &config.instructions {
            Some(text) => Some(self.evaluator.render(text, ctx.variables)?),
            None => None,
        };
        let due_at = config
            .due_in_minutes
            .map(|minutes| Utc::now() + chrono::Duration::minutes(minutes));

        tracing::info!(
            instance_id = %ctx.instance.id,
            step_key = %ctx.step.step_key,
            title = %title,
            "creating user task"
        );

        Ok(StepExecutionResult {
            task: Some(TaskSpec {
                title,
                instructions,
                assignment: config.assignment,
                due_at,
                form_schema: config.form_schema,
            }),
            ..Default::default()
        })
    }
}
