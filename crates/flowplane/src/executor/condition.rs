//! Condition step executor.
//!
//! Evaluates the configured boolean expression against the variable bag and
//! follows the "true" or "false" transition.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::model::{StepConfig, StepType};
use crate::template::ExpressionEvaluator;

use super::{StepExecutionContext, StepExecutionResult, StepExecutor};

pub struct ConditionExecutor {
    evaluator: Arc<ExpressionEvaluator>,
}

impl ConditionExecutor {
    pub fn new() -> Self {
        Self {
            evaluator: Arc::new(ExpressionEvaluator::new()),
        }
    }

    pub fn with_evaluator(evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl Default for ConditionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ConditionExecutor {
    fn step_type(&self) -> StepType {
        StepType::Condition
    }

    async fn execute(
        &self,
        ctx: &StepExecutionContext<'_>,
    ) -> EngineResult<StepExecutionResult> {
        let StepConfig::Condition(config) = StepConfig::decode(ctx.step.step_type, &ctx.step.config)?
        else {
            return Err(EngineError::Internal("condition config decode mismatch".into()));
        };

        let outcome = self
            .evaluator
            .evaluate_condition(&config.expression, ctx.variables)?;
        let label = if outcome { "true" } else { "false" };

        tracing::debug!(
            instance_id = %ctx.instance.id,
            step_key = %ctx.step.step_key,
            expression = %config.expression,
            outcome,
            "condition evaluated"
        );

        let next = ctx.step.next_for(label).ok_or_else(|| {
            EngineError::StepExecution(format!(
                "condition step '{}' has no '{}' transition",
                ctx.step.step_key, label
            ))
        })?;
        Ok(StepExecutionResult::advance(next))
    }
}
