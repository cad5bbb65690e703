//! End step executor.
//!
//! Completes the instance, recording the optional outcome label.

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::model::{StepConfig, StepType};

use super::{StepExecutionContext, StepExecutionResult, StepExecutor};

#[derive(Default)]
pub struct EndExecutor;

impl EndExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepExecutor for EndExecutor {
    fn step_type(&self) -> StepType {
        StepType::End
    }

    async fn execute(
        &self,
        ctx: &StepExecutionContext<'_>,
    ) -> EngineResult<StepExecutionResult> {
        let StepConfig::End(config) = StepConfig::decode(ctx.step.step_type, &ctx.step.config)?
        else {
            return Err(EngineError::Internal("end config decode mismatch".into()));
        };

        tracing::info!(
            instance_id = %ctx.instance.id,
            step_key = %ctx.step.step_key,
            outcome = config.outcome.as_deref().unwrap_or("-"),
            "workflow reached end step"
        );

        Ok(StepExecutionResult::finished(config.outcome))
    }
}
