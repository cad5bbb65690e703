//! Parallel fork step executor.
//!
//! Reports the branch keys to fan out; the engine enqueues one job per
//! branch and records the join bookkeeping in the variable bag. The join
//! itself happens in the engine when branch terminals arrive.

use async_trait::async_trait;
use serde_json::{json, Map};

use crate::error::{EngineError, EngineResult};
use crate::model::{StepConfig, StepType};

use super::{StepExecutionContext, StepExecutionResult, StepExecutor};

/// Variable-bag key prefix for join counters.
pub fn join_counter_key(fork_step_key: &str) -> String {
    format!("_join.{}", fork_step_key)
}

#[derive(Default)]
pub struct ParallelExecutor;

impl ParallelExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepExecutor for ParallelExecutor {
    fn step_type(&self) -> StepType {
        StepType::Parallel
    }

    async fn execute(
        &self,
        ctx: &StepExecutionContext<'_>,
    ) -> EngineResult<StepExecutionResult> {
        let StepConfig::Parallel(config) = StepConfig::decode(ctx.step.step_type, &ctx.step.config)?
        else {
            return Err(EngineError::Internal("parallel config decode mismatch".into()));
        };

        tracing::info!(
            instance_id = %ctx.instance.id,
            step_key = %ctx.step.step_key,
            branches = config.branches.len(),
            join_step = %config.join_step,
            "fanning out parallel branches"
        );

        // Join bookkeeping lives in the variable bag so it survives worker
        // crashes along with the instance row.
        let mut output = Map::new();
        output.insert(
            join_counter_key(&ctx.step.step_key),
            json!({
                "join_step": config.join_step,
                "required": config.required_arrivals(),
                "arrived": 0,
            }),
        );

        Ok(StepExecutionResult {
            fan_out: config.branches,
            output_variables: output,
            ..Default::default()
        })
    }
}
