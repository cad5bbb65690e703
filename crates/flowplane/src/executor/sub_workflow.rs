//! Sub-workflow step executor.
//!
//! Reports a child workflow to start; the engine creates the child instance
//! from the latest published version of the configured definition and stores
//! its id in the parent's bag. Fire-and-forget: the parent advances along
//! its default transition without waiting for the child.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Map;

use crate::error::{EngineError, EngineResult};
use crate::model::{StepConfig, StepType};
use crate::template::ExpressionEvaluator;

use super::{ChildWorkflowSpec, StepExecutionContext, StepExecutionResult, StepExecutor};

pub struct SubWorkflowExecutor {
    evaluator: Arc<ExpressionEvaluator>,
}

impl SubWorkflowExecutor {
    pub fn new() -> Self {
        Self {
            evaluator: Arc::new(ExpressionEvaluator::new()),
        }
    }

    pub fn with_evaluator(evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl Default for SubWorkflowExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for SubWorkflowExecutor {
    fn step_type(&self) -> StepType {
        StepType::SubWorkflow
    }

    async fn execute(
        &self,
        ctx: &StepExecutionContext<'_>,
    ) -> EngineResult<StepExecutionResult> {
        let StepConfig::SubWorkflow(config) =
            StepConfig::decode(ctx.step.step_type, &ctx.step.config)?
        else {
            return Err(EngineError::Internal("sub_workflow config decode mismatch".into()));
        };

        let mut initial_variables = Map::new();
        for (key, value) in &config.input {
            initial_variables.insert(key.clone(), self.evaluator.render_value(value, ctx.variables)?);
        }

        let next = ctx.step.default_next().ok_or_else(|| {
            EngineError::StepExecution(format!(
                "sub_workflow step '{}' has no default transition",
                ctx.step.step_key
            ))
        })?;

        tracing::info!(
            instance_id = %ctx.instance.id,
            step_key = %ctx.step.step_key,
            child_definition_id = %config.definition_id,
            "starting child workflow"
        );

        Ok(StepExecutionResult {
            child_workflow: Some(ChildWorkflowSpec {
                definition_id: config.definition_id,
                initial_variables,
                output_variable: config.output_variable,
            }),
            next_step_key: Some(next.to_string()),
            ..Default::default()
        })
    }
}
