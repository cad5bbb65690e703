//! Automated step executor.
//!
//! Built-in actions over the variable bag: `set_variables` merges rendered
//! params, `log` emits a structured log line, `noop` does nothing. All three
//! advance along the default transition.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Map;

use crate::error::{EngineError, EngineResult};
use crate::model::{StepConfig, StepType};
use crate::template::ExpressionEvaluator;

use super::{StepExecutionContext, StepExecutionResult, StepExecutor};

pub struct AutomatedExecutor {
    evaluator: Arc<ExpressionEvaluator>,
}

impl AutomatedExecutor {
    pub fn new() -> Self {
        Self {
            evaluator: Arc::new(ExpressionEvaluator::new()),
        }
    }

    pub fn with_evaluator(evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl Default for AutomatedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for AutomatedExecutor {
    fn step_type(&self) -> StepType {
        StepType::Automated
    }

    async fn execute(
        &self,
        ctx: &StepExecutionContext<'_>,
    ) -> EngineResult<StepExecutionResult> {
        let StepConfig::Automated(config) = StepConfig::decode(ctx.step.step_type, &ctx.step.config)?
        else {
            return Err(EngineError::Internal("automated config decode mismatch".into()));
        };

        let mut output = Map::new();
        match config.action.as_str() {
            "set_variables" => {
                for (key, value) in &config.params {
                    output.insert(key.clone(), self.evaluator.render_value(value, ctx.variables)?);
                }
            }
            "log" => {
                let message = config
                    .params
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let rendered = self.evaluator.render(message, ctx.variables)?;
                tracing::info!(
                    instance_id = %ctx.instance.id,
                    step_key = %ctx.step.step_key,
                    "{}",
                    rendered
                );
            }
            "noop" => {}
            other => {
                return Err(EngineError::StepExecution(format!(
                    "unknown automated action: {}",
                    other
                )));
            }
        }

        let next = ctx.step.default_next().ok_or_else(|| {
            EngineError::StepExecution(format!(
                "automated step '{}' has no default transition",
                ctx.step.step_key
            ))
        })?;
        Ok(StepExecutionResult::advance(next).with_variables(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::{ctx, fixture};
    use crate::model::WorkflowStep;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_variables_renders_params() {
        let mut step = WorkflowStep::new("assign", "Assign", StepType::Automated, 0);
        step.config = json!({
            "action": "set_variables",
            "params": {
                "owner": "{{ customer.tier }}-team",
                "score": "{{ amount }}"
            }
        });
        step.transitions.insert("default".into(), "next".into());

        let (definition, mut instance) = fixture(vec![step]);
        instance.variables.insert("amount".into(), json!(42));
        instance
            .variables
            .insert("customer".into(), json!({"tier": "gold"}));

        let executor = AutomatedExecutor::new();
        let result = executor
            .execute(&ctx(&definition, &instance, &definition.steps[0]))
            .await
            .unwrap();

        assert_eq!(result.output_variables["owner"], json!("gold-team"));
        assert_eq!(result.output_variables["score"], json!(42));
        assert_eq!(result.next_step_key.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_noop_advances_without_output() {
        let mut step = WorkflowStep::new("pass", "Pass", StepType::Automated, 0);
        step.config = json!({"action": "noop"});
        step.transitions.insert("default".into(), "next".into());

        let (definition, instance) = fixture(vec![step]);
        let executor = AutomatedExecutor::new();
        let result = executor
            .execute(&ctx(&definition, &instance, &definition.steps[0]))
            .await
            .unwrap();
        assert!(result.output_variables.is_empty());
        assert_eq!(result.next_step_key.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_missing_default_transition_fails() {
        let mut step = WorkflowStep::new("pass", "Pass", StepType::Automated, 0);
        step.config = json!({"action": "noop"});

        let (definition, instance) = fixture(vec![step]);
        let executor = AutomatedExecutor::new();
        let err = executor
            .execute(&ctx(&definition, &instance, &definition.steps[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepExecution(_)));
    }
}
