//! Delay step executor.
//!
//! Computes the resume time and yields; the engine enqueues a ResumeDelayed
//! job for that time. The worker never sleeps holding a lease.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult};
use crate::model::{StepConfig, StepType};
use crate::template::ExpressionEvaluator;

use super::{StepExecutionContext, StepExecutionResult, StepExecutor};

pub struct DelayExecutor {
    evaluator: Arc<ExpressionEvaluator>,
}

impl DelayExecutor {
    pub fn new() -> Self {
        Self {
            evaluator: Arc::new(ExpressionEvaluator::new()),
        }
    }

    pub fn with_evaluator(evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl Default for DelayExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for DelayExecutor {
    fn step_type(&self) -> StepType {
        StepType::Delay
    }

    async fn execute(
        &self,
        ctx: &StepExecutionContext<'_>,
    ) -> EngineResult<StepExecutionResult> {
        let StepConfig::Delay(config) = StepConfig::decode(ctx.step.step_type, &ctx.step.config)?
        else {
            return Err(EngineError::Internal("delay config decode mismatch".into()));
        };

        // An absolute resume time from a variable wins over the relative
        // duration.
        let resume_at = match &config.until_variable {
            Some(var) => {
                let raw = self
                    .evaluator
                    .render(&format!("{{{{ {} }}}}", var), ctx.variables)?;
                let parsed: DateTime<Utc> = raw.trim().parse().map_err(|_| {
                    EngineError::StepExecution(format!(
                        "delay step '{}': variable '{}' is not an RFC 3339 timestamp: {}",
                        ctx.step.step_key, var, raw
                    ))
                })?;
                parsed
            }
            None => {
                let secs = config.duration_secs.ok_or_else(|| {
                    EngineError::StepExecution(format!(
                        "delay step '{}' has neither duration_secs nor until_variable",
                        ctx.step.step_key
                    ))
                })?;
                Utc::now() + chrono::Duration::seconds(secs as i64)
            }
        };

        tracing::debug!(
            instance_id = %ctx.instance.id,
            step_key = %ctx.step.step_key,
            resume_at = %resume_at,
            "delay scheduled"
        );

        Ok(StepExecutionResult {
            resume_at: Some(resume_at),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::{ctx, fixture};
    use crate::model::WorkflowStep;
    use serde_json::json;

    #[tokio::test]
    async fn test_relative_delay() {
        let mut step = WorkflowStep::new("wait", "Wait", StepType::Delay, 0);
        step.config = json!({"duration_secs": 3600});

        let (definition, instance) = fixture(vec![step]);
        let before = Utc::now();
        let result = DelayExecutor::new()
            .execute(&ctx(&definition, &instance, &definition.steps[0]))
            .await
            .unwrap();

        let resume_at = result.resume_at.unwrap();
        assert!(resume_at >= before + chrono::Duration::seconds(3599));
        assert!(resume_at <= Utc::now() + chrono::Duration::seconds(3601));
    }

    #[tokio::test]
    async fn test_until_variable_wins() {
        let mut step = WorkflowStep::new("wait", "Wait", StepType::Delay, 0);
        step.config = json!({"duration_secs": 10, "until_variable": "resume_at"});

        let (definition, mut instance) = fixture(vec![step]);
        instance
            .variables
            .insert("resume_at".into(), json!("2026-09-01T12:00:00Z"));

        let result = DelayExecutor::new()
            .execute(&ctx(&definition, &instance, &definition.steps[0]))
            .await
            .unwrap();
        assert_eq!(
            result.resume_at.unwrap(),
            "2026-09-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_bad_until_variable_fails() {
        let mut step = WorkflowStep::new("wait", "Wait", StepType::Delay, 0);
        step.config = json!({"until_variable": "resume_at"});

        let (definition, mut instance) = fixture(vec![step]);
        instance.variables.insert("resume_at".into(), json!("soonish"));

        let err = DelayExecutor::new()
            .execute(&ctx(&definition, &instance, &definition.steps[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepExecution(_)));
    }
}
