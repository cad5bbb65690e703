//! Outbound HTTP call executor.
//!
//! Renders URL, headers, and body against the variable bag, performs the
//! request, and stores the response under the configured output variable.
//! Non-2xx responses and transport errors are step failures and flow into
//! the step's retry policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::model::{StepConfig, StepType};
use crate::template::ExpressionEvaluator;

use super::{StepExecutionContext, StepExecutionResult, StepExecutor};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct ApiCallExecutor {
    client: reqwest::Client,
    evaluator: Arc<ExpressionEvaluator>,
}

impl ApiCallExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            evaluator: Arc::new(ExpressionEvaluator::new()),
        }
    }

    pub fn with_client(client: reqwest::Client, evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self { client, evaluator }
    }
}

impl Default for ApiCallExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ApiCallExecutor {
    fn step_type(&self) -> StepType {
        StepType::ApiCall
    }

    async fn execute(
        &self,
        ctx: &StepExecutionContext<'_>,
    ) -> EngineResult<StepExecutionResult> {
        let StepConfig::ApiCall(config) = StepConfig::decode(ctx.step.step_type, &ctx.step.config)?
        else {
            return Err(EngineError::Internal("api_call config decode mismatch".into()));
        };

        let url = self.evaluator.render(&config.url, ctx.variables)?;
        let method: Method = config.method.to_uppercase().parse().map_err(|_| {
            EngineError::StepExecution(format!("invalid HTTP method: {}", config.method))
        })?;

        let timeout = Duration::from_secs(ctx.step.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let mut request = self.client.request(method.clone(), &url).timeout(timeout);
        for (name, value) in &config.headers {
            request = request.header(name, self.evaluator.render(value, ctx.variables)?);
        }
        if let Some(body) = &config.body {
            request = request.json(&self.evaluator.render_value(body, ctx.variables)?);
        }

        tracing::info!(
            instance_id = %ctx.instance.id,
            step_key = %ctx.step.step_key,
            method = %method,
            url = %url,
            attempt = ctx.attempt,
            "dispatching api call"
        );

        let response = tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                return Err(EngineError::StepExecution("api call cancelled by shutdown".into()));
            }
            result = request.send() => result.map_err(|e| {
                EngineError::StepExecution(format!("api call to {} failed: {}", url, e))
            })?,
        };

        let status = response.status();
        let body_text = response.text().await.map_err(|e| {
            EngineError::StepExecution(format!("reading response from {} failed: {}", url, e))
        })?;

        if !status.is_success() {
            return Err(EngineError::StepExecution(format!(
                "api call to {} returned {}: {}",
                url,
                status.as_u16(),
                truncate(&body_text, 512)
            )));
        }

        let body_value: Value =
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));

        let output_variable = config
            .output_variable
            .unwrap_or_else(|| ctx.step.step_key.clone());
        let mut output = Map::new();
        output.insert(
            output_variable,
            json!({"status": status.as_u16(), "body": body_value}),
        );

        let next = ctx.step.default_next().ok_or_else(|| {
            EngineError::StepExecution(format!(
                "api_call step '{}' has no default transition",
                ctx.step.step_key
            ))
        })?;
        Ok(StepExecutionResult::advance(next).with_variables(output))
    }

    fn validate_config(&self, step: &crate::model::WorkflowStep) -> crate::model::ValidationReport {
        let mut report = crate::model::ValidationReport::default();
        match StepConfig::decode(self.step_type(), &step.config) {
            Err(e) => report.errors.push(format!("step '{}': {}", step.step_key, e)),
            Ok(StepConfig::ApiCall(cfg)) => {
                if cfg.url.starts_with("http://") {
                    report.warnings.push(format!(
                        "step '{}' calls a plain-http url",
                        step.step_key
                    ));
                    report
                        .suggestions
                        .push(format!("use https for step '{}'", step.step_key));
                }
                if cfg.method.to_uppercase().parse::<Method>().is_err() {
                    report.errors.push(format!(
                        "step '{}' has invalid HTTP method: {}",
                        step.step_key, cfg.method
                    ));
                }
            }
            Ok(_) => {}
        }
        report.is_valid = report.errors.is_empty();
        report
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
