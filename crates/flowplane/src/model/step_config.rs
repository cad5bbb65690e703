//! Typed step configuration.
//!
//! Step configuration is stored on the definition as an opaque JSON blob.
//! Before any use it is decoded into the [`StepConfig`] union keyed by the
//! step's type; the raw blob shape is never trusted at execution time.
//! Decode errors surface as `Validation` errors at publish time and as
//! `StepExecution` failures if a bad blob somehow reaches a worker.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

use super::definition::StepType;
use super::task::TaskAssignment;

/// Join completion policy for parallel fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Wait for every forked branch to arrive.
    #[default]
    All,
    /// Proceed once `count` branches have arrived.
    Count { count: u32 },
}

/// Configuration for user-action steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserActionConfig {
    /// Task title; may contain template expressions.
    pub title: String,
    #[serde(default)]
    pub instructions: Option<String>,
    pub assignment: TaskAssignment,
    /// Due offset from task creation, in minutes.
    #[serde(default)]
    pub due_in_minutes: Option<i64>,
    #[serde(default)]
    pub form_schema: Option<Value>,
}

/// Configuration for delay steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Relative delay from step entry.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Variable holding an absolute RFC 3339 resume time. Takes precedence
    /// over `duration_secs` when set and resolvable.
    #[serde(default)]
    pub until_variable: Option<String>,
}

/// Configuration for condition steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Boolean expression over the variable bag (Jinja2-style).
    pub expression: String,
}

/// Configuration for parallel fork steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Branch entry step keys; each gets its own job.
    pub branches: Vec<String>,
    /// Step where the branches converge.
    pub join_step: String,
    #[serde(default)]
    pub join_policy: JoinPolicy,
}

impl ParallelConfig {
    /// Number of branch arrivals required before the join dispatches.
    pub fn required_arrivals(&self) -> u32 {
        match self.join_policy {
            JoinPolicy::All => self.branches.len() as u32,
            JoinPolicy::Count { count } => count.min(self.branches.len() as u32),
        }
    }
}

/// Configuration for outbound HTTP call steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallConfig {
    /// Request URL; may contain template expressions.
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON body; rendered recursively against the variable bag.
    #[serde(default)]
    pub body: Option<Value>,
    /// Variable to store the response under. Defaults to the step key.
    #[serde(default)]
    pub output_variable: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Configuration for sub-workflow steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowConfig {
    /// Definition to start; latest published version is used.
    pub definition_id: Uuid,
    /// Initial context for the child; values rendered against the parent's
    /// variable bag.
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Variable to store the child instance id under.
    #[serde(default)]
    pub output_variable: Option<String>,
}

/// Configuration for built-in automated steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomatedConfig {
    /// Built-in action name: "set_variables", "log", or "noop".
    pub action: String,
    /// Action parameters; values rendered against the variable bag.
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Configuration for end steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndConfig {
    /// Optional outcome label recorded in the completion event.
    #[serde(default)]
    pub outcome: Option<String>,
}

/// Strongly-typed step configuration union.
#[derive(Debug, Clone)]
pub enum StepConfig {
    UserAction(UserActionConfig),
    Delay(DelayConfig),
    Condition(ConditionConfig),
    Parallel(ParallelConfig),
    ApiCall(ApiCallConfig),
    SubWorkflow(SubWorkflowConfig),
    Automated(AutomatedConfig),
    End(EndConfig),
}

impl StepConfig {
    /// Decode and validate a raw configuration blob for a step type.
    pub fn decode(step_type: StepType, raw: &Value) -> EngineResult<Self> {
        let config = match step_type {
            StepType::UserAction => {
                let cfg: UserActionConfig = from_blob(raw)?;
                if cfg.title.trim().is_empty() {
                    return Err(EngineError::Validation(
                        "user_action step requires a non-empty title".to_string(),
                    ));
                }
                StepConfig::UserAction(cfg)
            }
            StepType::Delay => {
                let cfg: DelayConfig = from_blob(raw)?;
                if cfg.duration_secs.is_none() && cfg.until_variable.is_none() {
                    return Err(EngineError::Validation(
                        "delay step requires duration_secs or until_variable".to_string(),
                    ));
                }
                StepConfig::Delay(cfg)
            }
            StepType::Condition => {
                let cfg: ConditionConfig = from_blob(raw)?;
                if cfg.expression.trim().is_empty() {
                    return Err(EngineError::Validation(
                        "condition step requires a non-empty expression".to_string(),
                    ));
                }
                StepConfig::Condition(cfg)
            }
            StepType::Parallel => {
                let cfg: ParallelConfig = from_blob(raw)?;
                if cfg.branches.len() < 2 {
                    return Err(EngineError::Validation(
                        "parallel step requires at least two branches".to_string(),
                    ));
                }
                if let JoinPolicy::Count { count } = cfg.join_policy {
                    if count == 0 || count as usize > cfg.branches.len() {
                        return Err(EngineError::Validation(format!(
                            "parallel join count {} out of range for {} branches",
                            count,
                            cfg.branches.len()
                        )));
                    }
                }
                StepConfig::Parallel(cfg)
            }
            StepType::ApiCall => {
                let cfg: ApiCallConfig = from_blob(raw)?;
                if cfg.url.trim().is_empty() {
                    return Err(EngineError::Validation(
                        "api_call step requires a non-empty url".to_string(),
                    ));
                }
                StepConfig::ApiCall(cfg)
            }
            StepType::SubWorkflow => StepConfig::SubWorkflow(from_blob(raw)?),
            StepType::Automated => {
                let cfg: AutomatedConfig = from_blob(raw)?;
                if !matches!(cfg.action.as_str(), "set_variables" | "log" | "noop") {
                    return Err(EngineError::Validation(format!(
                        "unknown automated action: {}",
                        cfg.action
                    )));
                }
                StepConfig::Automated(cfg)
            }
            StepType::End => {
                if raw.is_null() {
                    StepConfig::End(EndConfig::default())
                } else {
                    StepConfig::End(from_blob(raw)?)
                }
            }
        };
        Ok(config)
    }
}

fn from_blob<T: serde::de::DeserializeOwned>(raw: &Value) -> EngineResult<T> {
    serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::Validation(format!("invalid step configuration: {}", e)))
}
