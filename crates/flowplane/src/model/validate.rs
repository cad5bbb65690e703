//! Definition validation.
//!
//! Run before publishing a draft. Errors block publication; warnings and
//! suggestions are advisory. The checks here are structural (keys,
//! transitions, reachability); per-step configuration is validated by the
//! step's executor and merged into the same report by the engine.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::definition::{StepType, TriggerType, WorkflowDefinition};
use super::step_config::StepConfig;

/// Outcome of validating a definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.suggestions.extend(other.suggestions);
        self.is_valid = self.errors.is_empty();
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn suggestion(&mut self, msg: impl Into<String>) {
        self.suggestions.push(msg.into());
    }
}

/// Structural validator for workflow definitions.
#[derive(Debug, Default)]
pub struct DefinitionValidator;

impl DefinitionValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        let mut report = ValidationReport::default();

        if definition.name.trim().is_empty() {
            report.error("definition name must not be empty");
        }
        if definition.steps.is_empty() {
            report.error("definition has no steps");
            report.is_valid = false;
            return report;
        }

        self.check_trigger(definition, &mut report);
        self.check_step_keys(definition, &mut report);
        self.check_start_and_end(definition, &mut report);
        self.check_transitions(definition, &mut report);
        self.check_reachability(definition, &mut report);

        report.is_valid = report.errors.is_empty();
        report
    }

    fn check_trigger(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        match definition.trigger.trigger_type {
            TriggerType::Manual => {}
            TriggerType::EntityEvent => {
                if definition.trigger.entity_type.as_deref().unwrap_or("").is_empty() {
                    report.error("entity_event trigger requires an entity_type");
                }
                if definition.trigger.entity_event.as_deref().unwrap_or("").is_empty() {
                    report.error("entity_event trigger requires an entity_event");
                }
            }
            TriggerType::Scheduled => {
                if definition.trigger.cron.as_deref().unwrap_or("").trim().is_empty() {
                    report.error("scheduled trigger requires a cron expression");
                }
            }
        }
    }

    fn check_step_keys(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let mut seen = HashSet::new();
        for step in &definition.steps {
            if step.step_key.trim().is_empty() {
                report.error("step key must not be empty");
                continue;
            }
            if !seen.insert(step.step_key.as_str()) {
                report.error(format!("duplicate step key: {}", step.step_key));
            }
        }
    }

    fn check_start_and_end(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let starts: Vec<_> = definition.steps.iter().filter(|s| s.is_start).collect();
        match starts.len() {
            0 => report.error("definition must mark exactly one start step; found none"),
            1 => {}
            n => report.error(format!(
                "definition must mark exactly one start step; found {}",
                n
            )),
        }

        let has_end = definition
            .steps
            .iter()
            .any(|s| s.is_end || s.step_type == StepType::End);
        if !has_end {
            report.error("definition has no end step");
        }
    }

    fn check_transitions(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let keys: HashSet<&str> = definition.steps.iter().map(|s| s.step_key.as_str()).collect();

        for step in &definition.steps {
            for (label, target) in &step.transitions {
                if !keys.contains(target.as_str()) {
                    report.error(format!(
                        "step '{}' transition '{}' targets unknown step '{}'",
                        step.step_key, label, target
                    ));
                }
            }

            match step.step_type {
                StepType::Condition => {
                    for required in ["true", "false"] {
                        if !step.transitions.contains_key(required) {
                            report.error(format!(
                                "condition step '{}' is missing a '{}' transition",
                                step.step_key, required
                            ));
                        }
                    }
                }
                StepType::Parallel => {
                    if let Ok(StepConfig::Parallel(cfg)) =
                        StepConfig::decode(step.step_type, &step.config)
                    {
                        for branch in &cfg.branches {
                            if !keys.contains(branch.as_str()) {
                                report.error(format!(
                                    "parallel step '{}' branch targets unknown step '{}'",
                                    step.step_key, branch
                                ));
                            }
                        }
                        if !keys.contains(cfg.join_step.as_str()) {
                            report.error(format!(
                                "parallel step '{}' join targets unknown step '{}'",
                                step.step_key, cfg.join_step
                            ));
                        }
                    }
                }
                StepType::UserAction => {
                    if step.transitions.is_empty() {
                        report.error(format!(
                            "user_action step '{}' has no action transitions",
                            step.step_key
                        ));
                    }
                }
                StepType::End => {
                    if !step.transitions.is_empty() {
                        report.warning(format!(
                            "end step '{}' has outgoing transitions; they are never followed",
                            step.step_key
                        ));
                    }
                }
                _ => {
                    if step.transitions.is_empty() && !step.is_end {
                        report.error(format!(
                            "step '{}' has no outgoing transitions and is not an end step",
                            step.step_key
                        ));
                    }
                }
            }
        }
    }

    /// BFS from the start step over transitions and parallel branches.
    fn check_reachability(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let Some(start) = definition.start_step() else {
            return;
        };

        let by_key: HashMap<&str, _> = definition
            .steps
            .iter()
            .map(|s| (s.step_key.as_str(), s))
            .collect();

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(start.step_key.clone());

        let mut reaches_end = false;
        while let Some(key) = queue.pop_front() {
            if !visited.insert(key.clone()) {
                continue;
            }
            let Some(step) = by_key.get(key.as_str()) else {
                continue;
            };
            if step.is_end || step.step_type == StepType::End {
                reaches_end = true;
            }
            for target in step.transitions.values() {
                queue.push_back(target.clone());
            }
            if step.step_type == StepType::Parallel {
                if let Ok(StepConfig::Parallel(cfg)) =
                    StepConfig::decode(step.step_type, &step.config)
                {
                    for branch in cfg.branches {
                        queue.push_back(branch);
                    }
                    queue.push_back(cfg.join_step);
                }
            }
        }

        if !reaches_end {
            report.error("no end step is reachable from the start step");
        }

        for step in &definition.steps {
            if !visited.contains(step.step_key.as_str()) {
                report.warning(format!(
                    "step '{}' is unreachable from the start step",
                    step.step_key
                ));
                report.suggestion(format!(
                    "remove step '{}' or add a transition leading to it",
                    step.step_key
                ));
            }
        }
    }
}
