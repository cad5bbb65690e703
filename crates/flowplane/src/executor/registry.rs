//! Executor registry.
//!
//! Maps step types to executor strategies. The set is fixed at engine
//! construction; dispatch is a map lookup, and a miss is
//! `UnsupportedStepType`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::model::StepType;

use super::StepExecutor;

/// Registry of step executors keyed by step type.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor. Registering a second executor for the same
    /// step type is a configuration error.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) -> EngineResult<()> {
        let step_type = executor.step_type();
        if self.executors.contains_key(&step_type) {
            return Err(EngineError::Validation(format!(
                "executor already registered for step type: {}",
                step_type
            )));
        }
        self.executors.insert(step_type, executor);
        Ok(())
    }

    /// Look up the executor for a step type.
    pub fn get(&self, step_type: StepType) -> EngineResult<Arc<dyn StepExecutor>> {
        self.executors
            .get(&step_type)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedStepType(step_type.to_string()))
    }

    pub fn supported_types(&self) -> Vec<StepType> {
        let mut types: Vec<StepType> = self.executors.keys().copied().collect();
        types.sort_by_key(|t| t.to_string());
        types
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{AutomatedExecutor, ConditionExecutor};

    #[test]
    fn test_register_and_dispatch() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(AutomatedExecutor::new())).unwrap();

        assert!(registry.get(StepType::Automated).is_ok());
        let err = registry.get(StepType::Delay).err().unwrap();
        assert!(matches!(err, EngineError::UnsupportedStepType(_)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(ConditionExecutor::new())).unwrap();
        let err = registry.register(Arc::new(ConditionExecutor::new())).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
