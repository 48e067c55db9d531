//! Step and condition traits with their registries
//!
//! Workflow documents reference steps and conditions by string id. The
//! registries map those ids to statically typed callables, and definitions
//! resolve every reference once, at load time.

use crate::state::WorkflowState;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Discrete value a condition returns to pick a branch.
pub type BranchKey = String;

/// Failure raised by a step function.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    pub retryable: bool,
}

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

pub type StepResult = std::result::Result<WorkflowState, StepError>;

/// Trait for a single reasoning step
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, state: WorkflowState) -> StepResult;
}

/// Trait for a branch selector. Must be pure.
pub trait Condition: Send + Sync {
    /// Closed set of keys `evaluate` may return
    fn branch_keys(&self) -> &[BranchKey];
    fn evaluate(&self, state: &WorkflowState) -> BranchKey;
}

//
// ================= Closure adapters =================
//

type StepFn = dyn Fn(WorkflowState) -> StepResult + Send + Sync;

/// Wraps a synchronous closure as a `Step`.
pub struct FnStep {
    f: Box<StepFn>,
}

impl FnStep {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(WorkflowState) -> StepResult + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait::async_trait]
impl Step for FnStep {
    async fn run(&self, state: WorkflowState) -> StepResult {
        (self.f)(state)
    }
}

type ConditionFn = dyn Fn(&WorkflowState) -> BranchKey + Send + Sync;

/// Wraps a closure and its declared key set as a `Condition`.
pub struct FnCondition {
    keys: Vec<BranchKey>,
    f: Box<ConditionFn>,
}

impl FnCondition {
    pub fn new<F>(keys: &[&str], f: F) -> Self
    where
        F: Fn(&WorkflowState) -> BranchKey + Send + Sync + 'static,
    {
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            f: Box::new(f),
        }
    }
}

impl Condition for FnCondition {
    fn branch_keys(&self) -> &[BranchKey] {
        &self.keys
    }

    fn evaluate(&self, state: &WorkflowState) -> BranchKey {
        (self.f)(state)
    }
}

//
// ================= Registries =================
//

/// Step registry for looking up step functions by id
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, step: Arc<dyn Step>) {
        self.steps.insert(id.into(), step);
    }

    pub fn register_fn<F>(&mut self, id: impl Into<String>, f: F)
    where
        F: Fn(WorkflowState) -> StepResult + Send + Sync + 'static,
    {
        self.register(id, Arc::new(FnStep::new(f)));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(id).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.steps.keys().map(|s| s.as_str()).collect()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.list())
            .finish()
    }
}

/// Condition registry for looking up branch selectors by id
#[derive(Clone, Default)]
pub struct ConditionRegistry {
    conditions: HashMap<String, Arc<dyn Condition>>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, condition: Arc<dyn Condition>) {
        self.conditions.insert(id.into(), condition);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Condition>> {
        self.conditions.get(id).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.conditions.keys().map(|s| s.as_str()).collect()
    }
}

impl fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("conditions", &self.list())
            .finish()
    }
}
