//! Workflow documents and their validated, registry-resolved form
//!
//! A `WorkflowDocument` is the declarative JSON shape loaded at startup.
//! `WorkflowDefinition::load` checks every structural rule and resolves each
//! step and condition reference against the registries exactly once, so the
//! engine never performs a lookup by name while a run is in flight.

use crate::error::{Result, WorkflowError};
use crate::steps::{Condition, ConditionRegistry, Step, StepRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const END: &str = "END";
pub const SUSPEND: &str = "SUSPEND";

//
// ================= Document (wire form) =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDocument {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub conditional_edges: Vec<ConditionalEdgeSpec>,
    pub entry_point: String,
    #[serde(default)]
    pub approval: Option<ApprovalSpec>,
    #[serde(default)]
    pub config: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub step: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalEdgeSpec {
    pub from: String,
    pub condition: String,
    pub branches: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSpec {
    pub decision_type: String,
    /// Step a resumed run re-enters; it owns the resolution condition
    pub resolve_at: String,
    #[serde(default = "default_description_key")]
    pub description_key: String,
}

fn default_description_key() -> String {
    "approval_description".to_string()
}

/// Longest a decision may stay PENDING before the timeout sweep claims it.
pub const MAX_HITL_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    pub max_iterations: u32,
    pub timeout_seconds: u64,
    pub retry_policy: RetryPolicy,
    pub hitl_timeout_seconds: u64,
    pub audit_logging: AuditSpec,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            timeout_seconds: 30,
            retry_policy: RetryPolicy::default(),
            hitl_timeout_seconds: 300,
            audit_logging: AuditSpec::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = ms.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditSpec {
    pub enabled: bool,
    /// Input keys written as CSV columns, in order
    pub input_columns: Vec<String>,
    /// State key whose array length becomes `num_outcomes`
    pub outcomes_key: Option<String>,
    /// State key holding violations for the violations document
    pub violations_key: Option<String>,
}

impl Default for AuditSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            input_columns: Vec::new(),
            outcomes_key: None,
            violations_key: None,
        }
    }
}

//
// ================= Resolved definition =================
//

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Step(String),
    End,
    Suspend,
}

impl Target {
    fn parse(raw: &str) -> Self {
        match raw {
            END => Target::End,
            SUSPEND => Target::Suspend,
            other => Target::Step(other.to_string()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Step(id) => write!(f, "{}", id),
            Target::End => write!(f, "{}", END),
            Target::Suspend => write!(f, "{}", SUSPEND),
        }
    }
}

pub enum Transition {
    Direct(Target),
    Conditional {
        condition_ref: String,
        condition: Arc<dyn Condition>,
        branches: HashMap<String, Target>,
    },
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Direct(target) => f.debug_tuple("Direct").field(target).finish(),
            Transition::Conditional {
                condition_ref,
                branches,
                ..
            } => f
                .debug_struct("Conditional")
                .field("condition", condition_ref)
                .field("branches", branches)
                .finish(),
        }
    }
}

pub struct Node {
    pub id: String,
    pub name: String,
    pub description: String,
    pub step_ref: String,
    pub step: Arc<dyn Step>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("step", &self.step_ref)
            .finish()
    }
}

/// Immutable, validated workflow graph.
#[derive(Debug)]
pub struct WorkflowDefinition {
    pub id: String,
    pub agent_id: String,
    pub description: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    transitions: HashMap<String, Transition>,
    pub entry_point: String,
    pub approval: Option<ApprovalSpec>,
    pub config: ExecutionConfig,
}

impl WorkflowDefinition {
    pub fn from_json(
        raw: &str,
        steps: &StepRegistry,
        conditions: &ConditionRegistry,
    ) -> Result<Self> {
        let doc: WorkflowDocument = serde_json::from_str(raw)
            .map_err(|e| WorkflowError::Validation(format!("malformed workflow document: {}", e)))?;
        Self::load(doc, steps, conditions)
    }

    /// Validate a document and resolve its references. Any violation is a
    /// `Validation` error and nothing is constructed.
    pub fn load(
        doc: WorkflowDocument,
        steps: &StepRegistry,
        conditions: &ConditionRegistry,
    ) -> Result<Self> {
        let invalid = |msg: String| WorkflowError::Validation(format!("{}: {}", doc.id, msg));

        if doc.nodes.is_empty() {
            return Err(invalid("workflow has no nodes".into()));
        }

        // Nodes
        let mut nodes = Vec::with_capacity(doc.nodes.len());
        let mut index = HashMap::new();
        for spec in &doc.nodes {
            if spec.id == END || spec.id == SUSPEND {
                return Err(invalid(format!("node id '{}' is reserved", spec.id)));
            }
            if index.insert(spec.id.clone(), nodes.len()).is_some() {
                return Err(invalid(format!("duplicate node id '{}'", spec.id)));
            }
            let step = steps
                .get(&spec.step)
                .ok_or_else(|| invalid(format!("node '{}' references unknown step '{}'", spec.id, spec.step)))?;
            nodes.push(Node {
                id: spec.id.clone(),
                name: spec.name.clone(),
                description: spec.description.clone(),
                step_ref: spec.step.clone(),
                step,
            });
        }

        let check_target = |from: &str, raw: &str| -> Result<Target> {
            let target = Target::parse(raw);
            if let Target::Step(id) = &target {
                if !index.contains_key(id) {
                    return Err(invalid(format!("edge from '{}' targets unknown step '{}'", from, id)));
                }
            }
            Ok(target)
        };

        // Edges
        let mut transitions = HashMap::new();
        for edge in &doc.edges {
            if !index.contains_key(&edge.from) {
                return Err(invalid(format!("edge from unknown step '{}'", edge.from)));
            }
            let target = check_target(&edge.from, &edge.to)?;
            if transitions
                .insert(edge.from.clone(), Transition::Direct(target))
                .is_some()
            {
                return Err(invalid(format!("step '{}' has more than one outgoing edge", edge.from)));
            }
        }

        for edge in &doc.conditional_edges {
            if !index.contains_key(&edge.from) {
                return Err(invalid(format!("conditional edge from unknown step '{}'", edge.from)));
            }
            let condition = conditions.get(&edge.condition).ok_or_else(|| {
                invalid(format!("step '{}' references unknown condition '{}'", edge.from, edge.condition))
            })?;

            let declared: HashSet<&str> = condition.branch_keys().iter().map(|k| k.as_str()).collect();
            let mapped: HashSet<&str> = edge.branches.keys().map(|k| k.as_str()).collect();
            if let Some(missing) = declared.difference(&mapped).next() {
                return Err(invalid(format!(
                    "condition '{}' on '{}' can return '{}' but no branch maps it",
                    edge.condition, edge.from, missing
                )));
            }
            if let Some(extra) = mapped.difference(&declared).next() {
                return Err(invalid(format!(
                    "branch '{}' on '{}' is not a key condition '{}' can return",
                    extra, edge.from, edge.condition
                )));
            }

            let mut branches = HashMap::new();
            for (key, raw) in &edge.branches {
                branches.insert(key.clone(), check_target(&edge.from, raw)?);
            }

            let transition = Transition::Conditional {
                condition_ref: edge.condition.clone(),
                condition,
                branches,
            };
            if transitions.insert(edge.from.clone(), transition).is_some() {
                return Err(invalid(format!("step '{}' has more than one outgoing edge", edge.from)));
            }
        }

        // Entry point and limits
        if !index.contains_key(&doc.entry_point) {
            return Err(invalid(format!("entry point '{}' is not a step", doc.entry_point)));
        }
        if doc.config.max_iterations < 1 {
            return Err(invalid("maxIterations must be at least 1".into()));
        }
        if !(1..=MAX_HITL_TIMEOUT_SECS).contains(&doc.config.hitl_timeout_seconds) {
            return Err(invalid(format!(
                "hitlTimeoutSeconds must be between 1 and {}",
                MAX_HITL_TIMEOUT_SECS
            )));
        }
        if doc.config.timeout_seconds < 1 {
            return Err(invalid("timeoutSeconds must be at least 1".into()));
        }
        if doc.config.retry_policy.backoff_multiplier < 1.0 {
            return Err(invalid("retryPolicy.backoffMultiplier must be at least 1".into()));
        }

        // HITL gate wiring
        let suspends = transitions.values().any(|t| match t {
            Transition::Direct(target) => *target == Target::Suspend,
            Transition::Conditional { branches, .. } => {
                branches.values().any(|target| *target == Target::Suspend)
            }
        });
        match (&doc.approval, suspends) {
            (None, true) => {
                return Err(invalid("a branch targets SUSPEND but no approval block is declared".into()));
            }
            (Some(approval), _) => {
                if !index.contains_key(&approval.resolve_at) {
                    return Err(invalid(format!(
                        "approval.resolveAt '{}' is not a step",
                        approval.resolve_at
                    )));
                }
                if !matches!(
                    transitions.get(&approval.resolve_at),
                    Some(Transition::Conditional { .. })
                ) {
                    return Err(invalid(format!(
                        "approval.resolveAt '{}' must own a conditional edge",
                        approval.resolve_at
                    )));
                }
            }
            (None, false) => {}
        }

        Ok(Self {
            id: doc.id,
            agent_id: doc.agent_id,
            description: doc.description,
            nodes,
            index,
            transitions,
            entry_point: doc.entry_point,
            approval: doc.approval,
            config: doc.config,
        })
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// `None` means the step is terminal.
    pub fn transition(&self, from: &str) -> Option<&Transition> {
        self.transitions.get(from)
    }

    /// Override the HITL timeout after load; values below 1 are ignored.
    pub fn with_hitl_timeout(mut self, seconds: u64) -> Self {
        if seconds >= 1 {
            self.config.hitl_timeout_seconds = seconds.min(MAX_HITL_TIMEOUT_SECS);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowState;
    use crate::steps::FnCondition;

    fn registries() -> (StepRegistry, ConditionRegistry) {
        let mut steps = StepRegistry::new();
        steps.register_fn("t.noop", Ok);
        let mut conditions = ConditionRegistry::new();
        conditions.register(
            "t.gate",
            Arc::new(FnCondition::new(&["yes", "no"], |_: &WorkflowState| "no".into())),
        );
        (steps, conditions)
    }

    fn doc(body: serde_json::Value) -> String {
        let mut base = serde_json::json!({
            "id": "wf",
            "agentId": "agent",
            "nodes": [
                {"id": "a", "name": "A", "step": "t.noop"},
                {"id": "b", "name": "B", "step": "t.noop"}
            ],
            "entryPoint": "a"
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), body.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        base.to_string()
    }

    fn load(body: serde_json::Value) -> Result<WorkflowDefinition> {
        let (steps, conditions) = registries();
        WorkflowDefinition::from_json(&doc(body), &steps, &conditions)
    }

    fn assert_invalid(body: serde_json::Value, needle: &str) {
        match load(body) {
            Err(WorkflowError::Validation(msg)) => {
                assert!(msg.contains(needle), "'{}' missing from '{}'", needle, msg)
            }
            other => panic!("expected validation error, got {:?}", other.map(|d| d.id)),
        }
    }

    #[test]
    fn test_loads_with_defaults() {
        let def = load(serde_json::json!({
            "edges": [{"from": "a", "to": "b"}],
            "conditionalEdges": [{"from": "b", "condition": "t.gate",
                                  "branches": {"yes": "a", "no": "END"}}]
        }))
        .unwrap();

        assert_eq!(def.config.max_iterations, 50);
        assert_eq!(def.config.hitl_timeout_seconds, 300);
        assert!(matches!(def.transition("a"), Some(Transition::Direct(Target::Step(s))) if s == "b"));
        assert!(def.node("b").is_some());
        assert!(def.approval.is_none());
    }

    #[test]
    fn test_rejects_unknown_references() {
        assert_invalid(serde_json::json!({"edges": [{"from": "a", "to": "zzz"}]}), "unknown step 'zzz'");
        assert_invalid(serde_json::json!({"entryPoint": "zzz"}), "entry point");
        assert_invalid(
            serde_json::json!({"nodes": [{"id": "a", "name": "A", "step": "t.missing"}]}),
            "unknown step 't.missing'",
        );
        assert_invalid(
            serde_json::json!({"conditionalEdges": [{"from": "a", "condition": "t.nope", "branches": {}}]}),
            "unknown condition",
        );
    }

    #[test]
    fn test_branch_map_must_match_declared_keys() {
        assert_invalid(
            serde_json::json!({"conditionalEdges": [{"from": "a", "condition": "t.gate",
                                                     "branches": {"yes": "b"}}]}),
            "no branch maps it",
        );
        assert_invalid(
            serde_json::json!({"conditionalEdges": [{"from": "a", "condition": "t.gate",
                                                     "branches": {"yes": "b", "no": "END", "maybe": "END"}}]}),
            "'maybe'",
        );
    }

    #[test]
    fn test_structural_rules() {
        assert_invalid(
            serde_json::json!({"nodes": [{"id": "a", "name": "A", "step": "t.noop"},
                                         {"id": "a", "name": "A2", "step": "t.noop"}]}),
            "duplicate node id",
        );
        assert_invalid(
            serde_json::json!({
                "edges": [{"from": "a", "to": "b"}],
                "conditionalEdges": [{"from": "a", "condition": "t.gate",
                                      "branches": {"yes": "b", "no": "END"}}]
            }),
            "more than one outgoing edge",
        );
        assert_invalid(serde_json::json!({"config": {"maxIterations": 0}}), "maxIterations");
        assert_invalid(
            serde_json::json!({"config": {"retryPolicy": {"backoffMultiplier": 0.5}}}),
            "backoffMultiplier",
        );
    }

    #[test]
    fn test_hitl_timeout_is_bounded() {
        assert_invalid(serde_json::json!({"config": {"hitlTimeoutSeconds": 0}}), "hitlTimeoutSeconds");
        assert_invalid(
            serde_json::json!({"config": {"hitlTimeoutSeconds": 10_000_000_000_000u64}}),
            "hitlTimeoutSeconds",
        );
        assert_invalid(
            serde_json::json!({"config": {"hitlTimeoutSeconds": u64::MAX}}),
            "hitlTimeoutSeconds",
        );

        let def = load(serde_json::json!({"config": {"hitlTimeoutSeconds": MAX_HITL_TIMEOUT_SECS}})).unwrap();
        assert_eq!(def.with_hitl_timeout(u64::MAX).config.hitl_timeout_seconds, MAX_HITL_TIMEOUT_SECS);
    }

    #[test]
    fn test_suspend_requires_approval_block() {
        assert_invalid(
            serde_json::json!({"conditionalEdges": [{"from": "a", "condition": "t.gate",
                                                     "branches": {"yes": "SUSPEND", "no": "b"}}]}),
            "no approval block",
        );
        assert_invalid(
            serde_json::json!({
                "conditionalEdges": [{"from": "a", "condition": "t.gate",
                                      "branches": {"yes": "SUSPEND", "no": "b"}}],
                "approval": {"decisionType": "x", "resolveAt": "b"}
            }),
            "must own a conditional edge",
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            backoff_multiplier: 3.0,
            max_backoff_ms: 1000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(300));
        assert_eq!(policy.backoff(3), Duration::from_millis(900));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
    }
}
