//! Workflow execution engine
//!
//! Drives one run of a `WorkflowDefinition` at a time: steps execute
//! sequentially, edges are resolved after every step, and a `SUSPEND`
//! target parks the run until its decision is resolved. Resolution
//! (approve, reject, timeout sweep, bypass sweep) re-enters the parked run
//! through the definition's review step. Every terminal run writes exactly
//! one audit record.

use crate::audit::{compute_input_hash, AuditLog};
use crate::definition::{Node, Target, Transition, WorkflowDefinition};
use crate::error::WorkflowError;
use crate::hitl::{DecisionStore, FileDecisionStore, InMemoryDecisionStore};
use crate::models::{AuditRecord, Decision, DecisionStatus, RunOutcome, RunResult};
use crate::state::{
    FileRunStore, InMemoryRunStore, RunContext, RunStore, SuspendedRun, WorkflowState,
};
use crate::steps::StepError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_USER: &str = "default_user";

/// Per-run switches, fixed when the run starts.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub hitl_enabled: bool,
    pub autonomous_mode: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            user_id: None,
            hitl_enabled: true,
            autonomous_mode: false,
        }
    }
}

impl RunOptions {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }
}

pub fn default_session_id() -> String {
    format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Result of one resolution attempt. `outcome` is `None` when the decision
/// was already terminal and the call had no effect.
#[derive(Debug)]
pub struct Resolution {
    pub decision: Decision,
    pub outcome: Option<RunResult>,
}

impl Resolution {
    pub fn won(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Runs workflow definitions and owns their suspended continuations
pub struct WorkflowEngine {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    decisions: Arc<dyn DecisionStore>,
    runs: Arc<dyn RunStore>,
    audit: Arc<AuditLog>,
}

impl WorkflowEngine {
    pub fn new(
        decisions: Arc<dyn DecisionStore>,
        runs: Arc<dyn RunStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            decisions,
            runs,
            audit,
        }
    }

    /// Engine with in-memory stores and audit files under `audit_root`.
    pub fn in_memory(audit_root: impl Into<PathBuf>) -> Self {
        Self::new(
            Arc::new(InMemoryDecisionStore::new()),
            Arc::new(InMemoryRunStore::new()),
            Arc::new(AuditLog::new(audit_root)),
        )
    }

    /// Engine whose decisions and parked runs live under `data_dir/hitl`,
    /// next to the audit files, so pending reviews outlast the process.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let hitl_dir = data_dir.join("hitl");
        Ok(Self::new(
            Arc::new(FileDecisionStore::open(&hitl_dir).await?),
            Arc::new(FileRunStore::open(&hitl_dir).await?),
            Arc::new(AuditLog::new(data_dir)),
        ))
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub async fn register(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let definition = Arc::new(definition);
        info!(workflow_id = %definition.id, agent_id = %definition.agent_id, "Workflow registered");
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        definition
    }

    pub async fn definition(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // =============================
    // Run
    // =============================

    /// Start a new run at the definition's entry point.
    pub async fn run(
        &self,
        workflow_id: &str,
        inputs: Map<String, Value>,
        options: RunOptions,
    ) -> Result<RunResult> {
        let definition = self.definition(workflow_id).await?;

        let context = RunContext {
            run_id: Uuid::new_v4(),
            workflow_id: definition.id.clone(),
            agent_id: definition.agent_id.clone(),
            session_id: options.session_id.unwrap_or_else(default_session_id),
            user_id: options.user_id.unwrap_or_else(|| DEFAULT_USER.to_string()),
            inputs: Value::Object(inputs.clone()),
            started_at: Utc::now(),
            iterations: 0,
        };

        let mut state = WorkflowState::new(inputs);
        state.hitl.enabled = options.hitl_enabled;
        state.hitl.autonomous_mode = options.autonomous_mode;

        info!(
            run_id = %context.run_id,
            agent_id = %context.agent_id,
            session_id = %context.session_id,
            hitl_enabled = options.hitl_enabled,
            autonomous_mode = options.autonomous_mode,
            "Starting workflow run"
        );

        let entry = Target::Step(definition.entry_point.clone());
        self.drive(&definition, context, state, entry).await
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        mut context: RunContext,
        mut state: WorkflowState,
        start: Target,
    ) -> Result<RunResult> {
        let mut next = start;

        loop {
            let current = match next {
                Target::End => return Ok(self.complete(definition, context, state).await),
                Target::Suspend => return self.suspend(definition, context, state).await,
                Target::Step(id) => id,
            };

            // -------------------------------------------------
            // 1. Iteration guard (spans suspensions)
            // -------------------------------------------------
            if context.iterations >= definition.config.max_iterations {
                let err = WorkflowError::IterationLimitExceeded(definition.config.max_iterations);
                return Ok(self.abort(definition, context, state, err).await);
            }
            context.iterations += 1;

            let node = match definition.node(&current) {
                Some(node) => node,
                None => {
                    let err = WorkflowError::Validation(format!("unknown step '{}'", current));
                    return Ok(self.abort(definition, context, state, err).await);
                }
            };

            // -------------------------------------------------
            // 2. Step execution with retry
            // -------------------------------------------------
            state = match self.execute_step(definition, &context, node, &state).await {
                Ok(next_state) => next_state,
                Err(err) => return Ok(self.abort(definition, context, state, err).await),
            };

            // -------------------------------------------------
            // 3. Edge resolution
            // -------------------------------------------------
            next = match resolve_next(definition, node, &state) {
                Ok(target) => target,
                Err(err) => return Ok(self.abort(definition, context, state, err).await),
            };

            debug!(
                run_id = %context.run_id,
                step = %node.id,
                next = %next,
                iteration = context.iterations,
                "Step complete"
            );
        }
    }

    async fn execute_step(
        &self,
        definition: &WorkflowDefinition,
        context: &RunContext,
        node: &Node,
        state: &WorkflowState,
    ) -> Result<WorkflowState> {
        let policy = &definition.config.retry_policy;
        let step_timeout = definition.config.step_timeout();
        let mut failures: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let outcome = match tokio::time::timeout(step_timeout, node.step.run(state.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StepError::retryable(format!(
                    "timed out after {}s",
                    definition.config.timeout_seconds
                ))),
            };

            match outcome {
                Ok(mut next) => {
                    if !next.extends_trace_of(state) {
                        return Err(WorkflowError::StepExecution {
                            step: node.id.clone(),
                            message: "step rewrote the reasoning trace".to_string(),
                            retryable: false,
                            attempts: attempt,
                        });
                    }
                    if next.trace().len() == state.trace().len() {
                        next.record(format!("{}: completed", node.name));
                    }
                    for (i, message) in failures.iter().enumerate() {
                        next.record(format!(
                            "RETRY: {} attempt {} failed: {}",
                            node.name,
                            i + 1,
                            message
                        ));
                    }
                    return Ok(next);
                }
                Err(e) if e.retryable && attempt <= policy.max_retries => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        run_id = %context.run_id,
                        step = %node.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    failures.push(e.message);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        run_id = %context.run_id,
                        step = %node.id,
                        attempt,
                        retryable = e.retryable,
                        error = %e,
                        "Step failed"
                    );
                    return Err(WorkflowError::StepExecution {
                        step: node.id.clone(),
                        message: e.message,
                        retryable: e.retryable,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    // =============================
    // Suspension
    // =============================

    async fn suspend(
        &self,
        definition: &WorkflowDefinition,
        context: RunContext,
        mut state: WorkflowState,
    ) -> Result<RunResult> {
        let approval = match &definition.approval {
            Some(approval) => approval,
            None => {
                let err = WorkflowError::Validation("SUSPEND reached without an approval block".into());
                return Ok(self.abort(definition, context, state, err).await);
            }
        };

        let now = Utc::now();
        let description = state
            .get_str(&approval.description_key)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} requires approval", definition.id));

        let decision = Decision {
            id: Uuid::new_v4(),
            run_id: context.run_id,
            agent_id: context.agent_id.clone(),
            session_id: context.session_id.clone(),
            user_id: context.user_id.clone(),
            decision_type: approval.decision_type.clone(),
            description,
            data: state.snapshot(),
            created_at: now,
            timeout_seconds: definition.config.hitl_timeout_seconds,
            status: DecisionStatus::Pending,
            resolved_at: None,
            resolution_reason: None,
            comment: None,
        };

        state.hitl.required = true;
        state.hitl.decision_id = Some(decision.id);
        state.hitl.status = Some(DecisionStatus::Pending);
        state.hitl.comment = None;
        state.hitl.cycles += 1;

        let run_id = context.run_id;
        let iterations = context.iterations;
        let trace = state.trace().to_vec();

        // Park before publishing the decision so any resolver finds the run.
        self.runs
            .park(SuspendedRun {
                decision_id: decision.id,
                context,
                state,
                suspended_at: now,
            })
            .await?;

        if let Err(e) = self.decisions.insert(decision.clone()).await {
            self.runs.take(decision.id).await?;
            return Err(e);
        }

        info!(
            run_id = %run_id,
            decision_id = %decision.id,
            decision_type = %decision.decision_type,
            iterations,
            "Run suspended for approval"
        );

        Ok(RunResult::Suspended {
            run_id,
            decision,
            trace,
        })
    }

    // =============================
    // Resolution
    // =============================

    pub async fn approve(&self, decision_id: Uuid, comment: Option<String>) -> Result<Resolution> {
        self.resolve(decision_id, DecisionStatus::Approved, comment, Utc::now())
            .await
    }

    pub async fn reject(&self, decision_id: Uuid, comment: Option<String>) -> Result<Resolution> {
        self.resolve(decision_id, DecisionStatus::Rejected, comment, Utc::now())
            .await
    }

    /// Resolve every PENDING decision whose deadline is at or before `now`.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<Resolution>> {
        let expired = self.decisions.expired(now).await?;
        self.resolve_all(expired, DecisionStatus::Timeout, now).await
    }

    /// Bypass sweep: every PENDING decision of the session becomes BYPASSED.
    pub async fn enable_autonomous_mode(&self, session_id: &str) -> Result<Vec<Resolution>> {
        let pending = self.decisions.pending_for_session(session_id).await?;
        info!(session_id, pending = pending.len(), "Autonomous mode enabled");
        self.resolve_all(pending, DecisionStatus::Bypassed, Utc::now())
            .await
    }

    async fn resolve_all(
        &self,
        decisions: Vec<Decision>,
        to: DecisionStatus,
        at: DateTime<Utc>,
    ) -> Result<Vec<Resolution>> {
        let mut resolutions = Vec::with_capacity(decisions.len());
        for decision in decisions {
            match self.resolve(decision.id, to, None, at).await {
                Ok(resolution) => resolutions.push(resolution),
                Err(e) => warn!(decision_id = %decision.id, status = %to, error = %e, "Sweep could not resolve decision"),
            }
        }
        Ok(resolutions)
    }

    async fn resolve(
        &self,
        decision_id: Uuid,
        to: DecisionStatus,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Resolution> {
        let decision = match self.decisions.transition(decision_id, to, comment, at).await {
            Ok(decision) => decision,
            Err(WorkflowError::DecisionConflict(current)) => {
                debug!(
                    decision_id = %decision_id,
                    requested = %to,
                    current = %current.status,
                    "Decision already resolved"
                );
                return Ok(Resolution {
                    decision: *current,
                    outcome: None,
                });
            }
            Err(e) => return Err(e),
        };

        info!(
            decision_id = %decision.id,
            run_id = %decision.run_id,
            status = %decision.status,
            "Decision resolved"
        );

        let outcome = self.resume(&decision).await?;
        Ok(Resolution {
            decision,
            outcome: Some(outcome),
        })
    }

    async fn resume(&self, decision: &Decision) -> Result<RunResult> {
        let parked = self
            .runs
            .take(decision.id)
            .await?
            .ok_or(WorkflowError::RunNotFound(decision.id))?;

        let definition = self.definition(&parked.context.workflow_id).await?;
        let mut state = parked.state;
        state.hitl.status = Some(decision.status);
        state.hitl.comment = decision.comment.clone();

        if decision.status == DecisionStatus::Bypassed {
            state.record(format!(
                "Human review bypassed: {}",
                decision.resolution_reason.as_deref().unwrap_or("autonomous mode")
            ));
            return Ok(self.complete(&definition, parked.context, state).await);
        }

        let resume_at = match &definition.approval {
            Some(approval) => Target::Step(approval.resolve_at.clone()),
            None => {
                let err = WorkflowError::Validation(format!(
                    "workflow '{}' has no review step to resume at",
                    definition.id
                ));
                return Ok(self.abort(&definition, parked.context, state, err).await);
            }
        };

        self.drive(&definition, parked.context, state, resume_at).await
    }

    // =============================
    // Queries
    // =============================

    pub async fn get_decision(&self, decision_id: Uuid) -> Result<Decision> {
        self.decisions
            .get(decision_id)
            .await?
            .ok_or(WorkflowError::DecisionNotFound(decision_id))
    }

    pub async fn list_pending(&self, agent_id: Option<&str>) -> Result<Vec<Decision>> {
        self.decisions.list_pending(agent_id).await
    }

    pub async fn history(&self, agent_id: Option<&str>, limit: usize) -> Result<Vec<Decision>> {
        self.decisions.history(agent_id, limit).await
    }

    pub async fn suspended_runs(&self) -> Result<usize> {
        self.runs.count().await
    }

    // =============================
    // Termination
    // =============================

    async fn complete(
        &self,
        definition: &WorkflowDefinition,
        context: RunContext,
        state: WorkflowState,
    ) -> RunResult {
        info!(
            run_id = %context.run_id,
            agent_id = %context.agent_id,
            iterations = context.iterations,
            hitl_required = state.hitl.required,
            "Run completed"
        );
        self.write_audit(definition, &context, &state, RunOutcome::Completed, None)
            .await;
        RunResult::Completed {
            run_id: context.run_id,
            state,
        }
    }

    async fn abort(
        &self,
        definition: &WorkflowDefinition,
        context: RunContext,
        mut state: WorkflowState,
        err: WorkflowError,
    ) -> RunResult {
        error!(
            run_id = %context.run_id,
            agent_id = %context.agent_id,
            kind = err.kind(),
            error = %err,
            "Run aborted"
        );
        state.record(format!("ABORTED: {}: {}", err.kind(), err));
        self.write_audit(definition, &context, &state, RunOutcome::Aborted, Some(&err))
            .await;
        RunResult::Aborted {
            run_id: context.run_id,
            error: err,
            state,
        }
    }

    /// Audit failures are reported, never raised.
    async fn write_audit(
        &self,
        definition: &WorkflowDefinition,
        context: &RunContext,
        state: &WorkflowState,
        outcome: RunOutcome,
        err: Option<&WorkflowError>,
    ) {
        let now = Utc::now();
        let record = AuditRecord {
            audit_id: Uuid::new_v4(),
            timestamp: now,
            agent_id: context.agent_id.clone(),
            workflow_id: context.workflow_id.clone(),
            session_id: context.session_id.clone(),
            run_id: context.run_id,
            input_hash: compute_input_hash(&context.inputs),
            inputs: context.inputs.clone(),
            reasoning_trace: state.trace().to_vec(),
            final_state: state.snapshot(),
            hitl_required: state.hitl.required,
            decision_id: state.hitl.decision_id,
            decision_outcome: state.hitl.status,
            outcome,
            error_kind: err.map(|e| e.kind().to_string()),
            error: err.map(|e| e.to_string()),
            elapsed_ms: (now - context.started_at).num_milliseconds().max(0) as u64,
        };

        let report = self
            .audit
            .record(&definition.config.audit_logging, &record)
            .await;
        for failure in &report.failures {
            warn!(
                run_id = %context.run_id,
                agent_id = %context.agent_id,
                error = %failure,
                "Audit write failed"
            );
        }
    }
}

fn resolve_next(
    definition: &WorkflowDefinition,
    node: &Node,
    state: &WorkflowState,
) -> Result<Target> {
    match definition.transition(&node.id) {
        None => Ok(Target::End),
        Some(Transition::Direct(target)) => Ok(target.clone()),
        Some(Transition::Conditional {
            condition_ref,
            condition,
            branches,
        }) => {
            let key = condition.evaluate(state);
            debug!(step = %node.id, condition = %condition_ref, branch = %key, "Condition evaluated");
            branches
                .get(&key)
                .cloned()
                .ok_or_else(|| WorkflowError::UnmappedBranch {
                    step: node.id.clone(),
                    condition: condition_ref.clone(),
                    branch: key,
                })
        }
    }
}

/// Periodically resolve expired decisions as TIMEOUT.
pub fn spawn_timeout_sweeper(engine: Arc<WorkflowEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match engine.sweep_timeouts(Utc::now()).await {
                Ok(resolved) if !resolved.is_empty() => {
                    info!(count = resolved.len(), "Pending decisions timed out");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Timeout sweep failed"),
            }
        }
    })
}
