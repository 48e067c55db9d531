//! Run state and suspended-run persistence
//!
//! A `WorkflowState` belongs to exactly one in-flight run. When a run
//! suspends at a HITL gate its state is parked in a `RunStore` keyed by
//! the decision id, so a later resume can pick it up from any caller.
//! `FileRunStore` keeps parked runs across restarts.

use crate::audit::{read_array, write_array};
use crate::models::DecisionStatus;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// HITL facts carried with the state so conditions can stay pure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HitlContext {
    pub enabled: bool,
    pub autonomous_mode: bool,
    /// Set once any gate in this run has raised a decision
    pub required: bool,
    pub decision_id: Option<Uuid>,
    pub status: Option<DecisionStatus>,
    pub comment: Option<String>,
    /// Number of decisions raised so far (one per review cycle)
    pub cycles: u32,
}

/// Append-only reasoning trace plus a key/value bag of step outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    trace: Vec<String>,
    values: Map<String, Value>,
    pub hitl: HitlContext,
}

impl WorkflowState {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            trace: Vec::new(),
            values: inputs,
            hitl: HitlContext::default(),
        }
    }

    // =============================
    // Reasoning trace
    // =============================

    pub fn record(&mut self, note: impl Into<String>) {
        self.trace.push(note.into());
    }

    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    /// True when `self` keeps every entry of `earlier` in place.
    pub fn extends_trace_of(&self, earlier: &WorkflowState) -> bool {
        self.trace.len() >= earlier.trace.len()
            && self.trace[..earlier.trace.len()] == earlier.trace[..]
    }

    // =============================
    // Value bag
    // =============================

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Number at `path` inside an object value, e.g. `("portfolio", "risk_score")`
    pub fn get_nested_f64(&self, key: &str, field: &str) -> Option<f64> {
        self.values
            .get(key)
            .and_then(|v| v.get(field))
            .and_then(Value::as_f64)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn snapshot(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

/// Bookkeeping that survives a suspension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub agent_id: String,
    pub session_id: String,
    pub user_id: String,
    pub inputs: Value,
    pub started_at: DateTime<Utc>,
    pub iterations: u32,
}

/// A run parked at a HITL gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedRun {
    pub decision_id: Uuid,
    pub context: RunContext,
    pub state: WorkflowState,
    pub suspended_at: DateTime<Utc>,
}

/// Trait for suspended-run persistence
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    async fn park(&self, run: SuspendedRun) -> Result<()>;
    /// Remove and return the run; only the caller that wins a decision
    /// transition calls this.
    async fn take(&self, decision_id: Uuid) -> Result<Option<SuspendedRun>>;
    async fn get(&self, decision_id: Uuid) -> Result<Option<SuspendedRun>>;
    async fn count(&self) -> Result<usize>;
}

/// In-memory run store for development
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<Uuid, SuspendedRun>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn all(&self) -> Vec<SuspendedRun> {
        let mut all: Vec<SuspendedRun> = self.runs.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.suspended_at);
        all
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn park(&self, run: SuspendedRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.insert(run.decision_id, run);
        Ok(())
    }

    async fn take(&self, decision_id: Uuid) -> Result<Option<SuspendedRun>> {
        let mut runs = self.runs.write().await;
        Ok(runs.remove(&decision_id))
    }

    async fn get(&self, decision_id: Uuid) -> Result<Option<SuspendedRun>> {
        let runs = self.runs.read().await;
        Ok(runs.get(&decision_id).cloned())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.runs.read().await.len())
    }
}

/// Run store persisted as one JSON array of parked runs under `dir`.
pub struct FileRunStore {
    path: PathBuf,
    inner: InMemoryRunStore,
    write_lock: Mutex<()>,
}

impl FileRunStore {
    pub const FILE_NAME: &'static str = "suspended_runs.json";

    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(Self::FILE_NAME);
        let saved: Vec<SuspendedRun> = read_array(&path).await?;
        info!(path = %path.display(), runs = saved.len(), "Run store loaded");

        let inner = InMemoryRunStore::new();
        {
            let mut runs = inner.runs.write().await;
            runs.extend(saved.into_iter().map(|r| (r.decision_id, r)));
        }
        Ok(Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    async fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_array(&self.path, &self.inner.all().await).await
    }
}

#[async_trait::async_trait]
impl RunStore for FileRunStore {
    async fn park(&self, run: SuspendedRun) -> Result<()> {
        let decision_id = run.decision_id;
        self.inner.park(run).await?;
        if let Err(e) = self.save().await {
            self.inner.take(decision_id).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn take(&self, decision_id: Uuid) -> Result<Option<SuspendedRun>> {
        let taken = self.inner.take(decision_id).await?;
        if taken.is_some() {
            if let Err(e) = self.save().await {
                warn!(decision_id = %decision_id, error = %e, "Resumed run still on disk");
            }
        }
        Ok(taken)
    }

    async fn get(&self, decision_id: Uuid) -> Result<Option<SuspendedRun>> {
        self.inner.get(decision_id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trace_prefix_check() {
        let mut before = WorkflowState::default();
        before.record("one");

        let mut after = before.clone();
        after.record("two");
        assert!(after.extends_trace_of(&before));

        let rewritten = WorkflowState::default();
        assert!(!rewritten.extends_trace_of(&before));
    }

    #[test]
    fn test_value_accessors() {
        let mut inputs = Map::new();
        inputs.insert("budget".into(), json!(50000.0));
        let mut state = WorkflowState::new(inputs);
        state.set("portfolio", json!({ "risk_score": 2.1 }));

        assert_eq!(state.get_f64("budget"), Some(50000.0));
        assert_eq!(state.get_nested_f64("portfolio", "risk_score"), Some(2.1));
        assert_eq!(state.get_str("missing"), None);
    }

    fn parked(decision_id: Uuid, iterations: u32) -> SuspendedRun {
        let mut state = WorkflowState::default();
        state.record("portfolio.analyze: completed");
        state.set("budget", json!(50000.0));
        SuspendedRun {
            decision_id,
            context: RunContext {
                run_id: Uuid::new_v4(),
                workflow_id: "wf".into(),
                agent_id: "agent".into(),
                session_id: "s".into(),
                user_id: "default_user".into(),
                inputs: json!({}),
                started_at: Utc::now(),
                iterations,
            },
            state,
            suspended_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_take_removes_run() {
        let store = InMemoryRunStore::new();
        let decision_id = Uuid::new_v4();
        store.park(parked(decision_id, 3)).await.unwrap();

        assert!(store.get(decision_id).await.unwrap().is_some());
        let taken = store.take(decision_id).await.unwrap();
        assert_eq!(taken.map(|r| r.context.iterations), Some(3));
        assert!(store.take(decision_id).await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (kept, resumed) = (Uuid::new_v4(), Uuid::new_v4());

        let store = FileRunStore::open(dir.path()).await.unwrap();
        store.park(parked(kept, 2)).await.unwrap();
        store.park(parked(resumed, 4)).await.unwrap();
        assert!(store.take(resumed).await.unwrap().is_some());
        drop(store);

        let reopened = FileRunStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        assert!(reopened.get(resumed).await.unwrap().is_none());

        let run = reopened.take(kept).await.unwrap().unwrap();
        assert_eq!(run.context.iterations, 2);
        assert_eq!(run.state.trace(), ["portfolio.analyze: completed"]);
        assert_eq!(run.state.get_f64("budget"), Some(50000.0));
    }
}
