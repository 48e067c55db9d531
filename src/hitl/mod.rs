//! Human-in-the-loop decisions
//!
//! `DecisionStore` owns every `Decision` and is the only place a decision
//! leaves PENDING. `transition` is a compare-and-set under the store's write
//! lock, so racing approve / reject / timeout / bypass calls on one id
//! produce exactly one winner; the rest get `DecisionConflict` carrying the
//! winner's terminal record.

use crate::audit::{read_array, write_array};
use crate::error::{Result, WorkflowError};
use crate::models::{Decision, DecisionStatus};
use crate::state::WorkflowState;
use crate::steps::{BranchKey, FnCondition};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const HITL_REQUIRED: &str = "hitl_required";
pub const NO_HITL: &str = "no_hitl";

pub const APPROVED: &str = "approved";
pub const REJECTED: &str = "rejected";
pub const PENDING: &str = "pending";

/// Registry id of the shared resolution condition.
pub const CHECK_APPROVAL: &str = "hitl.check_approval";

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Trait for decision persistence
#[async_trait::async_trait]
pub trait DecisionStore: Send + Sync {
    async fn insert(&self, decision: Decision) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Decision>>;

    /// Move a PENDING decision to `to`. Returns the updated decision, or
    /// `DecisionConflict` with the current record if it was already terminal.
    async fn transition(
        &self,
        id: Uuid,
        to: DecisionStatus,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Decision>;

    async fn list_pending(&self, agent_id: Option<&str>) -> Result<Vec<Decision>>;

    async fn pending_for_session(&self, session_id: &str) -> Result<Vec<Decision>>;

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Decision>>;

    /// Resolved decisions, newest first.
    async fn history(&self, agent_id: Option<&str>, limit: usize) -> Result<Vec<Decision>>;
}

/// In-memory decision store
pub struct InMemoryDecisionStore {
    decisions: Arc<RwLock<HashMap<Uuid, Decision>>>,
}

impl InMemoryDecisionStore {
    pub fn new() -> Self {
        Self {
            decisions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_decisions(decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            decisions: Arc::new(RwLock::new(
                decisions.into_iter().map(|d| (d.id, d)).collect(),
            )),
        }
    }

    /// Every decision, oldest first.
    pub async fn all(&self) -> Vec<Decision> {
        let mut all: Vec<Decision> = self.decisions.read().await.values().cloned().collect();
        all.sort_by_key(|d| d.created_at);
        all
    }

    async fn filter_pending<F>(&self, keep: F) -> Vec<Decision>
    where
        F: Fn(&Decision) -> bool,
    {
        let decisions = self.decisions.read().await;
        let mut out: Vec<Decision> = decisions
            .values()
            .filter(|d| d.status == DecisionStatus::Pending && keep(d))
            .cloned()
            .collect();
        out.sort_by_key(|d| d.created_at);
        out
    }
}

impl Default for InMemoryDecisionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DecisionStore for InMemoryDecisionStore {
    async fn insert(&self, decision: Decision) -> Result<()> {
        let mut decisions = self.decisions.write().await;
        if decisions.contains_key(&decision.id) {
            return Err(WorkflowError::Validation(format!(
                "decision {} already exists",
                decision.id
            )));
        }
        debug!(decision_id = %decision.id, agent_id = %decision.agent_id, "Decision created");
        decisions.insert(decision.id, decision);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Decision>> {
        Ok(self.decisions.read().await.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        to: DecisionStatus,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Decision> {
        let mut decisions = self.decisions.write().await;
        let decision = decisions
            .get_mut(&id)
            .ok_or(WorkflowError::DecisionNotFound(id))?;
        decision.resolve(to, comment, at)?;
        debug!(decision_id = %id, status = %to, "Decision resolved");
        Ok(decision.clone())
    }

    async fn list_pending(&self, agent_id: Option<&str>) -> Result<Vec<Decision>> {
        Ok(self
            .filter_pending(|d| agent_id.map_or(true, |a| d.agent_id == a))
            .await)
    }

    async fn pending_for_session(&self, session_id: &str) -> Result<Vec<Decision>> {
        Ok(self.filter_pending(|d| d.session_id == session_id).await)
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Decision>> {
        Ok(self.filter_pending(|d| d.is_expired(now)).await)
    }

    async fn history(&self, agent_id: Option<&str>, limit: usize) -> Result<Vec<Decision>> {
        let decisions = self.decisions.read().await;
        let mut resolved: Vec<Decision> = decisions
            .values()
            .filter(|d| d.status.is_terminal())
            .filter(|d| agent_id.map_or(true, |a| d.agent_id == a))
            .cloned()
            .collect();
        resolved.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at));
        resolved.truncate(limit);
        Ok(resolved)
    }
}

/// Decision store persisted as one JSON array under `dir`.
///
/// The file is rewritten after every insert and transition, so decisions
/// (pending and resolved) survive a restart.
pub struct FileDecisionStore {
    path: PathBuf,
    inner: InMemoryDecisionStore,
    write_lock: Mutex<()>,
}

impl FileDecisionStore {
    pub const FILE_NAME: &'static str = "hitl_decisions.json";

    /// Open the store, reloading whatever the previous process saved.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(Self::FILE_NAME);
        let saved: Vec<Decision> = read_array(&path).await?;
        let pending = saved.iter().filter(|d| !d.status.is_terminal()).count();
        info!(path = %path.display(), decisions = saved.len(), pending, "Decision store loaded");

        Ok(Self {
            path,
            inner: InMemoryDecisionStore::with_decisions(saved),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_array(&self.path, &self.inner.all().await).await
    }
}

#[async_trait::async_trait]
impl DecisionStore for FileDecisionStore {
    async fn insert(&self, decision: Decision) -> Result<()> {
        let id = decision.id;
        self.inner.insert(decision).await?;
        if let Err(e) = self.save().await {
            // Not durable, so not published.
            self.inner.decisions.write().await.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Decision>> {
        self.inner.get(id).await
    }

    async fn transition(
        &self,
        id: Uuid,
        to: DecisionStatus,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Decision> {
        let decision = self.inner.transition(id, to, comment, at).await?;
        // The transition already has a winner; a failed save must not undo it.
        if let Err(e) = self.save().await {
            warn!(decision_id = %id, error = %e, "Resolved decision not persisted");
        }
        Ok(decision)
    }

    async fn list_pending(&self, agent_id: Option<&str>) -> Result<Vec<Decision>> {
        self.inner.list_pending(agent_id).await
    }

    async fn pending_for_session(&self, session_id: &str) -> Result<Vec<Decision>> {
        self.inner.pending_for_session(session_id).await
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Decision>> {
        self.inner.expired(now).await
    }

    async fn history(&self, agent_id: Option<&str>, limit: usize) -> Result<Vec<Decision>> {
        self.inner.history(agent_id, limit).await
    }
}

//
// ================= Gate conditions =================
//

/// Gating condition: `hitl_required` when `criteria` holds, unless HITL is
/// off or the run is autonomous.
pub fn approval_gate<F>(criteria: F) -> FnCondition
where
    F: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
{
    FnCondition::new(&[HITL_REQUIRED, NO_HITL], move |state| {
        let key = if !state.hitl.enabled || state.hitl.autonomous_mode {
            NO_HITL
        } else if criteria(state) {
            HITL_REQUIRED
        } else {
            NO_HITL
        };
        BranchKey::from(key)
    })
}

/// Resolution condition shared by every reviewed workflow.
pub fn check_approval() -> FnCondition {
    FnCondition::new(&[APPROVED, REJECTED, PENDING], |state| {
        let key = match state.hitl.status {
            Some(DecisionStatus::Approved) => APPROVED,
            Some(DecisionStatus::Rejected) => REJECTED,
            _ => PENDING,
        };
        BranchKey::from(key)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::Condition;
    use chrono::Duration;
    use serde_json::Value;

    fn decision(agent: &str, session: &str, timeout_seconds: u64) -> Decision {
        Decision {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            agent_id: agent.to_string(),
            session_id: session.to_string(),
            user_id: "default_user".to_string(),
            decision_type: "portfolio_approval".to_string(),
            description: "review".to_string(),
            data: Value::Null,
            created_at: Utc::now(),
            timeout_seconds,
            status: DecisionStatus::Pending,
            resolved_at: None,
            resolution_reason: None,
            comment: None,
        }
    }

    #[tokio::test]
    async fn test_transition_has_one_winner() {
        let store = InMemoryDecisionStore::new();
        let d = decision("portfolio_optimizer", "s1", 300);
        let id = d.id;
        store.insert(d).await.unwrap();

        let won = store
            .transition(id, DecisionStatus::Approved, Some("lgtm".into()), Utc::now())
            .await
            .unwrap();
        assert_eq!(won.status, DecisionStatus::Approved);

        match store
            .transition(id, DecisionStatus::Rejected, None, Utc::now())
            .await
        {
            Err(WorkflowError::DecisionConflict(current)) => {
                assert_eq!(current.status, DecisionStatus::Approved);
                assert_eq!(current.comment.as_deref(), Some("lgtm"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        assert!(matches!(
            store
                .transition(Uuid::new_v4(), DecisionStatus::Approved, None, Utc::now())
                .await,
            Err(WorkflowError::DecisionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listing_and_history() {
        let store = InMemoryDecisionStore::new();
        let a = decision("portfolio_optimizer", "s1", 300);
        let b = decision("index_scraper", "s1", 300);
        let c = decision("index_scraper", "s2", 10);
        let (a_id, c_id) = (a.id, c.id);
        for d in [a, b, c] {
            store.insert(d).await.unwrap();
        }

        assert_eq!(store.list_pending(None).await.unwrap().len(), 3);
        assert_eq!(store.list_pending(Some("index_scraper")).await.unwrap().len(), 2);
        assert_eq!(store.pending_for_session("s1").await.unwrap().len(), 2);

        let later = Utc::now() + Duration::seconds(60);
        let expired = store.expired(later).await.unwrap();
        assert_eq!(expired.iter().map(|d| d.id).collect::<Vec<_>>(), vec![c_id]);

        store
            .transition(a_id, DecisionStatus::Rejected, None, Utc::now())
            .await
            .unwrap();
        store
            .transition(c_id, DecisionStatus::Timeout, None, later)
            .await
            .unwrap();

        let history = store.history(None, DEFAULT_HISTORY_LIMIT).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, c_id);
        assert_eq!(
            history[0].resolution_reason.as_deref(),
            Some("Timed out after 10 seconds")
        );
        assert_eq!(store.history(Some("portfolio_optimizer"), 1).await.unwrap().len(), 1);
        assert_eq!(store.list_pending(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_reloads_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let waiting = decision("portfolio_optimizer", "s1", 300);
        let resolved = decision("compliance_logger", "s1", 300);
        let (waiting_id, resolved_id) = (waiting.id, resolved.id);

        let store = FileDecisionStore::open(dir.path()).await.unwrap();
        store.insert(waiting).await.unwrap();
        store.insert(resolved).await.unwrap();
        store
            .transition(resolved_id, DecisionStatus::Rejected, Some("no".into()), Utc::now())
            .await
            .unwrap();
        assert!(store.path().exists());
        drop(store);

        let reopened = FileDecisionStore::open(dir.path()).await.unwrap();
        let pending = reopened.list_pending(None).await.unwrap();
        assert_eq!(pending.iter().map(|d| d.id).collect::<Vec<_>>(), vec![waiting_id]);

        let history = reopened.history(None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].comment.as_deref(), Some("no"));

        // Resolved before the restart, still resolved after it
        assert!(matches!(
            reopened
                .transition(resolved_id, DecisionStatus::Approved, None, Utc::now())
                .await,
            Err(WorkflowError::DecisionConflict(_))
        ));
    }

    #[test]
    fn test_gate_respects_mode() {
        let gate = approval_gate(|_| true);
        let mut state = WorkflowState::default();

        assert_eq!(gate.evaluate(&state), NO_HITL);

        state.hitl.enabled = true;
        assert_eq!(gate.evaluate(&state), HITL_REQUIRED);

        state.hitl.autonomous_mode = true;
        assert_eq!(gate.evaluate(&state), NO_HITL);
    }

    #[test]
    fn test_check_approval_routes_timeout_to_pending() {
        let condition = check_approval();
        let mut state = WorkflowState::default();
        for (status, key) in [
            (DecisionStatus::Approved, APPROVED),
            (DecisionStatus::Rejected, REJECTED),
            (DecisionStatus::Timeout, PENDING),
            (DecisionStatus::Pending, PENDING),
        ] {
            state.hitl.status = Some(status);
            assert_eq!(condition.evaluate(&state), key);
        }
    }
}
