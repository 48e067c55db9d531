//! Per-agent audit trail
//!
//! Every terminal run lands in two sinks for its agent: a JSON array document
//! (`{agent}_audit.json`) and a CSV table (`{agent}_decisions.csv`).
//! Workflows that name a violations key also append to
//! `{agent}_violations.json`. Writers of one agent are serialized by a
//! per-agent async mutex; different agents write concurrently. A failing sink
//! never blocks the others.

use crate::definition::AuditSpec;
use crate::error::WorkflowError;
use crate::models::AuditRecord;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// Records kept in the JSON document; older ones are dropped.
pub const MAX_DOCUMENT_RECORDS: usize = 1000;

/// Entries kept in the violations log.
pub const MAX_VIOLATION_ENTRIES: usize = 500;

/// Sink failures from one `record` call.
#[derive(Debug, Default)]
pub struct AuditReport {
    pub failures: Vec<WorkflowError>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// File-backed audit trail storage
pub struct AuditLog {
    root: PathBuf,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl AuditLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, agent_id: &str) -> PathBuf {
        self.root.join(format!("{}_audit.json", agent_id))
    }

    pub fn table_path(&self, agent_id: &str) -> PathBuf {
        self.root.join(format!("{}_decisions.csv", agent_id))
    }

    pub fn violations_path(&self, agent_id: &str) -> PathBuf {
        self.root.join(format!("{}_violations.json", agent_id))
    }

    async fn agent_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(agent_id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one terminal record to every sink configured for its agent.
    pub async fn record(&self, spec: &AuditSpec, record: &AuditRecord) -> AuditReport {
        let mut report = AuditReport::default();
        if !spec.enabled {
            return report;
        }
        if let Err(e) = check_agent_id(&record.agent_id) {
            report.failures.push(e);
            return report;
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
            report.failures.push(sink_error("directory", e));
            return report;
        }

        let lock = self.agent_lock(&record.agent_id).await;
        let _guard = lock.lock().await;

        if let Err(e) = self.append_document(record).await {
            report.failures.push(sink_error("document", e));
        }
        if let Err(e) = self.append_row(spec, record).await {
            report.failures.push(sink_error("table", e));
        }
        if let Some(key) = &spec.violations_key {
            if let Err(e) = self.append_violations(key, record).await {
                report.failures.push(sink_error("violations", e));
            }
        }
        report
    }

    async fn append_document(&self, record: &AuditRecord) -> Result<()> {
        let path = self.document_path(&record.agent_id);
        let mut records: Vec<Value> = read_array(&path).await?;
        records.push(serde_json::to_value(record)?);
        keep_latest(&mut records, MAX_DOCUMENT_RECORDS);
        write_array(&path, &records).await
    }

    async fn append_row(&self, spec: &AuditSpec, record: &AuditRecord) -> Result<()> {
        let path = self.table_path(&record.agent_id);
        let needs_header = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        let mut out = String::new();
        if needs_header {
            let mut header = vec!["timestamp".to_string()];
            header.extend(spec.input_columns.iter().cloned());
            header.push("num_outcomes".to_string());
            header.push("hitl_required".to_string());
            out.push_str(&csv_line(&header));
        }

        let mut row = vec![record.timestamp.to_rfc3339()];
        for column in &spec.input_columns {
            row.push(cell(record.inputs.get(column)));
        }
        let outcomes = spec
            .outcomes_key
            .as_deref()
            .and_then(|k| record.final_state.get(k))
            .map(count_outcomes)
            .unwrap_or(0);
        row.push(outcomes.to_string());
        row.push(record.hitl_required.to_string());
        out.push_str(&csv_line(&row));

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(out.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn append_violations(&self, key: &str, record: &AuditRecord) -> Result<()> {
        let found = match record.final_state.get(key).and_then(Value::as_array) {
            Some(v) if !v.is_empty() => v,
            _ => return Ok(()),
        };

        let path = self.violations_path(&record.agent_id);
        let mut entries: Vec<Value> = read_array(&path).await?;
        for violation in found {
            entries.push(json!({
                "timestamp": record.timestamp,
                "session_id": record.session_id,
                "run_id": record.run_id,
                "violation": violation,
            }));
        }
        keep_latest(&mut entries, MAX_VIOLATION_ENTRIES);
        write_array(&path, &entries).await
    }

    /// Records currently held in the agent's JSON document, oldest first.
    pub async fn read_records(&self, agent_id: &str) -> Result<Vec<AuditRecord>> {
        check_agent_id(agent_id)?;
        let raw: Vec<Value> = read_array(&self.document_path(agent_id)).await?;
        raw.into_iter()
            .map(|v| serde_json::from_value(v).map_err(WorkflowError::from))
            .collect()
    }

    pub async fn read_violations(&self, agent_id: &str) -> Result<Vec<Value>> {
        check_agent_id(agent_id)?;
        read_array(&self.violations_path(agent_id)).await
    }

    /// Verify a record's integrity via its input hash
    pub fn verify_integrity(&self, record: &AuditRecord) -> bool {
        compute_input_hash(&record.inputs) == record.input_hash
    }
}

/// Compute SHA256 hash of an input snapshot for integrity verification
/// Uses zero-copy streaming serialization into hasher
pub fn compute_input_hash(inputs: &Value) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), inputs).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//
// ================= File helpers =================
//

/// Agent ids become file names.
fn check_agent_id(agent_id: &str) -> Result<()> {
    let ok = !agent_id.is_empty()
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(WorkflowError::Validation(format!("invalid agent id '{}'", agent_id)))
    }
}

fn sink_error(sink: &str, e: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::AuditWrite(format!("{} sink: {}", sink, e))
}

pub(crate) async fn read_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) if raw.trim().is_empty() => Ok(Vec::new()),
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Whole-file rewrite through a sibling temp file so readers never see a
/// partial document.
pub(crate) async fn write_array<T: Serialize>(path: &Path, values: &[T]) -> Result<()> {
    let body = serde_json::to_vec_pretty(values)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn keep_latest(entries: &mut Vec<Value>, cap: usize) {
    if entries.len() > cap {
        let excess = entries.len() - cap;
        entries.drain(..excess);
    }
}

fn count_outcomes(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::Null => 0,
        _ => 1,
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| cell(Some(v)))
            .collect::<Vec<_>>()
            .join(";"),
        Some(other) => other.to_string(),
    }
}

fn csv_line(fields: &[String]) -> String {
    let escaped: Vec<String> = fields
        .iter()
        .map(|f| {
            if f.contains([',', '"', '\n', '\r']) {
                format!("\"{}\"", f.replace('"', "\"\""))
            } else {
                f.clone()
            }
        })
        .collect();
    format!("{}\n", escaped.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunOutcome;
    use chrono::Utc;
    use uuid::Uuid;

    fn spec() -> AuditSpec {
        AuditSpec {
            enabled: true,
            input_columns: vec!["budget".into(), "assets".into()],
            outcomes_key: Some("positions".into()),
            violations_key: Some("violations".into()),
        }
    }

    fn record(agent: &str, final_state: Value) -> AuditRecord {
        let inputs = json!({"budget": 50000, "assets": ["AAPL", "MSFT"]});
        AuditRecord {
            audit_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            agent_id: agent.to_string(),
            workflow_id: agent.to_string(),
            session_id: "session_test".to_string(),
            run_id: Uuid::new_v4(),
            input_hash: compute_input_hash(&inputs),
            inputs,
            reasoning_trace: vec!["step: done".into()],
            final_state,
            hitl_required: false,
            decision_id: None,
            decision_outcome: None,
            outcome: RunOutcome::Completed,
            error_kind: None,
            error: None,
            elapsed_ms: 3,
        }
    }

    #[tokio::test]
    async fn test_both_sinks_written() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());

        for _ in 0..2 {
            let report = log
                .record(&spec(), &record("portfolio_optimizer", json!({"positions": [1, 2, 3]})))
                .await;
            assert!(report.is_clean(), "{:?}", report);
        }

        let records = log.read_records("portfolio_optimizer").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(log.verify_integrity(&records[0]));

        let csv = std::fs::read_to_string(log.table_path("portfolio_optimizer")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "timestamp,budget,assets,num_outcomes,hitl_required");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with(",50000,AAPL;MSFT,3,false"));

        assert!(!log.violations_path("portfolio_optimizer").exists());
    }

    #[tokio::test]
    async fn test_violations_document() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());

        let state = json!({"violations": [{"type": "POSITION_LIMIT", "severity": "HIGH"}]});
        let report = log.record(&spec(), &record("compliance_logger", state)).await;
        assert!(report.is_clean());

        let violations = log.read_violations("compliance_logger").await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0]["violation"]["severity"], "HIGH");
        assert_eq!(violations[0]["session_id"], "session_test");
    }

    #[tokio::test]
    async fn test_corrupt_document_does_not_block_table() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        std::fs::write(log.document_path("index_scraper"), "not json").unwrap();

        let report = log.record(&spec(), &record("index_scraper", json!({}))).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind(), "audit_write");
        assert!(log.table_path("index_scraper").exists());
    }

    #[tokio::test]
    async fn test_tampered_inputs_fail_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        let mut rec = record("timing_advisor", json!({}));
        assert!(log.verify_integrity(&rec));
        rec.inputs = json!({"budget": 1});
        assert!(!log.verify_integrity(&rec));
    }

    #[tokio::test]
    async fn test_rejects_path_like_agent_ids() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        assert!(log.read_records("../etc").await.is_err());
        let report = log.record(&spec(), &record("../x", json!({}))).await;
        assert!(!report.is_clean());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_of_one_agent_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(AuditLog::new(dir.path()));

        let writers: Vec<_> = (0..20)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move {
                    let rec = record("portfolio_optimizer", json!({"positions": vec![0; i % 4]}));
                    log.record(&spec(), &rec).await
                })
            })
            .collect();
        for writer in writers {
            assert!(writer.await.unwrap().is_clean());
        }

        let records = log.read_records("portfolio_optimizer").await.unwrap();
        assert_eq!(records.len(), 20);
        let mut run_ids: Vec<Uuid> = records.iter().map(|r| r.run_id).collect();
        run_ids.sort();
        run_ids.dedup();
        assert_eq!(run_ids.len(), 20);

        let csv = std::fs::read_to_string(log.table_path("portfolio_optimizer")).unwrap();
        assert_eq!(csv.lines().count(), 21);
        assert_eq!(csv.matches("timestamp,").count(), 1);
    }

    #[tokio::test]
    async fn test_violations_log_keeps_latest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        let seeded: Vec<Value> = (0..MAX_VIOLATION_ENTRIES - 1)
            .map(|i| json!({"violation": {"seq": i}}))
            .collect();
        write_array(&log.violations_path("compliance_logger"), &seeded)
            .await
            .unwrap();

        let state = json!({"violations": [{"seq": "a"}, {"seq": "b"}, {"seq": "c"}]});
        assert!(log.record(&spec(), &record("compliance_logger", state)).await.is_clean());

        let entries = log.read_violations("compliance_logger").await.unwrap();
        assert_eq!(entries.len(), MAX_VIOLATION_ENTRIES);
        assert_eq!(entries[0]["violation"]["seq"], 2);
        assert_eq!(entries[MAX_VIOLATION_ENTRIES - 1]["violation"]["seq"], "c");
    }

    #[test]
    fn test_csv_escaping() {
        let line = csv_line(&["a,b".into(), "say \"hi\"".into(), "plain".into()]);
        assert_eq!(line, "\"a,b\",\"say \"\"hi\"\"\",plain\n");
    }
}
