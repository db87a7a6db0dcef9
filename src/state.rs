//! Session state document and its typed transitions.
//!
//! `state.json` is the authoritative record of a run. Mutations happen only
//! through the high-level transitions on `StateStore`; every transition is
//! persisted through an atomic tempfile + rename so external readers always
//! parse a complete document.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fsutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Initialized but not yet dispatched (parallel-block provider states)
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// Single-stage session
    Loop,
    /// Multi-stage session
    Pipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub index: usize,
    pub name: String,
    pub status: StageStatus,
    pub timestamp: DateTime<Utc>,
}

/// One committed iteration. `(iteration, stage)` pairs are unique: re-running
/// an iteration after a resume replaces the earlier failed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub decision: String,
    pub reason: String,
    pub summary: String,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub items_completed: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// The `decision`/`reason`/`summary`/work fields extracted from a status
/// document, ready to append to history.
#[derive(Debug, Clone, Default)]
pub struct HistoryPayload {
    pub decision: String,
    pub reason: String,
    pub summary: String,
    pub files_touched: Vec<String>,
    pub items_completed: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session: String,
    #[serde(rename = "type")]
    pub run_type: RunType,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub current_stage: usize,
    /// Last started iteration
    pub iteration: u32,
    /// Set while an agent invocation is mid-flight, null between iterations
    pub iteration_started: Option<DateTime<Utc>>,
    /// Last fully committed iteration
    pub iteration_completed: u32,
    pub stages: Vec<StageEntry>,
    pub history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,
}

impl SessionState {
    fn new(session: &str, run_type: RunType) -> Self {
        Self {
            session: session.to_string(),
            run_type,
            started_at: Utc::now(),
            resumed_at: None,
            completed_at: None,
            failed_at: None,
            status: RunStatus::Running,
            current_stage: 0,
            iteration: 0,
            iteration_started: None,
            iteration_completed: 0,
            stages: Vec::new(),
            history: Vec::new(),
            error: None,
            resume_from: None,
            completion_reason: None,
        }
    }

    /// History entries for one stage, in commit order.
    pub fn stage_history<'a>(&'a self, stage: &str) -> Vec<&'a HistoryEntry> {
        self.history.iter().filter(|h| h.stage == stage).collect()
    }

    /// The most recently committed decision for one stage.
    pub fn latest_decision(&self, stage: &str) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|h| h.stage == stage)
            .map(|h| h.decision.as_str())
    }
}

/// Owns `state.json` for one session scope and persists every transition.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: SessionState,
}

impl StateStore {
    /// Create or reopen the state document. Idempotent: an existing file is
    /// preserved, not reinitialized.
    pub fn init(state_file: &Path, session: &str, run_type: RunType) -> Result<Self> {
        if state_file.exists() {
            return Self::open(state_file);
        }
        let store = Self {
            path: state_file.to_path_buf(),
            state: SessionState::new(session, run_type),
        };
        store.save()?;
        Ok(store)
    }

    /// Open an existing state document; fails if absent.
    pub fn open(state_file: &Path) -> Result<Self> {
        let state: SessionState = fsutil::read_json(state_file)
            .with_context(|| format!("no session state at {}", state_file.display()))?;
        Ok(Self {
            path: state_file.to_path_buf(),
            state,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        fsutil::write_json_atomic(&self.path, &self.state)
    }

    /// Park a provider-scope state until its worker is dispatched.
    pub fn mark_pending(&mut self) -> Result<()> {
        self.state.status = RunStatus::Pending;
        self.save()
    }

    pub fn mark_iteration_started(&mut self, iteration: u32) -> Result<()> {
        self.state.iteration = iteration;
        self.state.iteration_started = Some(Utc::now());
        self.state.status = RunStatus::Running;
        self.save()
    }

    pub fn mark_iteration_completed(&mut self, iteration: u32) -> Result<()> {
        self.state.iteration_completed = iteration;
        self.state.iteration_started = None;
        self.save()
    }

    /// Commit an iteration's outcome to history. Replaces any earlier entry
    /// for the same `(iteration, stage)` pair, which happens when a failed
    /// iteration is re-run after `--resume`.
    pub fn update_iteration(
        &mut self,
        iteration: u32,
        stage: &str,
        payload: HistoryPayload,
    ) -> Result<()> {
        let entry = HistoryEntry {
            iteration,
            stage: stage.to_string(),
            timestamp: Utc::now(),
            decision: payload.decision,
            reason: payload.reason,
            summary: payload.summary,
            files_touched: payload.files_touched,
            items_completed: payload.items_completed,
            errors: payload.errors,
        };
        if let Some(existing) = self
            .state
            .history
            .iter_mut()
            .find(|h| h.iteration == iteration && h.stage == stage)
        {
            *existing = entry;
        } else {
            self.state.history.push(entry);
        }
        self.save()
    }

    /// Upsert `stages[index]` and advance `current_stage`.
    pub fn update_stage(&mut self, index: usize, name: &str, status: StageStatus) -> Result<()> {
        let entry = StageEntry {
            index,
            name: name.to_string(),
            status,
            timestamp: Utc::now(),
        };
        if let Some(existing) = self.state.stages.iter_mut().find(|s| s.index == index) {
            *existing = entry;
        } else {
            self.state.stages.push(entry);
            self.state.stages.sort_by_key(|s| s.index);
        }
        self.state.current_stage = index;
        self.save()
    }

    /// Zero the iteration counters at the start of a fresh stage so a prior
    /// stage's indices cannot leak into resume logic.
    pub fn reset_iteration_counters(&mut self) -> Result<()> {
        self.state.iteration = 0;
        self.state.iteration_completed = 0;
        self.state.iteration_started = None;
        self.save()
    }

    pub fn mark_failed(&mut self, message: &str, error_type: &str) -> Result<()> {
        self.state.status = RunStatus::Failed;
        self.state.failed_at = Some(Utc::now());
        self.state.error = Some(ErrorEntry {
            error_type: error_type.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        self.state.resume_from = Some(self.state.iteration_completed + 1);
        self.save()
    }

    pub fn mark_complete(&mut self, reason: &str) -> Result<()> {
        self.state.status = RunStatus::Complete;
        self.state.completed_at = Some(Utc::now());
        self.state.completion_reason = Some(reason.to_string());
        self.save()
    }

    /// Reopen a failed session: back to running, error cleared, resume point
    /// preserved for audit.
    pub fn reset_for_resume(&mut self) -> Result<()> {
        self.state.status = RunStatus::Running;
        self.state.error = None;
        self.state.failed_at = None;
        self.state.resumed_at = Some(Utc::now());
        self.save()
    }

    /// First iteration a resumed run should execute.
    pub fn get_resume_iteration(&self) -> u32 {
        self.state.iteration_completed + 1
    }

    /// Stage index a resumed pipeline should re-enter.
    pub fn get_resume_stage(&self) -> usize {
        self.state.current_stage
    }

    pub fn is_stage_complete(&self, index: usize) -> bool {
        self.state
            .stages
            .iter()
            .any(|s| s.index == index && s.status == StageStatus::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> StateStore {
        StateStore::init(&temp.path().join("state.json"), "demo", RunType::Loop).unwrap()
    }

    fn payload(decision: &str) -> HistoryPayload {
        HistoryPayload {
            decision: decision.to_string(),
            reason: "r".to_string(),
            summary: "s".to_string(),
            ..HistoryPayload::default()
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut first = store(&temp);
        first.mark_iteration_started(3).unwrap();
        drop(first);

        let again =
            StateStore::init(&temp.path().join("state.json"), "demo", RunType::Loop).unwrap();
        assert_eq!(again.state().iteration, 3, "existing state must be preserved");
    }

    #[test]
    fn test_iteration_started_flag_lifecycle() {
        let temp = TempDir::new().unwrap();
        let mut store = store(&temp);

        store.mark_iteration_started(1).unwrap();
        assert!(store.state().iteration_started.is_some());
        assert_eq!(store.state().iteration, 1);

        store.mark_iteration_completed(1).unwrap();
        assert!(store.state().iteration_started.is_none());
        assert_eq!(store.state().iteration_completed, 1);
    }

    #[test]
    fn test_history_upsert_keeps_pairs_unique() {
        let temp = TempDir::new().unwrap();
        let mut store = store(&temp);
        store.update_iteration(1, "plan", payload("continue")).unwrap();
        store.update_iteration(2, "plan", payload("error")).unwrap();
        // Re-run of iteration 2 after resume replaces the error entry.
        store.update_iteration(2, "plan", payload("stop")).unwrap();

        assert_eq!(store.state().history.len(), 2);
        assert_eq!(store.state().history[1].decision, "stop");
    }

    #[test]
    fn test_mark_failed_sets_resume_point() {
        let temp = TempDir::new().unwrap();
        let mut store = store(&temp);
        store.mark_iteration_started(3).unwrap();
        store.mark_iteration_completed(2).unwrap();
        store.mark_failed("agent exited with code 137", "exit_code").unwrap();

        let state = store.state();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.failed_at.is_some());
        let error = state.error.as_ref().unwrap();
        assert_eq!(error.error_type, "exit_code");
        assert_eq!(state.resume_from, Some(3));
        assert_eq!(store.get_resume_iteration(), 3);
    }

    #[test]
    fn test_reset_for_resume_clears_error_keeps_audit() {
        let temp = TempDir::new().unwrap();
        let mut store = store(&temp);
        store.update_iteration(1, "", payload("continue")).unwrap();
        store.mark_iteration_completed(1).unwrap();
        store.mark_failed("boom", "unknown").unwrap();
        let history_len = store.state().history.len();

        store.reset_for_resume().unwrap();
        let state = store.state();
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.error.is_none());
        assert!(state.failed_at.is_none());
        assert!(state.resumed_at.is_some());
        assert_eq!(state.resume_from, Some(2), "resume_from preserved for audit");
        assert_eq!(state.history.len(), history_len);
    }

    #[test]
    fn test_reset_iteration_counters() {
        let temp = TempDir::new().unwrap();
        let mut store = store(&temp);
        store.mark_iteration_started(4).unwrap();
        store.mark_iteration_completed(4).unwrap();

        store.reset_iteration_counters().unwrap();
        let state = store.state();
        assert_eq!(state.iteration, 0);
        assert_eq!(state.iteration_completed, 0);
        assert!(state.iteration_started.is_none());
        assert_eq!(store.get_resume_iteration(), 1);
    }

    #[test]
    fn test_update_stage_upserts_and_tracks_current() {
        let temp = TempDir::new().unwrap();
        let mut store = store(&temp);
        store.update_stage(0, "plan", StageStatus::Running).unwrap();
        store.update_stage(0, "plan", StageStatus::Complete).unwrap();
        store.update_stage(1, "review", StageStatus::Running).unwrap();

        let state = store.state();
        assert_eq!(state.stages.len(), 2);
        assert_eq!(state.stages[0].status, StageStatus::Complete);
        assert_eq!(state.current_stage, 1);
        assert!(store.is_stage_complete(0));
        assert!(!store.is_stage_complete(1));
    }

    #[test]
    fn test_stage_history_filters_by_stage() {
        let temp = TempDir::new().unwrap();
        let mut store = store(&temp);
        store.update_iteration(1, "plan", payload("stop")).unwrap();
        store.update_iteration(1, "review", payload("continue")).unwrap();
        store.update_iteration(2, "review", payload("stop")).unwrap();

        let review = store.state().stage_history("review");
        assert_eq!(review.len(), 2);
        assert_eq!(store.state().latest_decision("review"), Some("stop"));
        assert_eq!(store.state().latest_decision("plan"), Some("stop"));
        assert_eq!(store.state().latest_decision("missing"), None);
    }

    #[test]
    fn test_round_trip_is_stable() {
        let temp = TempDir::new().unwrap();
        let mut store = store(&temp);
        store.update_iteration(1, "", payload("continue")).unwrap();
        store.mark_iteration_completed(1).unwrap();

        let first = std::fs::read_to_string(store.path()).unwrap();
        let reopened = StateStore::open(store.path()).unwrap();
        reopened.save().unwrap();
        let second = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(first, second);
    }
}
