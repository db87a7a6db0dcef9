//! Session identity and run-directory layout.
//!
//! A session owns one lock file, one run directory, and one state document.
//! All directory names under the run directory use zero-padded indices so
//! lexical sort equals chronological order.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::lock;
use crate::state::{RunStatus, SessionState};

static SESSION_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").unwrap());

/// Validate a session name before any filesystem work happens.
pub fn validate_session_name(name: &str) -> Result<()> {
    if SESSION_NAME_RE.is_match(name) {
        Ok(())
    } else {
        anyhow::bail!(
            "invalid session name '{name}': must match [a-zA-Z0-9_-] and be 1-64 characters"
        )
    }
}

/// Directory name for stage `index` named `name`: `stage-NN-<name>`.
pub fn stage_dir_name(index: usize, name: &str) -> String {
    format!("stage-{index:02}-{name}")
}

/// Directory name for a parallel block: `parallel-NN-<name>`.
pub fn parallel_dir_name(index: usize, name: &str) -> String {
    format!("parallel-{index:02}-{name}")
}

/// Directory name for iteration `i`: zero-padded to three digits.
pub fn iteration_dir_name(iteration: u32) -> String {
    format!("{iteration:03}")
}

/// Path layout of one session's run directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub session: String,
    run_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(sessions_root: &Path, session: &str) -> Self {
        Self {
            session: session.to_string(),
            run_dir: sessions_root.join(session),
        }
    }

    /// A layout rooted somewhere other than `<sessions-root>/<session>`;
    /// used for per-provider scopes inside parallel blocks.
    pub fn rooted_at(run_dir: &Path, session: &str) -> Self {
        Self {
            session: session.to_string(),
            run_dir: run_dir.to_path_buf(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn state_file(&self) -> PathBuf {
        self.run_dir.join("state.json")
    }

    pub fn pipeline_file(&self) -> PathBuf {
        self.run_dir.join("pipeline.yaml")
    }

    pub fn initial_inputs_file(&self) -> PathBuf {
        self.run_dir.join("initial-inputs.json")
    }

    /// Session-level progress file kept for tools that predate stage-local
    /// progress.md.
    pub fn legacy_progress_file(&self) -> PathBuf {
        self.run_dir.join(format!("progress-{}.md", self.session))
    }

    pub fn stage_dir(&self, index: usize, name: &str) -> PathBuf {
        self.run_dir.join(stage_dir_name(index, name))
    }

    pub fn parallel_dir(&self, index: usize, name: &str) -> PathBuf {
        self.run_dir.join(parallel_dir_name(index, name))
    }

    pub fn iteration_dir(&self, stage_dir: &Path, iteration: u32) -> PathBuf {
        stage_dir
            .join("iterations")
            .join(iteration_dir_name(iteration))
    }

    /// Locate an existing stage directory by stage name, ignoring its index
    /// prefix. Returns the lexically last match.
    pub fn find_stage_dir(&self, name: &str) -> Result<Option<PathBuf>> {
        let matches = crate::fsutil::sorted_entries(&self.run_dir, |n| {
            n.strip_prefix("stage-")
                .and_then(|rest| rest.split_once('-'))
                .is_some_and(|(_, stage_name)| stage_name == name)
        })?;
        Ok(matches.into_iter().last())
    }

    /// Locate an existing parallel block directory by block name.
    pub fn find_parallel_dir(&self, name: &str) -> Result<Option<PathBuf>> {
        let matches = crate::fsutil::sorted_entries(&self.run_dir, |n| {
            n.strip_prefix("parallel-")
                .and_then(|rest| rest.split_once('-'))
                .is_some_and(|(_, block_name)| block_name == name)
        })?;
        Ok(matches.into_iter().last())
    }
}

/// Classification of a session, cross-referencing lock and state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// No run directory and no state
    None,
    /// Lock held by a live process
    Active { pid: u32 },
    /// Failed, crashed, or abandoned mid-run
    Failed,
    /// Ran to completion
    Completed,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::None => "none",
            SessionStatus::Active { .. } => "active",
            SessionStatus::Failed => "failed",
            SessionStatus::Completed => "completed",
        }
    }
}

/// The single place lock and state are correlated.
///
/// lock present + live PID => active; lock present + dead PID => failed
/// (crashed); no lock + state still "running" => failed (crashed outside the
/// lock window); otherwise the state's own status.
pub fn classify_session(config: &Config, session: &str) -> Result<SessionStatus> {
    if let Some(record) = lock::read_lock(&config.locks_root(), session)? {
        if lock::pid_alive(record.pid) {
            return Ok(SessionStatus::Active { pid: record.pid });
        }
        return Ok(SessionStatus::Failed);
    }

    let paths = SessionPaths::new(&config.sessions_root(), session);
    let state_file = paths.state_file();
    if !state_file.exists() {
        return Ok(SessionStatus::None);
    }
    let state: SessionState = crate::fsutil::read_json(&state_file)
        .with_context(|| format!("failed to read state for session '{session}'"))?;
    Ok(match state.status {
        RunStatus::Pending | RunStatus::Running | RunStatus::Failed => SessionStatus::Failed,
        RunStatus::Complete => SessionStatus::Completed,
    })
}
