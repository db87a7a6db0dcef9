//! Termination strategies.
//!
//! Consulted by the iteration driver after each iteration has been committed
//! to history (and optionally before the first invocation when a stage sets
//! `check_before`). Strategies read decisions only from committed history —
//! the current status file is already in there, so counting it separately
//! would double-count and terminate one stop too early.

use anyhow::Result;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::context::RunScope;
use crate::stage::TerminationSpec;
use crate::state::SessionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Stop { reason: String },
}

#[async_trait]
pub trait TerminationStrategy: Send + Sync {
    fn id(&self) -> &'static str;

    /// Decide whether the stage should stop. `stage` is the name history
    /// entries are tagged with (empty string in single-stage sessions).
    async fn decide(&self, scope: &RunScope, state: &SessionState, stage: &str)
        -> Result<Verdict>;
}

/// Build the strategy a stage's termination config selects.
pub fn strategy_for(spec: &TerminationSpec, max_iterations: u32) -> Box<dyn TerminationStrategy> {
    match spec {
        TerminationSpec::Queue => Box::new(QueueEmpty),
        TerminationSpec::Judgment {
            min_iterations,
            consensus,
        } => Box::new(Plateau {
            min_iterations: *min_iterations,
            consensus: *consensus,
        }),
        TerminationSpec::Fixed => Box::new(FixedCount { max_iterations }),
    }
}

/// Stop when the external work queue has no ready items for this session.
///
/// Never stops while the latest committed decision is an error: an empty
/// queue must not hide a failed iteration behind a clean completion.
pub struct QueueEmpty;

#[async_trait]
impl TerminationStrategy for QueueEmpty {
    fn id(&self) -> &'static str {
        "beads-empty"
    }

    async fn decide(
        &self,
        scope: &RunScope,
        state: &SessionState,
        stage: &str,
    ) -> Result<Verdict> {
        let ready = match probe_queue(scope).await {
            Ok(count) => count,
            Err(e) => {
                warn!(session = %scope.session, error = %e, "queue probe failed, continuing");
                return Ok(Verdict::Continue);
            }
        };
        debug!(session = %scope.session, ready, "queue probe");

        if ready == 0 && state.latest_decision(stage) != Some("error") {
            Ok(Verdict::Stop {
                reason: format!("queue empty for pipeline/{}", scope.session),
            })
        } else {
            Ok(Verdict::Continue)
        }
    }
}

async fn probe_queue(scope: &RunScope) -> Result<usize> {
    let queue_scope = format!("pipeline/{}", scope.session);
    let argv: Vec<String> = scope
        .config
        .queue
        .command
        .iter()
        .map(|a| a.replace("{session}", &queue_scope))
        .collect();
    let (cmd, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("queue command is empty"))?;

    let output = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "queue probe exited with {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count())
}

/// Stop once the last `consensus` decisions for the current stage are all
/// `stop`, after at least `min_iterations` iterations.
pub struct Plateau {
    pub min_iterations: u32,
    pub consensus: u32,
}

#[async_trait]
impl TerminationStrategy for Plateau {
    fn id(&self) -> &'static str {
        "plateau"
    }

    async fn decide(
        &self,
        _scope: &RunScope,
        state: &SessionState,
        stage: &str,
    ) -> Result<Verdict> {
        if state.iteration < self.min_iterations {
            return Ok(Verdict::Continue);
        }
        // Entries from other stages must not feed this stage's consensus.
        let history = state.stage_history(stage);
        let needed = self.consensus as usize;
        if history.len() < needed {
            return Ok(Verdict::Continue);
        }
        let plateau = history[history.len() - needed..]
            .iter()
            .all(|h| h.decision == "stop");
        if plateau {
            Ok(Verdict::Stop {
                reason: format!(
                    "plateau reached: {} consecutive stop decisions",
                    self.consensus
                ),
            })
        } else {
            Ok(Verdict::Continue)
        }
    }
}

/// Run a fixed number of iterations; agent decisions are ignored.
pub struct FixedCount {
    pub max_iterations: u32,
}

#[async_trait]
impl TerminationStrategy for FixedCount {
    fn id(&self) -> &'static str {
        "fixed-n"
    }

    async fn decide(
        &self,
        _scope: &RunScope,
        state: &SessionState,
        _stage: &str,
    ) -> Result<Verdict> {
        if state.iteration >= self.max_iterations {
            Ok(Verdict::Stop {
                reason: format!("fixed iteration count {} reached", self.max_iterations),
            })
        } else {
            Ok(Verdict::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::SessionPaths;
    use crate::state::{HistoryPayload, RunType, StateStore};
    use tempfile::TempDir;

    fn scope_with_queue(temp: &TempDir, queue_cmd: Vec<&str>) -> RunScope {
        let mut config = Config::default();
        config.queue.command = queue_cmd.into_iter().map(String::from).collect();
        RunScope::new(
            "demo",
            "demo",
            SessionPaths::rooted_at(temp.path(), "demo"),
            config,
        )
    }

    fn state_with_history(temp: &TempDir, stage: &str, decisions: &[&str]) -> StateStore {
        let mut store =
            StateStore::init(&temp.path().join("state.json"), "demo", RunType::Loop).unwrap();
        for (i, decision) in decisions.iter().enumerate() {
            let n = (i + 1) as u32;
            store.mark_iteration_started(n).unwrap();
            store
                .update_iteration(
                    n,
                    stage,
                    HistoryPayload {
                        decision: (*decision).to_string(),
                        ..HistoryPayload::default()
                    },
                )
                .unwrap();
            store.mark_iteration_completed(n).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_plateau_requires_min_iterations() {
        let temp = TempDir::new().unwrap();
        let scope = scope_with_queue(&temp, vec!["true"]);
        let store = state_with_history(&temp, "", &["stop", "stop"]);

        let strategy = Plateau {
            min_iterations: 5,
            consensus: 2,
        };
        let verdict = strategy.decide(&scope, store.state(), "").await.unwrap();
        assert_eq!(verdict, Verdict::Continue);
    }

    #[tokio::test]
    async fn test_plateau_no_double_count() {
        // History [continue, stop] with consensus=2 must NOT stop: the
        // current status is already in history, counting it again would
        // terminate on a single stop.
        let temp = TempDir::new().unwrap();
        let scope = scope_with_queue(&temp, vec!["true"]);
        let strategy = Plateau {
            min_iterations: 2,
            consensus: 2,
        };

        let store = state_with_history(&temp, "", &["continue", "stop"]);
        assert_eq!(
            strategy.decide(&scope, store.state(), "").await.unwrap(),
            Verdict::Continue
        );

        let temp2 = TempDir::new().unwrap();
        let store = state_with_history(&temp2, "", &["continue", "stop", "stop"]);
        assert!(matches!(
            strategy.decide(&scope, store.state(), "").await.unwrap(),
            Verdict::Stop { .. }
        ));
    }

    #[tokio::test]
    async fn test_plateau_stage_isolation() {
        // Two prior-stage stops followed by one current-stage stop: the
        // prior stage's entries are filtered out, so no plateau yet.
        let temp = TempDir::new().unwrap();
        let scope = scope_with_queue(&temp, vec!["true"]);
        let mut store =
            StateStore::init(&temp.path().join("state.json"), "demo", RunType::Pipeline).unwrap();
        for (i, (stage, decision)) in [("plan", "stop"), ("plan", "stop"), ("review", "stop")]
            .iter()
            .enumerate()
        {
            let n = (i + 1) as u32;
            store.mark_iteration_started(n).unwrap();
            store
                .update_iteration(
                    n,
                    stage,
                    HistoryPayload {
                        decision: (*decision).to_string(),
                        ..HistoryPayload::default()
                    },
                )
                .unwrap();
            store.mark_iteration_completed(n).unwrap();
        }

        let strategy = Plateau {
            min_iterations: 1,
            consensus: 2,
        };
        assert_eq!(
            strategy
                .decide(&scope, store.state(), "review")
                .await
                .unwrap(),
            Verdict::Continue
        );
    }

    #[tokio::test]
    async fn test_plateau_idempotent() {
        let temp = TempDir::new().unwrap();
        let scope = scope_with_queue(&temp, vec!["true"]);
        let store = state_with_history(&temp, "", &["stop", "stop"]);
        let strategy = Plateau {
            min_iterations: 2,
            consensus: 2,
        };

        let first = strategy.decide(&scope, store.state(), "").await.unwrap();
        let second = strategy.decide(&scope, store.state(), "").await.unwrap();
        assert_eq!(first, second);
        assert!(matches!(first, Verdict::Stop { .. }));
    }

    #[tokio::test]
    async fn test_fixed_ignores_stop_decisions() {
        let temp = TempDir::new().unwrap();
        let scope = scope_with_queue(&temp, vec!["true"]);
        let store = state_with_history(&temp, "", &["stop", "stop"]);

        let strategy = FixedCount { max_iterations: 5 };
        assert_eq!(
            strategy.decide(&scope, store.state(), "").await.unwrap(),
            Verdict::Continue
        );

        let strategy = FixedCount { max_iterations: 2 };
        assert!(matches!(
            strategy.decide(&scope, store.state(), "").await.unwrap(),
            Verdict::Stop { .. }
        ));
    }

    #[tokio::test]
    async fn test_queue_empty_stops_on_zero_lines() {
        let temp = TempDir::new().unwrap();
        // `true` prints nothing: zero ready items.
        let scope = scope_with_queue(&temp, vec!["true"]);
        let store = state_with_history(&temp, "", &["continue"]);

        let verdict = QueueEmpty.decide(&scope, store.state(), "").await.unwrap();
        match verdict {
            Verdict::Stop { reason } => assert!(reason.contains("pipeline/demo")),
            Verdict::Continue => panic!("expected stop on empty queue"),
        }
    }

    #[tokio::test]
    async fn test_queue_nonempty_continues() {
        let temp = TempDir::new().unwrap();
        let scope = scope_with_queue(&temp, vec!["echo", "item-1"]);
        let store = state_with_history(&temp, "", &["continue"]);
        assert_eq!(
            QueueEmpty.decide(&scope, store.state(), "").await.unwrap(),
            Verdict::Continue
        );
    }

    #[tokio::test]
    async fn test_queue_empty_does_not_hide_error() {
        let temp = TempDir::new().unwrap();
        let scope = scope_with_queue(&temp, vec!["true"]);
        let store = state_with_history(&temp, "", &["continue", "error"]);
        assert_eq!(
            QueueEmpty.decide(&scope, store.state(), "").await.unwrap(),
            Verdict::Continue
        );
    }

    #[tokio::test]
    async fn test_queue_probe_failure_continues() {
        let temp = TempDir::new().unwrap();
        let scope = scope_with_queue(&temp, vec!["false"]);
        let store = state_with_history(&temp, "", &["continue"]);
        assert_eq!(
            QueueEmpty.decide(&scope, store.state(), "").await.unwrap(),
            Verdict::Continue
        );
    }

    #[test]
    fn test_strategy_ids() {
        use crate::stage::TerminationSpec;
        assert_eq!(strategy_for(&TerminationSpec::Queue, 5).id(), "beads-empty");
        assert_eq!(
            strategy_for(
                &TerminationSpec::Judgment {
                    min_iterations: 1,
                    consensus: 2
                },
                5
            )
            .id(),
            "plateau"
        );
        assert_eq!(strategy_for(&TerminationSpec::Fixed, 5).id(), "fixed-n");
    }
}
