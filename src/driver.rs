//! The per-stage iteration loop.
//!
//! One call drives one stage through its iteration window: build context,
//! resolve prompt, invoke the agent, validate its status, commit history,
//! consult the termination strategy. Fail-fast: the first detectable failure
//! synthesizes an error status, fails the session state, and returns without
//! attempting another iteration.

use anyhow::Result;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::{AgentClient, InvocationRequest};
use crate::context::{build_context, ContextDoc, RunScope};
use crate::error::EngineError;
use crate::prompt::{self, PromptVars};
use crate::stage::StageSpec;
use crate::state::StateStore;
use crate::status::{self, StatusProblem};
use crate::termination::{strategy_for, TerminationStrategy, Verdict};

/// Iteration range one driver call executes (inclusive bounds, 1-based).
#[derive(Debug, Clone, Copy)]
pub struct IterationWindow {
    pub start: u32,
    pub max: u32,
}

impl IterationWindow {
    pub fn fresh(max: u32) -> Self {
        Self { start: 1, max }
    }
}

/// What one stage run amounted to.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub iterations_run: u32,
    pub completion_reason: String,
}

/// Everything a stage run needs, passed explicitly.
pub struct StageRun<'a> {
    pub scope: &'a RunScope,
    pub stage: &'a StageSpec,
    pub stage_index: usize,
    /// Tag history entries carry; empty string in single-stage sessions
    pub history_tag: &'a str,
    /// Stage that bare `${INPUTS}` refers to
    pub previous_stage: Option<String>,
    pub window: IterationWindow,
}

/// Drive one stage to completion or failure.
///
/// On failure the session state has already been marked failed; the caller
/// only decides whether to abort a surrounding pipeline.
pub async fn run_stage(
    run: StageRun<'_>,
    store: &mut StateStore,
    agent: &dyn AgentClient,
) -> Result<StageOutcome, EngineError> {
    let stage = run.stage;
    let scope = run.scope;

    let provider = match scope.config.provider(&stage.provider) {
        Some(provider) => provider.clone(),
        None => {
            return fail(
                store,
                EngineError::Other(format!("unknown provider '{}'", stage.provider)),
            )
        }
    };
    if let Err(e) = agent.check_provider(&provider) {
        return fail(store, EngineError::Other(e.to_string()));
    }

    let strategy = strategy_for(&stage.termination, stage.max_iterations);
    info!(
        session = %scope.session,
        stage = %stage.name,
        strategy = strategy.id(),
        start = run.window.start,
        max = run.window.max,
        "starting stage"
    );

    if let Err(e) = init_progress(scope, stage, run.stage_index) {
        return fail(store, EngineError::Other(e.to_string()));
    }

    let mut executed = 0u32;
    for iteration in run.window.start..=run.window.max {
        // The pre-check runs before the iteration is marked started so a
        // stop here leaves no invocation-in-flight marker behind.
        if stage.check_before {
            match strategy
                .decide(scope, store.state(), run.history_tag)
                .await
            {
                Ok(Verdict::Stop { reason }) => {
                    info!(session = %scope.session, stage = %stage.name, %reason, "pre-check stop");
                    store
                        .mark_complete(&reason)
                        .map_err(|e| EngineError::Other(e.to_string()))?;
                    return Ok(StageOutcome {
                        iterations_run: executed,
                        completion_reason: reason,
                    });
                }
                Ok(Verdict::Continue) => {}
                Err(e) => return fail(store, EngineError::Other(e.to_string())),
            }
        }

        if let Err(e) = store.mark_iteration_started(iteration) {
            return fail(store, EngineError::Other(e.to_string()));
        }

        let outcome = run_iteration(&run, store, agent, &provider, iteration).await;
        executed += 1;
        if let Err(engine_err) = outcome {
            return fail(store, engine_err);
        }

        match strategy
            .decide(scope, store.state(), run.history_tag)
            .await
        {
            Ok(Verdict::Stop { reason }) => {
                info!(session = %scope.session, stage = %stage.name, %reason, "stage complete");
                store
                    .mark_complete(&reason)
                    .map_err(|e| EngineError::Other(e.to_string()))?;
                return Ok(StageOutcome {
                    iterations_run: executed,
                    completion_reason: reason,
                });
            }
            Ok(Verdict::Continue) => {}
            Err(e) => return fail(store, EngineError::Other(e.to_string())),
        }

        if iteration < run.window.max && stage.delay_seconds > 0 {
            tokio::time::sleep(Duration::from_secs(stage.delay_seconds)).await;
        }
    }

    info!(session = %scope.session, stage = %stage.name, "iteration window exhausted");
    store
        .mark_complete("max_iterations")
        .map_err(|e| EngineError::Other(e.to_string()))?;
    Ok(StageOutcome {
        iterations_run: executed,
        completion_reason: "max_iterations".to_string(),
    })
}

/// One iteration: context, prompt, invocation, status, history commit.
async fn run_iteration(
    run: &StageRun<'_>,
    store: &mut StateStore,
    agent: &dyn AgentClient,
    provider: &crate::config::ProviderSpec,
    iteration: u32,
) -> Result<(), EngineError> {
    let stage = run.stage;
    let scope = run.scope;

    let context_path = build_context(scope, stage, run.stage_index, iteration, iteration)
        .map_err(|e| EngineError::Other(e.to_string()))?;
    let context = ContextDoc::load(&context_path).map_err(|e| EngineError::Other(e.to_string()))?;
    let status_path = context.paths.status.clone();
    let iter_dir = context_path
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_default();

    let perspective = stage
        .perspectives
        .get(iteration.saturating_sub(1) as usize)
        .cloned()
        .unwrap_or_default();
    let vars = PromptVars::from_context(&context, &context_path)
        .with_scope(scope.clone())
        .with_previous_stage(run.previous_stage.clone())
        .with_perspective(&perspective);
    let prompt_text =
        prompt::resolve(&stage.prompt_template, &vars).map_err(|e| EngineError::Other(e.to_string()))?;

    // Audit copy of exactly what the agent was asked.
    crate::fsutil::write_atomic(&iter_dir.join("prompt.md"), &prompt_text)
        .map_err(|e| EngineError::Other(e.to_string()))?;

    debug!(session = %scope.session, stage = %stage.name, iteration, "invoking agent");
    let invocation = agent
        .execute(InvocationRequest {
            provider,
            model: &stage.model,
            prompt: &prompt_text,
            output_file: Some(&iter_dir.join("output.md")),
            status_file: &status_path,
        })
        .await
        .map_err(|e| EngineError::Other(e.to_string()))?;

    if !invocation.success() {
        warn!(
            session = %scope.session,
            stage = %stage.name,
            iteration,
            exit_code = invocation.exit_code,
            "agent exited non-zero"
        );
        let err = EngineError::AgentExit {
            code: invocation.exit_code,
        };
        commit_synthesized(store, run, iteration, &status_path, &err)?;
        return Err(err);
    }

    let doc = match status::read_status(&status_path) {
        Ok(doc) => doc,
        Err(StatusProblem::Missing) => {
            let err = EngineError::MissingStatus;
            commit_synthesized(store, run, iteration, &status_path, &err)?;
            return Err(err);
        }
        Err(StatusProblem::Invalid(detail)) => {
            let err = EngineError::InvalidStatus(detail);
            commit_synthesized(store, run, iteration, &status_path, &err)?;
            return Err(err);
        }
    };

    store
        .update_iteration(iteration, run.history_tag, doc.history_payload())
        .map_err(|e| EngineError::Other(e.to_string()))?;
    store
        .mark_iteration_completed(iteration)
        .map_err(|e| EngineError::Other(e.to_string()))?;
    Ok(())
}

/// A failed iteration still lands in history — as a synthesized error
/// status, never a guessed `continue`. The iteration is not marked
/// completed, so `resume_from` points back at it.
fn commit_synthesized(
    store: &mut StateStore,
    run: &StageRun<'_>,
    iteration: u32,
    status_path: &std::path::Path,
    err: &EngineError,
) -> Result<(), EngineError> {
    let synthesized = match err {
        EngineError::MissingStatus => {
            status::synthesize_error("missing_status", "Agent did not write status.json")
        }
        EngineError::InvalidStatus(detail) => status::synthesize_error(
            "invalid_status",
            &format!("Agent wrote invalid status.json: {detail}"),
        ),
        other => status::synthesize_error(other.error_type(), &other.to_string()),
    };
    synthesized
        .write(status_path)
        .map_err(|e| EngineError::Other(e.to_string()))?;
    store
        .update_iteration(iteration, run.history_tag, synthesized.history_payload())
        .map_err(|e| EngineError::Other(e.to_string()))?;
    Ok(())
}

fn fail(store: &mut StateStore, err: EngineError) -> Result<StageOutcome, EngineError> {
    if let Err(e) = store.mark_failed(&err.to_string(), err.error_type()) {
        warn!(error = %e, "failed to persist failure state");
    }
    Err(err)
}

/// Ensure the stage's progress file exists with a header line.
fn init_progress(scope: &RunScope, stage: &StageSpec, stage_index: usize) -> Result<()> {
    let stage_dir = scope.scope.stage_dir(stage_index, &stage.name);
    let progress = stage_dir.join("progress.md");
    if !progress.exists() {
        crate::fsutil::write_atomic(
            &progress,
            &format!(
                "# Progress: {} / {}\n\nStarted {}\n",
                scope.session,
                stage.name,
                chrono::Utc::now().to_rfc3339()
            ),
        )?;
    }
    Ok(())
}
