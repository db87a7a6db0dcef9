//! Sequential pipeline execution.
//!
//! Runs the pipeline's nodes in order, skipping already-complete stages on
//! resume, and aborts on the first failure. Parallel blocks are delegated to
//! the block executor; everything else goes through the iteration driver.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::AgentClient;
use crate::context::RunScope;
use crate::driver::{self, IterationWindow, StageRun};
use crate::error::EngineError;
use crate::inputs::expand_input_arg;
use crate::session::SessionPaths;
use crate::state::{RunStatus, RunType, StageStatus, StateStore};

use super::{parallel, PipelineNode, PipelineSpec};

/// How a pipeline run ended, for the CLI's framed report.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub session: String,
    pub stages_total: usize,
    pub run_dir: std::path::PathBuf,
    pub completion_reason: String,
}

/// Options carried from the CLI into the executor.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub resume: bool,
    /// `--input` arguments, expanded together with the YAML-declared inputs
    pub cli_inputs: Vec<String>,
    /// Verbatim definition text, persisted as `pipeline.yaml` in the run dir
    pub definition_text: Option<String>,
}

/// Execute a pipeline under an already-acquired session lock.
pub async fn run_pipeline(
    scope: &RunScope,
    spec: &PipelineSpec,
    agent: Arc<dyn AgentClient>,
    options: &RunOptions,
) -> Result<PipelineReport, EngineError> {
    let paths = &scope.scope;
    std::fs::create_dir_all(paths.run_dir()).map_err(|e| EngineError::Other(e.to_string()))?;

    let run_type = if spec.single_stage {
        RunType::Loop
    } else {
        RunType::Pipeline
    };
    let mut store = StateStore::init(&paths.state_file(), &scope.session, run_type)
        .map_err(|e| EngineError::Other(e.to_string()))?;

    let (start_stage, start_iteration) = if options.resume {
        store
            .reset_for_resume()
            .map_err(|e| EngineError::Other(e.to_string()))?;
        let stage = store.get_resume_stage();
        let iteration = store.get_resume_iteration();
        info!(
            session = %scope.session,
            stage,
            iteration,
            "resuming session"
        );
        (stage, iteration)
    } else {
        persist_definition(paths, spec, options)?;
        resolve_initial_inputs(paths, spec, options)?;
        (0, 1)
    };

    let mut completion_reason = String::from("all_stages_complete");
    for (index, node) in spec.nodes.iter().enumerate() {
        if options.resume && index < start_stage && store.is_stage_complete(index) {
            info!(session = %scope.session, stage = node.name(), "skipping completed stage");
            continue;
        }

        // Entering any stage other than the mid-iteration resume target
        // starts from a clean counter; otherwise the previous stage's
        // iteration_completed would make this stage believe it is resuming.
        if index != start_stage || start_iteration <= 1 {
            store
                .reset_iteration_counters()
                .map_err(|e| EngineError::Other(e.to_string()))?;
        }

        store
            .update_stage(index, node.name(), StageStatus::Running)
            .map_err(|e| EngineError::Other(e.to_string()))?;

        match node {
            PipelineNode::Parallel(block) => {
                parallel::run_block(
                    scope,
                    block,
                    index,
                    &mut store,
                    Arc::clone(&agent),
                    options.resume,
                )
                .await?;
                completion_reason = format!("parallel block '{}' joined", block.name);
            }
            PipelineNode::Stage(stage) => {
                let window = if options.resume && index == start_stage {
                    IterationWindow {
                        start: start_iteration,
                        max: stage.max_iterations,
                    }
                } else {
                    IterationWindow::fresh(stage.max_iterations)
                };
                let history_tag = if spec.single_stage { "" } else { &stage.name };
                let previous_stage = previous_stage_name(spec, index);

                let outcome = driver::run_stage(
                    StageRun {
                        scope,
                        stage,
                        stage_index: index,
                        history_tag,
                        previous_stage,
                        window,
                    },
                    &mut store,
                    agent.as_ref(),
                )
                .await;

                match outcome {
                    Ok(outcome) => {
                        if outcome.iterations_run == 0 && !stage.check_before {
                            // A stage that looped zero times is an engine bug,
                            // not an agent failure.
                            let err = EngineError::ZeroIterations(stage.name.clone());
                            warn!(session = %scope.session, stage = %stage.name, "zero iterations executed");
                            store
                                .mark_failed(&err.to_string(), err.error_type())
                                .map_err(|e| EngineError::Other(e.to_string()))?;
                            store
                                .update_stage(index, &stage.name, StageStatus::Failed)
                                .map_err(|e| EngineError::Other(e.to_string()))?;
                            return Err(err);
                        }
                        completion_reason = outcome.completion_reason;
                    }
                    Err(err) => {
                        store
                            .update_stage(index, &stage.name, StageStatus::Failed)
                            .map_err(|e| EngineError::Other(e.to_string()))?;
                        return Err(err);
                    }
                }
            }
        }

        store
            .update_stage(index, node.name(), StageStatus::Complete)
            .map_err(|e| EngineError::Other(e.to_string()))?;
    }

    if store.state().status != RunStatus::Complete {
        store
            .mark_complete(&completion_reason)
            .map_err(|e| EngineError::Other(e.to_string()))?;
    }

    Ok(PipelineReport {
        session: scope.session.clone(),
        stages_total: spec.nodes.len(),
        run_dir: paths.run_dir().to_path_buf(),
        completion_reason,
    })
}

/// The stage bare `${INPUTS}` refers to: the nearest preceding plain stage.
fn previous_stage_name(spec: &PipelineSpec, index: usize) -> Option<String> {
    spec.nodes[..index].iter().rev().find_map(|n| match n {
        PipelineNode::Stage(s) => Some(s.name.clone()),
        PipelineNode::Parallel(_) => None,
    })
}

fn persist_definition(
    paths: &SessionPaths,
    spec: &PipelineSpec,
    options: &RunOptions,
) -> Result<(), EngineError> {
    if spec.single_stage {
        return Ok(());
    }
    if let Some(text) = &options.definition_text {
        crate::fsutil::write_atomic(&paths.pipeline_file(), text)
            .map_err(|e| EngineError::Other(e.to_string()))?;
    }
    Ok(())
}

fn resolve_initial_inputs(
    paths: &SessionPaths,
    spec: &PipelineSpec,
    options: &RunOptions,
) -> Result<(), EngineError> {
    let mut resolved = Vec::new();
    for arg in options.cli_inputs.iter().chain(spec.initial_inputs.iter()) {
        let expanded = expand_input_arg(arg).map_err(|e| EngineError::Other(e.to_string()))?;
        resolved.extend(expanded);
    }
    if resolved.is_empty() && spec.single_stage {
        return Ok(());
    }
    crate::fsutil::write_json_atomic(&paths.initial_inputs_file(), &resolved)
        .map_err(|e| EngineError::Other(e.to_string()))
}
