//! Parallel block execution.
//!
//! One worker task per provider, each running the block's sub-stage list
//! sequentially inside its own `providers/<p>/` scope. Workers share nothing
//! mutable in-process; their only meeting point is the manifest written
//! after the join. Failure of any provider fails the whole block, but other
//! providers run to completion first so a resume only re-dispatches the
//! failed ones.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::agent::AgentClient;
use crate::config::Config;
use crate::context::{stage_output_path, RunScope};
use crate::driver::{self, IterationWindow, StageRun};
use crate::error::EngineError;
use crate::inputs::{iteration_outputs, InputSelect};
use crate::manifest::{BlockManifest, ProviderManifest, StageResult};
use crate::session::SessionPaths;
use crate::stage::StageSpec;
use crate::state::{RunStatus, RunType, StageStatus, StateStore};

use super::ParallelBlockSpec;

/// Resume hints updated as workers finish.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeHints {
    pub block: String,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Execute (or resume) a parallel block. On success `manifest.json` exists
/// and the pipeline store's stage entry is left for the caller to complete.
pub async fn run_block(
    scope: &RunScope,
    block: &ParallelBlockSpec,
    block_index: usize,
    store: &mut StateStore,
    agent: Arc<dyn AgentClient>,
    resume: bool,
) -> Result<(), EngineError> {
    let block_dir = scope.scope.parallel_dir(block_index, &block.name);
    let providers_dir = block_dir.join("providers");
    std::fs::create_dir_all(&providers_dir).map_err(|e| EngineError::Other(e.to_string()))?;

    let mut hints = ResumeHints {
        block: block.name.clone(),
        ..ResumeHints::default()
    };
    let mut finished: Vec<ProviderManifest> = Vec::new();
    let mut workers = JoinSet::new();

    for provider in &block.providers {
        let provider_dir = providers_dir.join(provider);

        if resume && provider_state_complete(&provider_dir) {
            info!(
                session = %scope.session,
                block = %block.name,
                provider = %provider,
                "provider already complete, skipping"
            );
            finished.push(rebuild_provider_manifest(provider, &provider_dir, &block.stages));
            hints.completed.push(provider.clone());
            continue;
        }

        // Re-dispatched providers start fresh: no iteration-level resume
        // inside a parallel block.
        if provider_dir.exists() {
            std::fs::remove_dir_all(&provider_dir)
                .map_err(|e| EngineError::Other(e.to_string()))?;
        }
        std::fs::create_dir_all(&provider_dir).map_err(|e| EngineError::Other(e.to_string()))?;

        let mut provider_store =
            StateStore::init(&provider_dir.join("state.json"), &scope.session, RunType::Pipeline)
                .map_err(|e| EngineError::Other(e.to_string()))?;
        provider_store
            .mark_pending()
            .map_err(|e| EngineError::Other(e.to_string()))?;

        let worker = ProviderWorker {
            session: scope.session.clone(),
            pipeline: scope.pipeline.clone(),
            config: scope.config.clone(),
            started_at: scope.started_at,
            pipeline_root: scope.scope.run_dir().to_path_buf(),
            provider: provider.clone(),
            provider_dir,
            stages: block.stages.clone(),
        };
        let agent = Arc::clone(&agent);
        workers.spawn(async move { worker.run(agent).await });
    }

    write_hints(&block_dir, &hints);

    let mut failed: Vec<String> = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(manifest)) => {
                hints.completed.push(manifest.provider.clone());
                finished.push(manifest);
            }
            Ok(Err((provider, err))) => {
                error!(
                    session = %scope.session,
                    block = %block.name,
                    provider = %provider,
                    error = %err,
                    "provider failed"
                );
                hints.failed.push(provider.clone());
                failed.push(provider);
            }
            Err(join_err) => {
                error!(session = %scope.session, error = %join_err, "provider worker panicked");
                failed.push("<unknown>".to_string());
            }
        }
        write_hints(&block_dir, &hints);
    }

    if !failed.is_empty() {
        failed.sort();
        let err = EngineError::ParallelBlockFailed {
            block: block.name.clone(),
            failed,
        };
        store
            .update_stage(block_index, &block.name, StageStatus::Failed)
            .map_err(|e| EngineError::Other(e.to_string()))?;
        store
            .mark_failed(&err.to_string(), err.error_type())
            .map_err(|e| EngineError::Other(e.to_string()))?;
        return Err(err);
    }

    // Manifest entries follow declaration order, not completion order.
    finished.sort_by_key(|m| {
        block
            .providers
            .iter()
            .position(|p| p == &m.provider)
            .unwrap_or(usize::MAX)
    });
    let manifest = BlockManifest::new(&block.name, finished);
    manifest
        .save(&block_dir.join("manifest.json"))
        .map_err(|e| EngineError::Other(e.to_string()))?;
    info!(session = %scope.session, block = %block.name, "parallel block joined");
    Ok(())
}

struct ProviderWorker {
    session: String,
    pipeline: String,
    config: Config,
    started_at: DateTime<Utc>,
    pipeline_root: PathBuf,
    provider: String,
    provider_dir: PathBuf,
    stages: Vec<StageSpec>,
}

impl ProviderWorker {
    async fn run(
        self,
        agent: Arc<dyn AgentClient>,
    ) -> Result<ProviderManifest, (String, EngineError)> {
        let provider_name = self.provider.clone();
        self.run_inner(agent)
            .await
            .map_err(|e| (provider_name, e))
    }

    async fn run_inner(&self, agent: Arc<dyn AgentClient>) -> Result<ProviderManifest, EngineError> {
        let scope = RunScope {
            session: self.session.clone(),
            pipeline: self.pipeline.clone(),
            scope: SessionPaths::rooted_at(&self.provider_dir, &self.session),
            pipeline_root: Some(SessionPaths::rooted_at(&self.pipeline_root, &self.session)),
            started_at: self.started_at,
            config: self.config.clone(),
        };
        let mut store = StateStore::open(&self.provider_dir.join("state.json"))
            .map_err(|e| EngineError::Other(e.to_string()))?;

        let mut results = Vec::new();
        for (index, template) in self.stages.iter().enumerate() {
            let stage = self.specialize(template);
            if index > 0 {
                store
                    .reset_iteration_counters()
                    .map_err(|e| EngineError::Other(e.to_string()))?;
            }
            store
                .update_stage(index, &stage.name, StageStatus::Running)
                .map_err(|e| EngineError::Other(e.to_string()))?;

            let outcome = driver::run_stage(
                StageRun {
                    scope: &scope,
                    stage: &stage,
                    stage_index: index,
                    history_tag: &stage.name,
                    previous_stage: index
                        .checked_sub(1)
                        .map(|prev| self.stages[prev].name.clone()),
                    window: IterationWindow::fresh(stage.max_iterations),
                },
                &mut store,
                agent.as_ref(),
            )
            .await?;

            if outcome.iterations_run == 0 && !stage.check_before {
                let err = EngineError::ZeroIterations(stage.name.clone());
                store
                    .mark_failed(&err.to_string(), err.error_type())
                    .map_err(|e| EngineError::Other(e.to_string()))?;
                return Err(err);
            }

            store
                .update_stage(index, &stage.name, StageStatus::Complete)
                .map_err(|e| EngineError::Other(e.to_string()))?;

            let stage_dir = scope.scope.stage_dir(index, &stage.name);
            results.push(StageResult {
                name: stage.name.clone(),
                iterations: outcome.iterations_run,
                termination_reason: outcome.completion_reason.clone(),
                output: existing_output(&stage_dir, &stage),
                history: iteration_outputs(&stage_dir, InputSelect::All).unwrap_or_default(),
            });
        }

        if store.state().status != RunStatus::Complete {
            store
                .mark_complete("all_stages_complete")
                .map_err(|e| EngineError::Other(e.to_string()))?;
        }

        Ok(ProviderManifest {
            provider: self.provider.clone(),
            status: "complete".to_string(),
            stages: results,
        })
    }

    /// Fill in this worker's provider, defaulting the model from it when the
    /// stage left the model open.
    fn specialize(&self, template: &StageSpec) -> StageSpec {
        let mut stage = template.clone();
        stage.provider.clone_from(&self.provider);
        if stage.model.is_empty() {
            if let Some(spec) = self.config.provider(&self.provider) {
                stage.model.clone_from(&spec.default_model);
            }
        }
        stage
    }
}

fn provider_state_complete(provider_dir: &Path) -> bool {
    StateStore::open(&provider_dir.join("state.json"))
        .map(|s| s.state().status == RunStatus::Complete)
        .unwrap_or(false)
}

/// Reconstruct a skipped provider's manifest entry from its directory.
fn rebuild_provider_manifest(
    provider: &str,
    provider_dir: &Path,
    stages: &[StageSpec],
) -> ProviderManifest {
    let paths = SessionPaths::rooted_at(provider_dir, "");
    let completion_reason = StateStore::open(&provider_dir.join("state.json"))
        .ok()
        .and_then(|s| s.state().completion_reason.clone())
        .unwrap_or_else(|| "complete".to_string());

    let results = stages
        .iter()
        .enumerate()
        .map(|(index, stage)| {
            let stage_dir = paths.stage_dir(index, &stage.name);
            let history = iteration_outputs(&stage_dir, InputSelect::All).unwrap_or_default();
            StageResult {
                name: stage.name.clone(),
                iterations: history.len() as u32,
                termination_reason: completion_reason.clone(),
                output: existing_output(&stage_dir, stage),
                history,
            }
        })
        .collect();

    ProviderManifest {
        provider: provider.to_string(),
        status: "complete".to_string(),
        stages: results,
    }
}

fn existing_output(stage_dir: &Path, stage: &StageSpec) -> Option<PathBuf> {
    // Highest run file for multi-run stages, otherwise the single output.
    let candidate = stage_output_path(stage_dir, stage, stage.max_iterations);
    if candidate.exists() {
        return Some(candidate);
    }
    crate::inputs::stage_document_outputs(stage_dir)
        .ok()
        .and_then(|docs| docs.into_iter().last())
}

fn write_hints(block_dir: &Path, hints: &ResumeHints) {
    let mut hints = hints.clone();
    hints.updated_at = Some(Utc::now());
    if let Err(e) = crate::fsutil::write_json_atomic(&block_dir.join("resume.json"), &hints) {
        warn!(error = %e, "failed to write resume hints");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockAgentClient, MockResponse};
    use crate::pipeline::{normalize, parse_pipeline, PipelineNode};
    use crate::stage::Resolution;
    use crate::status::Decision;
    use tempfile::TempDir;

    fn block_fixture(config: &Config) -> ParallelBlockSpec {
        let raw = parse_pipeline(
            r"
name: fan
stages:
  - name: dual
    parallel:
      providers: [claude, codex]
      stages:
        - name: plan
          prompt: 'plan for ${SESSION}'
",
        )
        .unwrap();
        let spec = normalize(&raw, config, &Resolution::default()).unwrap();
        match &spec.nodes[0] {
            PipelineNode::Parallel(block) => block.clone(),
            PipelineNode::Stage(_) => panic!("expected block"),
        }
    }

    fn scope_for(temp: &TempDir, session: &str) -> RunScope {
        let mut config = Config::default();
        config.paths.sessions = temp.path().to_string_lossy().to_string();
        config.agents.delay_seconds = 0;
        RunScope::new(session, "fan", SessionPaths::new(temp.path(), session), config)
    }

    fn pipeline_store(scope: &RunScope) -> StateStore {
        std::fs::create_dir_all(scope.scope.run_dir()).unwrap();
        StateStore::init(&scope.scope.state_file(), &scope.session, RunType::Pipeline).unwrap()
    }

    #[tokio::test]
    async fn test_both_providers_run_and_manifest_joins() {
        let temp = TempDir::new().unwrap();
        let scope = scope_for(&temp, "par");
        let block = block_fixture(&scope.config);
        let mut store = pipeline_store(&scope);
        let agent = Arc::new(MockAgentClient::with_script(vec![MockResponse::deciding(
            Decision::Stop,
        )]));

        run_block(&scope, &block, 0, &mut store, agent, false)
            .await
            .unwrap();

        let block_dir = temp.path().join("par/parallel-00-dual");
        for provider in ["claude", "codex"] {
            let iter_out = block_dir
                .join("providers")
                .join(provider)
                .join("stage-00-plan/iterations/001/output.md");
            assert!(iter_out.exists(), "missing {}", iter_out.display());

            let state =
                StateStore::open(&block_dir.join("providers").join(provider).join("state.json"))
                    .unwrap();
            assert_eq!(state.state().status, RunStatus::Complete);
        }

        let manifest = BlockManifest::load(&block_dir.join("manifest.json")).unwrap();
        assert_eq!(manifest.providers.len(), 2);
        assert_eq!(manifest.providers[0].provider, "claude");
        assert_eq!(manifest.providers[1].provider, "codex");
        let plan = manifest.providers[0].stage("plan").unwrap();
        assert_eq!(plan.iterations, 1);
        assert_eq!(plan.history.len(), 1);

        let hints: ResumeHints =
            crate::fsutil::read_json(&block_dir.join("resume.json")).unwrap();
        assert_eq!(hints.completed.len(), 2);
        assert!(hints.failed.is_empty());
    }

    #[tokio::test]
    async fn test_provider_model_defaults_per_provider() {
        let temp = TempDir::new().unwrap();
        let scope = scope_for(&temp, "models");
        let block = block_fixture(&scope.config);

        let worker = ProviderWorker {
            session: "models".into(),
            pipeline: "fan".into(),
            config: scope.config.clone(),
            started_at: Utc::now(),
            pipeline_root: scope.scope.run_dir().to_path_buf(),
            provider: "codex".into(),
            provider_dir: temp.path().join("p"),
            stages: block.stages.clone(),
        };
        let specialized = worker.specialize(&block.stages[0]);
        assert_eq!(specialized.provider, "codex");
        assert_eq!(specialized.model, "gpt-5-codex");
    }

    #[tokio::test]
    async fn test_one_provider_failing_fails_block() {
        let temp = TempDir::new().unwrap();
        let scope = scope_for(&temp, "halffail");
        let block = block_fixture(&scope.config);
        let mut store = pipeline_store(&scope);
        // Script is shared across workers: first invocation stops cleanly,
        // second crashes. One provider will fail.
        let agent = Arc::new(MockAgentClient::with_script(vec![
            MockResponse::deciding(Decision::Stop),
            MockResponse::exiting(41),
        ]));

        let err = run_block(&scope, &block, 0, &mut store, agent, false)
            .await
            .unwrap_err();
        match &err {
            EngineError::ParallelBlockFailed { block, failed } => {
                assert_eq!(block, "dual");
                assert_eq!(failed.len(), 1);
            }
            other => panic!("expected block failure, got {other:?}"),
        }

        assert_eq!(store.state().status, RunStatus::Failed);
        assert_eq!(
            store.state().error.as_ref().unwrap().error_type,
            "parallel_block_failed"
        );
        assert!(!temp
            .path()
            .join("halffail/parallel-00-dual/manifest.json")
            .exists());
    }

    #[tokio::test]
    async fn test_resume_skips_completed_provider() {
        let temp = TempDir::new().unwrap();
        let scope = scope_for(&temp, "par-resume");
        let block = block_fixture(&scope.config);
        let mut store = pipeline_store(&scope);

        // First attempt: one provider succeeds, one crashes.
        let agent = Arc::new(MockAgentClient::with_script(vec![
            MockResponse::deciding(Decision::Stop),
            MockResponse::exiting(1),
        ]));
        let _ = run_block(&scope, &block, 0, &mut store, agent, false).await;

        let block_dir = temp.path().join("par-resume/parallel-00-dual");
        let states: Vec<RunStatus> = ["claude", "codex"]
            .iter()
            .map(|p| {
                StateStore::open(&block_dir.join("providers").join(p).join("state.json"))
                    .unwrap()
                    .state()
                    .status
            })
            .collect();
        assert!(states.contains(&RunStatus::Complete));
        assert!(states.contains(&RunStatus::Failed));

        // Resume: the completed provider is skipped (agent would crash it
        // again if re-run, since the script's only response now succeeds
        // exactly once).
        let agent = Arc::new(MockAgentClient::with_script(vec![MockResponse::deciding(
            Decision::Stop,
        )]));
        run_block(&scope, &block, 0, &mut store, agent, true)
            .await
            .unwrap();

        let manifest = BlockManifest::load(&block_dir.join("manifest.json")).unwrap();
        assert_eq!(manifest.providers.len(), 2);
        for provider in ["claude", "codex"] {
            let state =
                StateStore::open(&block_dir.join("providers").join(provider).join("state.json"))
                    .unwrap();
            assert_eq!(state.state().status, RunStatus::Complete);
        }
    }
}
