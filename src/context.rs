//! Per-iteration context documents.
//!
//! Before each agent invocation the engine writes an immutable
//! `context.json` into the iteration directory. The agent reads it; the
//! engine never mutates it afterwards. The path returned by the builder is
//! the path the agent will read, and `status.json` is derived as its
//! sibling.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::inputs;
use crate::manifest::BlockManifest;
use crate::session::SessionPaths;
use crate::stage::StageSpec;

/// Everything an iteration needs to know about where it is running.
///
/// Threaded explicitly through driver, strategies, and builders — there is
/// no ambient global. Inside a parallel block `scope` points at the
/// provider's private directory while `pipeline_root` allows input lookups
/// to reach stages that ran before the block.
#[derive(Debug, Clone)]
pub struct RunScope {
    pub session: String,
    pub pipeline: String,
    pub scope: SessionPaths,
    pub pipeline_root: Option<SessionPaths>,
    pub started_at: DateTime<Utc>,
    pub config: Config,
}

impl RunScope {
    pub fn new(session: &str, pipeline: &str, scope: SessionPaths, config: Config) -> Self {
        Self {
            session: session.to_string(),
            pipeline: pipeline.to_string(),
            scope,
            pipeline_root: None,
            started_at: Utc::now(),
            config,
        }
    }

    pub fn with_pipeline_root(mut self, root: SessionPaths) -> Self {
        self.pipeline_root = Some(root);
        self
    }

    /// Find a stage directory by name: provider-local scope first, then the
    /// pipeline root for stages that ran before a parallel block.
    pub fn find_stage_dir(&self, name: &str) -> Result<Option<PathBuf>> {
        if let Some(found) = self.scope.find_stage_dir(name)? {
            return Ok(Some(found));
        }
        if let Some(root) = &self.pipeline_root {
            return root.find_stage_dir(name);
        }
        Ok(None)
    }

    /// Find a parallel block directory by name (blocks only exist at the
    /// pipeline root).
    pub fn find_parallel_dir(&self, name: &str) -> Result<Option<PathBuf>> {
        if let Some(root) = &self.pipeline_root {
            if let Some(found) = root.find_parallel_dir(name)? {
                return Ok(Some(found));
            }
        }
        self.scope.find_parallel_dir(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDoc {
    pub session: String,
    pub pipeline: String,
    pub stage: StageCtx,
    pub iteration: u32,
    pub paths: PathsCtx,
    pub inputs: InputsCtx,
    pub limits: LimitsCtx,
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCtx {
    pub id: String,
    pub index: usize,
    pub template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsCtx {
    pub session_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub progress: PathBuf,
    pub output: PathBuf,
    pub status: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputsCtx {
    #[serde(default)]
    pub from_stage: BTreeMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub from_previous_iterations: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsCtx {
    pub max_iterations: u32,
    /// Seconds left under the configured runtime limit, clamped at 0;
    /// -1 when no limit is configured
    pub remaining_seconds: i64,
}

impl ContextDoc {
    pub fn load(path: &Path) -> Result<Self> {
        crate::fsutil::read_json(path)
    }
}

/// The stage output document an iteration should produce: `output.md` for a
/// single-run stage, `run-<i>.md` when the stage runs more than once, or an
/// explicit `output_path` override.
pub fn stage_output_path(stage_dir: &Path, stage: &StageSpec, run_index: u32) -> PathBuf {
    if let Some(explicit) = &stage.output_path {
        return stage_dir.join(explicit);
    }
    if stage.runs > 1 {
        stage_dir.join(format!("run-{run_index}.md"))
    } else {
        stage_dir.join("output.md")
    }
}

/// Build and persist the context document for one iteration.
///
/// Returns the absolute path of the written `context.json`.
pub fn build_context(
    scope: &RunScope,
    stage: &StageSpec,
    stage_index: usize,
    iteration: u32,
    run_index: u32,
) -> Result<PathBuf> {
    let stage_dir = scope.scope.stage_dir(stage_index, &stage.name);
    let iter_dir = scope.scope.iteration_dir(&stage_dir, iteration);
    std::fs::create_dir_all(&iter_dir)?;

    let progress = progress_path(scope, &stage_dir);
    let output = stage_output_path(&stage_dir, stage, run_index);
    let context_path = iter_dir.join("context.json");
    let status_path = iter_dir.join("status.json");

    let doc = ContextDoc {
        session: scope.session.clone(),
        pipeline: scope.pipeline.clone(),
        stage: StageCtx {
            id: stage.name.clone(),
            index: stage_index,
            template: stage.name.clone(),
        },
        iteration,
        paths: PathsCtx {
            session_dir: scope.scope.run_dir().to_path_buf(),
            stage_dir: stage_dir.clone(),
            progress,
            output,
            status: status_path,
        },
        inputs: resolve_inputs(scope, stage, &stage_dir, iteration)?,
        limits: LimitsCtx {
            max_iterations: stage.max_iterations,
            remaining_seconds: remaining_seconds(scope, stage),
        },
        commands: stage.commands.clone(),
    };

    crate::fsutil::write_json_atomic(&context_path, &doc)?;
    Ok(context_path)
}

/// Stage-local progress.md preferred; the session-level file is only used
/// when it already exists from an older run and the stage has none yet.
fn progress_path(scope: &RunScope, stage_dir: &Path) -> PathBuf {
    let stage_progress = stage_dir.join("progress.md");
    if stage_progress.exists() {
        return stage_progress;
    }
    let legacy = scope.scope.legacy_progress_file();
    if legacy.exists() {
        return legacy;
    }
    stage_progress
}

fn remaining_seconds(scope: &RunScope, stage: &StageSpec) -> i64 {
    match stage.max_runtime_seconds {
        Some(limit) => {
            let elapsed = Utc::now()
                .signed_duration_since(scope.started_at)
                .num_seconds();
            (limit as i64 - elapsed).max(0)
        }
        None => -1,
    }
}

fn resolve_inputs(
    scope: &RunScope,
    stage: &StageSpec,
    stage_dir: &Path,
    iteration: u32,
) -> Result<InputsCtx> {
    let mut from_stage: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    for input in &stage.inputs {
        let paths = match scope.find_stage_dir(&input.from)? {
            Some(dir) => inputs::iteration_outputs(&dir, input.select)?,
            None => Vec::new(),
        };
        from_stage.entry(input.from.clone()).or_default().extend(paths);
    }

    for pref in &stage.parallel_inputs {
        let resolved = match scope.find_parallel_dir(&pref.block)? {
            Some(block_dir) => {
                let manifest_path = block_dir.join("manifest.json");
                if manifest_path.exists() {
                    let manifest = BlockManifest::load(&manifest_path)?;
                    inputs::from_parallel_outputs(
                        &manifest,
                        &pref.stage,
                        pref.select,
                        pref.providers.as_deref(),
                    )
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        };
        from_stage
            .entry(pref.stage.clone())
            .or_default()
            .extend(resolved);
    }

    Ok(InputsCtx {
        from_stage,
        from_previous_iterations: inputs::previous_iteration_outputs(stage_dir, iteration)?,
    })
}
