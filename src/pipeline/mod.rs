//! Pipeline definitions.
//!
//! A pipeline file names an ordered list of stages; a stage either
//! references a stage type, carries an inline prompt, or declares a parallel
//! block. Both the current schema and the legacy key names (`loop` for
//! `stage`, `completion` for `termination`) parse into the same canonical
//! structs — nothing past this module sees legacy spellings.

pub mod executor;
pub mod parallel;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::inputs::{InputSelect, ParallelSelect};
use crate::stage::{
    self, InputRef, ParallelInputRef, RawTermination, Resolution, StageSpec, TerminationSpec,
};

/// Raw pipeline file as written on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPipeline {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub defaults: RawDefaults,
    /// Initial input paths/globs declared in the file
    #[serde(default)]
    pub inputs: Vec<String>,
    pub stages: Vec<RawPipelineStage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDefaults {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPipelineStage {
    pub name: String,
    #[serde(default)]
    pub runs: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    /// Stage type reference; `loop` is the legacy spelling
    #[serde(default, alias = "loop")]
    pub stage: Option<String>,
    /// Inline prompt text (alternative to a stage type reference)
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, alias = "completion")]
    pub termination: Option<RawTermination>,
    #[serde(default)]
    pub inputs: Option<RawStageInputs>,
    #[serde(default)]
    pub perspectives: Vec<String>,
    #[serde(default)]
    pub check_before: bool,
    #[serde(default)]
    pub delay: Option<u64>,
    #[serde(default)]
    pub parallel: Option<RawParallel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStageInputs {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub select: Option<InputSelect>,
    #[serde(default)]
    pub from_parallel: Option<RawParallelInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawParallelInput {
    pub stage: String,
    pub block: String,
    #[serde(default)]
    pub select: Option<ParallelSelect>,
    #[serde(default)]
    pub providers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawParallel {
    pub providers: Vec<String>,
    pub stages: Vec<RawPipelineStage>,
}

/// Canonical pipeline, fully normalized.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub name: String,
    pub description: String,
    pub initial_inputs: Vec<String>,
    pub nodes: Vec<PipelineNode>,
    /// True for the synthesized one-stage pipeline behind `--single-stage`;
    /// its history entries carry an empty stage tag
    pub single_stage: bool,
}

#[derive(Debug, Clone)]
pub enum PipelineNode {
    Stage(StageSpec),
    Parallel(ParallelBlockSpec),
}

impl PipelineNode {
    pub fn name(&self) -> &str {
        match self {
            PipelineNode::Stage(s) => &s.name,
            PipelineNode::Parallel(b) => &b.name,
        }
    }
}

/// A provider fan-out over a shared sub-stage sequence.
#[derive(Debug, Clone)]
pub struct ParallelBlockSpec {
    pub name: String,
    pub providers: Vec<String>,
    /// Sub-stages with `provider` left empty — each worker fills in its own
    pub stages: Vec<StageSpec>,
}

/// Resolve `pipeline <file|name>` into a file path.
pub fn resolve_pipeline_file(config: &Config, arg: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(arg);
    if direct.is_file() {
        return Ok(direct);
    }
    let candidates = [
        PathBuf::from("pipelines").join(format!("{arg}.yaml")),
        config
            .stages_dir()
            .parent()
            .map(|p| p.join("pipelines").join(format!("{arg}.yaml")))
            .unwrap_or_default(),
    ];
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    anyhow::bail!("pipeline '{arg}' not found (not a file, not a known pipeline name)")
}

pub fn parse_pipeline(contents: &str) -> Result<RawPipeline> {
    serde_yaml::from_str(contents).context("failed to parse pipeline definition")
}

pub fn load_pipeline_file(path: &Path) -> Result<(RawPipeline, String)> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline {}", path.display()))?;
    Ok((parse_pipeline(&contents)?, contents))
}

/// Normalize a raw pipeline into canonical specs, validating parallel-block
/// rules and `from_parallel` references.
pub fn normalize(
    raw: &RawPipeline,
    config: &Config,
    resolution: &Resolution,
) -> Result<PipelineSpec> {
    let mut nodes = Vec::new();

    for raw_stage in &raw.stages {
        if let Some(parallel) = &raw_stage.parallel {
            nodes.push(PipelineNode::Parallel(normalize_parallel(
                raw_stage, parallel, raw, config, resolution,
            )?));
        } else {
            nodes.push(PipelineNode::Stage(normalize_stage(
                raw_stage, raw, config, resolution, false,
            )?));
        }
    }

    validate_parallel_references(&nodes)?;

    Ok(PipelineSpec {
        name: raw.name.clone(),
        description: raw.description.clone(),
        initial_inputs: raw.inputs.clone(),
        nodes,
        single_stage: false,
    })
}

/// Synthesize the one-stage pipeline behind `--single-stage` so the executor
/// has a single caller shape.
pub fn single_stage_pipeline(
    config: &Config,
    stage_type: &str,
    resolution: &Resolution,
    max_iterations: Option<u32>,
) -> Result<PipelineSpec> {
    let spec = stage::load_stage_type(config, stage_type, resolution, max_iterations)?;
    Ok(PipelineSpec {
        name: spec.name.clone(),
        description: spec.description.clone(),
        initial_inputs: Vec::new(),
        nodes: vec![PipelineNode::Stage(spec)],
        single_stage: true,
    })
}

fn normalize_stage(
    raw_stage: &RawPipelineStage,
    raw: &RawPipeline,
    config: &Config,
    resolution: &Resolution,
    inside_parallel: bool,
) -> Result<StageSpec> {
    let runs = raw_stage.runs.unwrap_or(1);
    if runs == 0 {
        anyhow::bail!("stage '{}' declares zero runs", raw_stage.name);
    }

    let mut resolution = resolution.clone();
    resolution.stage_entry_provider = raw_stage.provider.clone();
    resolution.stage_entry_model = raw_stage.model.clone();
    resolution.default_provider = raw.defaults.provider.clone();
    resolution.default_model = raw.defaults.model.clone();

    let mut spec = match (&raw_stage.stage, &raw_stage.prompt) {
        (Some(stage_type), _) => {
            stage::load_stage_type(config, stage_type, &resolution, raw_stage.runs)?
        }
        (None, Some(prompt)) => {
            let (provider, model) = if inside_parallel {
                // Providers come from the block; models default per worker.
                (
                    String::new(),
                    raw_stage
                        .model
                        .clone()
                        .or_else(|| raw.defaults.model.clone())
                        .unwrap_or_default(),
                )
            } else {
                resolution.resolve(config)?
            };
            StageSpec {
                name: raw_stage.name.clone(),
                description: String::new(),
                provider,
                model,
                prompt_template: prompt.clone(),
                termination: TerminationSpec::Fixed,
                max_iterations: runs,
                delay_seconds: config.agents.delay_seconds,
                check_before: false,
                runs,
                perspectives: Vec::new(),
                output_path: None,
                commands: std::collections::BTreeMap::new(),
                max_runtime_seconds: None,
                inputs: Vec::new(),
                parallel_inputs: Vec::new(),
            }
        }
        (None, None) => anyhow::bail!(
            "stage '{}' needs either a stage type or an inline prompt",
            raw_stage.name
        ),
    };

    spec.name = raw_stage.name.clone();
    spec.runs = runs;
    if raw_stage.runs.is_some() {
        spec.max_iterations = runs;
    }
    if let Some(termination) = &raw_stage.termination {
        spec.termination = termination.normalize()?;
        if let Some(max) = termination.max_iterations {
            spec.max_iterations = max;
        }
    }
    if raw_stage.check_before {
        spec.check_before = true;
    }
    if let Some(delay) = raw_stage.delay {
        spec.delay_seconds = delay;
    }
    spec.perspectives.clone_from(&raw_stage.perspectives);

    if inside_parallel {
        // The block's provider list governs; workers fill these in.
        spec.provider = String::new();
        if raw_stage.model.is_none() {
            spec.model = String::new();
        }
    }

    if let Some(inputs) = &raw_stage.inputs {
        if let Some(from) = &inputs.from {
            spec.inputs.push(InputRef {
                from: from.clone(),
                select: inputs.select.unwrap_or_default(),
            });
        }
        if let Some(fp) = &inputs.from_parallel {
            spec.parallel_inputs.push(ParallelInputRef {
                stage: fp.stage.clone(),
                block: fp.block.clone(),
                select: fp.select.unwrap_or_default(),
                providers: fp.providers.clone(),
            });
        }
    }

    Ok(spec)
}

fn normalize_parallel(
    raw_stage: &RawPipelineStage,
    parallel: &RawParallel,
    raw: &RawPipeline,
    config: &Config,
    resolution: &Resolution,
) -> Result<ParallelBlockSpec> {
    if parallel.providers.is_empty() {
        anyhow::bail!("parallel block '{}' has no providers", raw_stage.name);
    }
    if parallel.stages.is_empty() {
        anyhow::bail!("parallel block '{}' has no stages", raw_stage.name);
    }
    for provider in &parallel.providers {
        if config.provider(provider).is_none() {
            anyhow::bail!(
                "parallel block '{}' references unknown provider '{provider}'",
                raw_stage.name
            );
        }
    }

    let mut names = std::collections::BTreeSet::new();
    let mut stages = Vec::new();
    for sub in &parallel.stages {
        if sub.parallel.is_some() {
            anyhow::bail!(
                "parallel block '{}' contains a nested parallel block '{}'",
                raw_stage.name,
                sub.name
            );
        }
        if sub.provider.is_some() {
            anyhow::bail!(
                "stage '{}' inside parallel block '{}' must not override provider",
                sub.name,
                raw_stage.name
            );
        }
        if !names.insert(sub.name.clone()) {
            anyhow::bail!(
                "duplicate stage name '{}' inside parallel block '{}'",
                sub.name,
                raw_stage.name
            );
        }
        stages.push(normalize_stage(sub, raw, config, resolution, true)?);
    }

    Ok(ParallelBlockSpec {
        name: raw_stage.name.clone(),
        providers: parallel.providers.clone(),
        stages,
    })
}

fn validate_parallel_references(nodes: &[PipelineNode]) -> Result<()> {
    for node in nodes {
        let PipelineNode::Stage(stage) = node else {
            continue;
        };
        for pref in &stage.parallel_inputs {
            let block = nodes.iter().find_map(|n| match n {
                PipelineNode::Parallel(b) if b.name == pref.block => Some(b),
                _ => None,
            });
            let Some(block) = block else {
                anyhow::bail!(
                    "stage '{}' references unknown parallel block '{}'",
                    stage.name,
                    pref.block
                );
            };
            if !block.stages.iter().any(|s| s.name == pref.stage) {
                anyhow::bail!(
                    "stage '{}' references stage '{}' which does not exist in parallel block '{}'",
                    stage.name,
                    pref.stage,
                    pref.block
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_and_normalize(yaml: &str) -> Result<PipelineSpec> {
        let raw = parse_pipeline(yaml)?;
        normalize(&raw, &Config::default(), &Resolution::default())
    }

    const BASIC: &str = r"
name: review-flow
description: two-step review
defaults:
  provider: claude
  model: sonnet
stages:
  - name: draft
    prompt: 'Write a draft into ${OUTPUT}'
    runs: 1
  - name: polish
    prompt: 'Polish ${INPUTS}'
    runs: 3
    termination:
      type: judgment
      min_iterations: 2
      consensus: 2
    inputs:
      from: draft
      select: all
";

    #[test]
    fn test_normalize_basic_pipeline() {
        let spec = parse_and_normalize(BASIC).unwrap();
        assert_eq!(spec.name, "review-flow");
        assert_eq!(spec.nodes.len(), 2);

        let PipelineNode::Stage(polish) = &spec.nodes[1] else {
            panic!("expected plain stage");
        };
        assert_eq!(polish.runs, 3);
        assert_eq!(polish.max_iterations, 3);
        assert_eq!(
            polish.termination,
            TerminationSpec::Judgment {
                min_iterations: 2,
                consensus: 2
            }
        );
        assert_eq!(polish.inputs.len(), 1);
        assert_eq!(polish.inputs[0].from, "draft");
        assert_eq!(polish.inputs[0].select, InputSelect::All);
        assert_eq!(polish.provider, "claude");
        assert_eq!(polish.model, "sonnet");
    }

    #[test]
    fn test_legacy_loop_and_completion_aliases() {
        // `loop` for the stage-type key and `completion` for termination.
        let yaml = r"
name: legacy
stages:
  - name: drain
    prompt: 'work through the queue'
    completion:
      type: queue
";
        let spec = parse_and_normalize(yaml).unwrap();
        let PipelineNode::Stage(drain) = &spec.nodes[0] else {
            panic!()
        };
        assert_eq!(drain.termination, TerminationSpec::Queue);
    }

    #[test]
    fn test_stage_without_type_or_prompt_rejected() {
        let yaml = "
name: broken
stages:
  - name: empty
";
        assert!(parse_and_normalize(yaml).is_err());
    }

    const PARALLEL: &str = r"
name: fan-out
defaults:
  provider: claude
stages:
  - name: ideate
    prompt: 'Collect ideas into ${OUTPUT}'
  - name: dual-refine
    parallel:
      providers: [claude, codex]
      stages:
        - name: plan
          prompt: 'Plan from ${INPUTS.ideate}'
        - name: build
          prompt: 'Build the plan'
  - name: merge
    prompt: 'Merge everything'
    inputs:
      from_parallel:
        stage: plan
        block: dual-refine
        select: latest
        providers: [claude]
";

    #[test]
    fn test_normalize_parallel_block() {
        let spec = parse_and_normalize(PARALLEL).unwrap();
        let PipelineNode::Parallel(block) = &spec.nodes[1] else {
            panic!("expected parallel block");
        };
        assert_eq!(block.providers, vec!["claude", "codex"]);
        assert_eq!(block.stages.len(), 2);
        // Providers are filled per worker, not at normalize time.
        assert!(block.stages.iter().all(|s| s.provider.is_empty()));

        let PipelineNode::Stage(merge) = &spec.nodes[2] else {
            panic!()
        };
        assert_eq!(merge.parallel_inputs.len(), 1);
        assert_eq!(merge.parallel_inputs[0].block, "dual-refine");
        assert_eq!(
            merge.parallel_inputs[0].providers,
            Some(vec!["claude".to_string()])
        );
    }

    #[test]
    fn test_nested_parallel_rejected() {
        let yaml = r"
name: bad
stages:
  - name: outer
    parallel:
      providers: [claude]
      stages:
        - name: inner
          parallel:
            providers: [codex]
            stages:
              - name: deep
                prompt: x
";
        let err = parse_and_normalize(yaml).unwrap_err().to_string();
        assert!(err.contains("nested"), "{err}");
    }

    #[test]
    fn test_provider_override_inside_block_rejected() {
        let yaml = r"
name: bad
stages:
  - name: block
    parallel:
      providers: [claude]
      stages:
        - name: plan
          prompt: x
          provider: codex
";
        let err = parse_and_normalize(yaml).unwrap_err().to_string();
        assert!(err.contains("must not override provider"), "{err}");
    }

    #[test]
    fn test_duplicate_names_inside_block_rejected() {
        let yaml = r"
name: bad
stages:
  - name: block
    parallel:
      providers: [claude]
      stages:
        - name: plan
          prompt: x
        - name: plan
          prompt: y
";
        let err = parse_and_normalize(yaml).unwrap_err().to_string();
        assert!(err.contains("duplicate stage name"), "{err}");
    }

    #[test]
    fn test_empty_providers_rejected() {
        let yaml = r"
name: bad
stages:
  - name: block
    parallel:
      providers: []
      stages:
        - name: plan
          prompt: x
";
        assert!(parse_and_normalize(yaml).is_err());
    }

    #[test]
    fn test_from_parallel_unknown_stage_rejected() {
        let yaml = r"
name: bad
stages:
  - name: block
    parallel:
      providers: [claude]
      stages:
        - name: plan
          prompt: x
  - name: merge
    prompt: y
    inputs:
      from_parallel:
        stage: ghost
        block: block
";
        let err = parse_and_normalize(yaml).unwrap_err().to_string();
        assert!(err.contains("does not exist in parallel block"), "{err}");
    }

    #[test]
    fn test_zero_runs_rejected() {
        let yaml = "
name: bad
stages:
  - name: nothing
    prompt: x
    runs: 0
";
        assert!(parse_and_normalize(yaml).is_err());
    }

    #[test]
    fn test_resolve_pipeline_file_direct_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("p.yaml");
        std::fs::write(&file, "name: p\nstages: []\n").unwrap();
        let resolved =
            resolve_pipeline_file(&Config::default(), file.to_str().unwrap()).unwrap();
        assert_eq!(resolved, file);
        assert!(resolve_pipeline_file(&Config::default(), "no-such-pipeline").is_err());
    }
}
