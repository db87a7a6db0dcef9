//! Stage definitions.
//!
//! A stage type lives at `<stages>/<name>/stage.yaml` with its prompt body
//! alongside. Parsing accepts both the current schema and the legacy key
//! names (`completion` for `termination`); everything downstream of this
//! module sees only the canonical `StageSpec`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::inputs::{InputSelect, ParallelSelect};

/// Canonical termination rule for a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationSpec {
    /// Stop when the external work queue has no ready items
    Queue,
    /// Stop on consecutive-stop consensus after a minimum iteration count
    Judgment { min_iterations: u32, consensus: u32 },
    /// Run exactly `max_iterations` iterations, ignoring agent decisions
    Fixed,
}

impl TerminationSpec {
    /// Strategy identifier recorded in logs and completion reasons.
    pub fn strategy_id(&self) -> &'static str {
        match self {
            TerminationSpec::Queue => "beads-empty",
            TerminationSpec::Judgment { .. } => "plateau",
            TerminationSpec::Fixed => "fixed-n",
        }
    }
}

/// Reference to a prior stage's outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRef {
    pub from: String,
    #[serde(default)]
    pub select: InputSelect,
}

/// Reference to outputs of a stage inside a parallel block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelInputRef {
    pub stage: String,
    pub block: String,
    #[serde(default)]
    pub select: ParallelSelect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<String>>,
}

/// A fully resolved stage, ready for the iteration driver.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub description: String,
    pub provider: String,
    pub model: String,
    pub prompt_template: String,
    pub termination: TerminationSpec,
    pub max_iterations: u32,
    pub delay_seconds: u64,
    pub check_before: bool,
    pub runs: u32,
    pub perspectives: Vec<String>,
    pub output_path: Option<String>,
    pub commands: BTreeMap<String, String>,
    pub max_runtime_seconds: Option<u64>,
    pub inputs: Vec<InputRef>,
    pub parallel_inputs: Vec<ParallelInputRef>,
}

/// Raw `stage.yaml` as written on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStageFile {
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// `completion` is the legacy key for the same block
    #[serde(alias = "completion")]
    pub termination: Option<RawTermination>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub delay: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    /// Prompt file name under `prompts/`, or absent for `prompt.md`
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub check_before: bool,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    #[serde(default)]
    pub guardrails: Guardrails,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Guardrails {
    #[serde(default)]
    pub max_runtime_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTermination {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub min_iterations: Option<u32>,
    #[serde(default)]
    pub consensus: Option<u32>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_CONSENSUS: u32 = 2;

impl RawTermination {
    pub fn normalize(&self) -> Result<TerminationSpec> {
        match self.kind.as_str() {
            "queue" => Ok(TerminationSpec::Queue),
            "judgment" => Ok(TerminationSpec::Judgment {
                min_iterations: self.min_iterations.unwrap_or(1),
                consensus: self.consensus.unwrap_or(DEFAULT_CONSENSUS),
            }),
            "fixed" => Ok(TerminationSpec::Fixed),
            other => anyhow::bail!(
                "unknown termination type '{other}' (expected queue, judgment, or fixed)"
            ),
        }
    }
}

/// Provider/model sources in descending precedence. `stage_entry` is the
/// explicit per-stage block in a pipeline file; `stage_file` is the stage
/// type's own yaml; env beats pipeline defaults but never explicit stage
/// config. The model default always derives from the *resolved* provider.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub cli_provider: Option<String>,
    pub cli_model: Option<String>,
    pub stage_entry_provider: Option<String>,
    pub stage_entry_model: Option<String>,
    pub stage_file_provider: Option<String>,
    pub stage_file_model: Option<String>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
}

impl Resolution {
    pub fn resolve(&self, config: &Config) -> Result<(String, String)> {
        let env_provider = std::env::var("CONDUCTOR_PROVIDER").ok();
        let env_model = std::env::var("CONDUCTOR_MODEL").ok();

        let provider = self
            .cli_provider
            .clone()
            .or_else(|| self.stage_entry_provider.clone())
            .or(env_provider)
            .or_else(|| self.stage_file_provider.clone())
            .or_else(|| self.default_provider.clone())
            .unwrap_or_else(|| "claude".to_string());

        let spec = config
            .provider(&provider)
            .with_context(|| format!("unknown provider '{provider}'"))?;

        let model = self
            .cli_model
            .clone()
            .or_else(|| self.stage_entry_model.clone())
            .or(env_model)
            .or_else(|| self.stage_file_model.clone())
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| spec.default_model.clone());

        Ok((provider, model))
    }
}

/// Load a stage type from `<stages>/<name>/` and resolve it into a spec.
pub fn load_stage_type(
    config: &Config,
    stage_type: &str,
    resolution: &Resolution,
    max_iterations_override: Option<u32>,
) -> Result<StageSpec> {
    let stage_dir = config.stages_dir().join(stage_type);
    let yaml_path = stage_dir.join("stage.yaml");
    let contents = std::fs::read_to_string(&yaml_path)
        .with_context(|| format!("unknown stage type '{stage_type}' ({})", yaml_path.display()))?;
    let raw: RawStageFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", yaml_path.display()))?;

    let prompt_template = load_prompt_body(&stage_dir, raw.prompt.as_deref())?;

    let termination = match &raw.termination {
        Some(t) => t.normalize()?,
        None => TerminationSpec::Fixed,
    };
    let max_iterations = max_iterations_override
        .or(raw.max_iterations)
        .or_else(|| raw.termination.as_ref().and_then(|t| t.max_iterations))
        .unwrap_or(DEFAULT_MAX_ITERATIONS);

    let mut resolution = resolution.clone();
    resolution.stage_file_provider = raw.provider.clone();
    resolution.stage_file_model = raw.model.clone();
    let (provider, model) = resolution.resolve(config)?;

    Ok(StageSpec {
        name: raw.name.unwrap_or_else(|| stage_type.to_string()),
        description: raw.description,
        provider,
        model,
        prompt_template,
        termination,
        max_iterations,
        delay_seconds: raw.delay.unwrap_or(config.agents.delay_seconds),
        check_before: raw.check_before,
        runs: 1,
        perspectives: Vec::new(),
        output_path: raw.output_path,
        commands: raw.commands,
        max_runtime_seconds: raw.guardrails.max_runtime_seconds,
        inputs: Vec::new(),
        parallel_inputs: Vec::new(),
    })
}

/// The prompt body referenced by a stage: `prompts/<p>.md` when named,
/// otherwise `prompt.md` next to the yaml.
pub fn load_prompt_body(stage_dir: &Path, prompt: Option<&str>) -> Result<String> {
    let path = match prompt {
        Some(name) => {
            let mut file = name.to_string();
            if !file.ends_with(".md") {
                file.push_str(".md");
            }
            stage_dir.join("prompts").join(file)
        }
        None => stage_dir.join("prompt.md"),
    };
    std::fs::read_to_string(&path)
        .with_context(|| format!("missing prompt body {}", path.display()))
}

/// Whether `name` matches a stage-type directory (for the CLI shortcut).
pub fn is_known_stage_type(config: &Config, name: &str) -> bool {
    config.stages_dir().join(name).join("stage.yaml").is_file()
}
