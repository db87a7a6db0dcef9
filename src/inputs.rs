//! Input resolution: gathering prior-stage and prior-iteration outputs.
//!
//! All lookups here are tolerant: a stage that produced nothing yields an
//! empty list, never an error. Ordering is always ascending iteration index
//! (directory names are zero-padded, so lexical sort suffices).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fsutil::sorted_entries;
use crate::manifest::BlockManifest;

/// Which outputs of a prior stage to pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputSelect {
    #[default]
    Latest,
    All,
}

/// Which outputs of a parallel-block stage to pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParallelSelect {
    #[default]
    Latest,
    History,
}

/// Iteration `output.md` files under a stage directory.
///
/// `Latest` picks the highest-numbered iteration that actually produced an
/// output; `All` returns every existing one in iteration order.
pub fn iteration_outputs(stage_dir: &Path, select: InputSelect) -> Result<Vec<PathBuf>> {
    let iterations = sorted_entries(&stage_dir.join("iterations"), |_| true)?;
    let mut outputs: Vec<PathBuf> = iterations
        .into_iter()
        .map(|dir| dir.join("output.md"))
        .filter(|p| p.exists())
        .collect();
    if select == InputSelect::Latest {
        outputs = outputs.pop().into_iter().collect();
    }
    Ok(outputs)
}

/// Stage-level `.md` documents (output.md, run-*.md), excluding progress.md.
/// These are what `${INPUTS.<stage>}` inlines into prompts.
pub fn stage_document_outputs(stage_dir: &Path) -> Result<Vec<PathBuf>> {
    sorted_entries(stage_dir, |name| {
        name.ends_with(".md") && name != "progress.md"
    })
}

/// Every prior iteration's captured output for the current stage.
pub fn previous_iteration_outputs(stage_dir: &Path, before_iteration: u32) -> Result<Vec<PathBuf>> {
    let mut outputs = Vec::new();
    for i in 1..before_iteration {
        let path = stage_dir
            .join("iterations")
            .join(crate::session::iteration_dir_name(i))
            .join("output.md");
        if path.exists() {
            outputs.push(path);
        }
    }
    Ok(outputs)
}

/// Resolve a `from_parallel` reference against a block manifest.
///
/// Returns each requested provider's outputs for `stage`, in manifest
/// (spawn) order. Providers absent from the manifest are skipped.
pub fn from_parallel_outputs(
    manifest: &BlockManifest,
    stage: &str,
    select: ParallelSelect,
    providers: Option<&[String]>,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for provider in &manifest.providers {
        if let Some(wanted) = providers {
            if !wanted.iter().any(|w| w == &provider.provider) {
                continue;
            }
        }
        let Some(result) = provider.stage(stage) else {
            continue;
        };
        match select {
            ParallelSelect::Latest => {
                if let Some(output) = &result.output {
                    paths.push(output.clone());
                }
            }
            ParallelSelect::History => paths.extend(result.history.iter().cloned()),
        }
    }
    paths
}

/// Expand one `--input` argument (or YAML-declared initial input) into
/// absolute file paths. Directories contribute their `.md|.yaml|.json|.txt`
/// files; glob patterns expand via pathname globbing; plain files pass
/// through. A pattern matching nothing yields nothing.
pub fn expand_input_arg(arg: &str) -> Result<Vec<PathBuf>> {
    const INCLUDE: [&str; 4] = ["md", "yaml", "json", "txt"];

    let path = Path::new(arg);
    if path.is_dir() {
        let mut files = sorted_entries(path, |name| {
            Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| INCLUDE.contains(&ext))
        })?;
        files.retain(|p| p.is_file());
        return files.iter().map(|p| absolutize(p)).collect();
    }
    if path.is_file() {
        return Ok(vec![absolutize(path)?]);
    }

    let mut out = Vec::new();
    for entry in glob::glob(arg).with_context(|| format!("bad input pattern '{arg}'"))? {
        let p = entry?;
        if p.is_file() {
            out.push(absolutize(&p)?);
        }
    }
    out.sort();
    Ok(out)
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
