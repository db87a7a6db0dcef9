//! Prompt template resolution.
//!
//! Templates carry literal `${NAME}` tokens. Substitution is a single pass
//! over the template: the resolver never rescans its own output, so values
//! containing `${...}` text pass through untouched.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::context::{ContextDoc, RunScope};
use crate::inputs;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Z_]+)(?:\.([A-Za-z0-9_-]+))?\}").unwrap());

/// Where prompt variable values come from.
#[derive(Debug, Clone)]
pub enum PromptSource {
    /// v3: a context document path
    ContextPath(PathBuf),
    /// legacy: a plain key-value map
    Map(BTreeMap<String, String>),
}

impl PromptSource {
    /// v3 mode is auto-detected when the argument refers to a `.json` file.
    pub fn detect(arg: &str, legacy: BTreeMap<String, String>) -> Self {
        if Path::new(arg).extension().and_then(|e| e.to_str()) == Some("json") {
            PromptSource::ContextPath(PathBuf::from(arg))
        } else {
            PromptSource::Map(legacy)
        }
    }
}

/// Resolved variable set for one iteration's prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptVars {
    values: BTreeMap<String, String>,
    scope: Option<RunScope>,
    /// Stage that `${INPUTS}` (no suffix) refers to
    previous_stage: Option<String>,
}

impl PromptVars {
    pub fn from_source(source: &PromptSource) -> Result<Self> {
        match source {
            PromptSource::ContextPath(path) => {
                let doc = ContextDoc::load(path)?;
                Ok(Self::from_context(&doc, path))
            }
            PromptSource::Map(map) => Ok(Self::from_map(map.clone())),
        }
    }

    /// Variables drawn from a context document (v3 mode).
    pub fn from_context(doc: &ContextDoc, context_path: &Path) -> Self {
        let mut values = BTreeMap::new();
        values.insert("CTX".to_string(), context_path.display().to_string());
        values.insert(
            "STATUS".to_string(),
            doc.paths.status.display().to_string(),
        );
        values.insert(
            "PROGRESS".to_string(),
            doc.paths.progress.display().to_string(),
        );
        values.insert("OUTPUT".to_string(), doc.paths.output.display().to_string());
        values.insert("SESSION".to_string(), doc.session.clone());
        values.insert("SESSION_NAME".to_string(), doc.session.clone());
        values.insert("ITERATION".to_string(), doc.iteration.to_string());
        values.insert(
            "INDEX".to_string(),
            doc.iteration.saturating_sub(1).to_string(),
        );
        values.insert("PERSPECTIVE".to_string(), String::new());
        values.insert(
            "CONTEXT".to_string(),
            std::env::var("CONDUCTOR_CONTEXT").unwrap_or_default(),
        );
        Self {
            values,
            scope: None,
            previous_stage: None,
        }
    }

    /// Variables from an explicit map (legacy mode).
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self {
            values,
            scope: None,
            previous_stage: None,
        }
    }

    pub fn with_scope(mut self, scope: RunScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_previous_stage(mut self, stage: Option<String>) -> Self {
        self.previous_stage = stage;
        self
    }

    pub fn with_perspective(mut self, perspective: &str) -> Self {
        self.values
            .insert("PERSPECTIVE".to_string(), perspective.to_string());
        self
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

/// Substitute every known token in `template` in one pass. Unknown tokens
/// are left verbatim.
pub fn resolve(template: &str, vars: &PromptVars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in TOKEN_RE.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let name = caps.get(1).map_or("", |m| m.as_str());
        let suffix = caps.get(2).map(|m| m.as_str());

        match (name, suffix) {
            ("INPUTS", Some(stage)) => out.push_str(&inline_stage_outputs(vars, stage)?),
            ("INPUTS", None) => match &vars.previous_stage {
                Some(stage) => {
                    let stage = stage.clone();
                    out.push_str(&inline_stage_outputs(vars, &stage)?);
                }
                None => out.push_str(whole.as_str()),
            },
            (_, None) => match vars.values.get(name) {
                Some(value) => out.push_str(value),
                None => out.push_str(whole.as_str()),
            },
            // Dotted suffixes only exist for INPUTS
            (_, Some(_)) => out.push_str(whole.as_str()),
        }
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Inline the `.md` outputs of a named prior stage. One file inlines
/// verbatim; several get per-file headers beneath a stage banner.
fn inline_stage_outputs(vars: &PromptVars, stage: &str) -> Result<String> {
    let Some(scope) = &vars.scope else {
        return Ok(String::new());
    };
    let Some(stage_dir) = scope.find_stage_dir(stage)? else {
        return Ok(String::new());
    };
    let files = inputs::stage_document_outputs(&stage_dir)?;

    match files.as_slice() {
        [] => Ok(String::new()),
        [only] => std::fs::read_to_string(only)
            .with_context(|| format!("failed to read {}", only.display())),
        many => {
            let mut out = format!("--- Outputs from stage: {stage} ---\n");
            for file in many {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let contents = std::fs::read_to_string(file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                out.push_str(&format!("\n=== {name} ===\n{contents}"));
            }
            Ok(out)
        }
    }
}
