//! Atomic file writes and small filesystem helpers.
//!
//! Every document the engine persists (state, context, status, manifests)
//! goes through `write_atomic`: write to a tempfile sibling, then rename into
//! place. Readers polling these files must never observe a partial document.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Write `contents` to `path` via a tempfile-sibling + rename.
///
/// The tempfile lives in the same directory as the target so the rename
/// stays on one filesystem and is atomic.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid file name in {}", path.display()))?;
    let tmp = dir.join(format!(".{}.tmp.{}", file_name, std::process::id()));

    fs::write(&tmp, contents)
        .with_context(|| format!("failed to write tempfile {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!("failed to rename {} -> {}", tmp.display(), path.display())
    })?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    write_atomic(path, &contents)
}

/// Read and deserialize a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))
}

/// List entries of `dir` whose file name passes `keep`, lexically sorted.
///
/// Directory names in the run layout are zero-padded, so lexical order is
/// chronological order. A missing directory yields an empty list.
pub fn sorted_entries(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read directory {}", dir.display()))
        }
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if keep(name) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}
