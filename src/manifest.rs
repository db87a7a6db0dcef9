//! Parallel block join manifest.
//!
//! Written once, after every provider in a block has finished. Downstream
//! stages resolve `from_parallel` inputs against this document instead of
//! crawling provider directories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockManifest {
    pub block: String,
    pub created_at: DateTime<Utc>,
    pub providers: Vec<ProviderManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderManifest {
    pub provider: String,
    pub status: String,
    pub stages: Vec<StageResult>,
}

/// Terminal result of one sub-stage for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub iterations: u32,
    pub termination_reason: String,
    /// The stage's canonical output document, if it produced one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Every iteration's captured output, ascending
    #[serde(default)]
    pub history: Vec<PathBuf>,
}

impl BlockManifest {
    pub fn new(block: &str, providers: Vec<ProviderManifest>) -> Self {
        Self {
            block: block.to_string(),
            created_at: Utc::now(),
            providers,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        crate::fsutil::read_json(path)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        crate::fsutil::write_json_atomic(path, self)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderManifest> {
        self.providers.iter().find(|p| p.provider == name)
    }
}

impl ProviderManifest {
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }
}
