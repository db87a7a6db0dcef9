//! Agent providers.
//!
//! A provider is an opaque external binary: the engine pipes the resolved
//! prompt to its stdin, captures its combined output, and reads its exit
//! code. Nothing in its stdout is parsed. The trait seam exists so tests and
//! mock mode can substitute a fixture-driven client.

mod mock;
mod system;

pub use mock::{MockAgentClient, MockResponse};
pub use system::SystemAgentClient;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::config::ProviderSpec;

/// One agent invocation request.
#[derive(Debug, Clone, Copy)]
pub struct InvocationRequest<'a> {
    pub provider: &'a ProviderSpec,
    pub model: &'a str,
    pub prompt: &'a str,
    /// Tee target for the captured output
    pub output_file: Option<&'a Path>,
    /// Where the agent is expected to write its status document. The real
    /// client never touches this; the mock writes its scripted status here.
    pub status_file: &'a Path,
}

/// Result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// Combined stdout + stderr
    pub output: String,
    pub exit_code: i32,
}

impl AgentInvocation {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Verify the provider binary is invocable. Called once at session start.
    fn check_provider(&self, provider: &ProviderSpec) -> Result<()>;

    /// Run the provider to completion. No retries: a non-zero exit is the
    /// caller's problem.
    async fn execute(&self, request: InvocationRequest<'_>) -> Result<AgentInvocation>;
}

/// Expand the `{model}` placeholder in a provider's argument template.
pub(crate) fn provider_args(provider: &ProviderSpec, model: &str) -> Vec<String> {
    provider
        .args
        .iter()
        .map(|a| a.replace("{model}", model))
        .collect()
}
