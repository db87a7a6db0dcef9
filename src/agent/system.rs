//! Real provider execution via subprocess.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{provider_args, AgentClient, AgentInvocation, InvocationRequest};
use crate::config::ProviderSpec;

/// Invokes providers as child processes with the prompt on stdin.
#[derive(Debug, Default)]
pub struct SystemAgentClient;

impl SystemAgentClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentClient for SystemAgentClient {
    fn check_provider(&self, provider: &ProviderSpec) -> Result<()> {
        which::which(&provider.command).map(|_| ()).with_context(|| {
            format!(
                "provider '{}' not found: install '{}' or choose a different provider",
                provider.name, provider.command
            )
        })
    }

    async fn execute(&self, request: InvocationRequest<'_>) -> Result<AgentInvocation> {
        let args = provider_args(request.provider, request.model);
        debug!(
            provider = %request.provider.name,
            model = %request.model,
            prompt_bytes = request.prompt.len(),
            "invoking agent"
        );

        let mut child = Command::new(&request.provider.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!("failed to spawn provider '{}'", request.provider.command)
            })?;

        // Feed the prompt verbatim, then close stdin so the provider sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .context("failed to write prompt to provider stdin")?;
            drop(stdin);
        }

        let result = child
            .wait_with_output()
            .await
            .context("failed to collect provider output")?;

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&result.stderr);
        if !stderr.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&stderr);
        }

        if let Some(path) = request.output_file {
            crate::fsutil::write_atomic(path, &output)?;
        }

        let exit_code = result.status.code().unwrap_or(-1);
        debug!(
            provider = %request.provider.name,
            exit_code,
            output_bytes = output.len(),
            "agent finished"
        );
        Ok(AgentInvocation { output, exit_code })
    }
}
