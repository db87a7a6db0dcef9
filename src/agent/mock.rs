//! Fixture-driven agent client for mock mode and tests.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;

use super::{AgentClient, AgentInvocation, InvocationRequest};
use crate::config::ProviderSpec;
use crate::status::{Decision, StatusDoc, WorkReport};

/// One scripted invocation outcome.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub output: String,
    pub exit_code: i32,
    /// Status the "agent" writes; `None` simulates an agent that never
    /// produced one.
    pub status: Option<StatusDoc>,
}

impl MockResponse {
    pub fn deciding(decision: Decision) -> Self {
        Self {
            output: format!("mock agent run ({})", decision.as_str()),
            exit_code: 0,
            status: Some(StatusDoc {
                decision,
                reason: "mock".to_string(),
                summary: format!("mock iteration ended with {}", decision.as_str()),
                work: WorkReport::default(),
                errors: Vec::new(),
                timestamp: Some(chrono::Utc::now()),
            }),
        }
    }

    pub fn exiting(code: i32) -> Self {
        Self {
            output: format!("mock agent crashed with {code}"),
            exit_code: code,
            status: None,
        }
    }

    pub fn silent() -> Self {
        Self {
            output: "mock agent forgot the status".to_string(),
            exit_code: 0,
            status: None,
        }
    }
}

/// Plays back a script of responses; repeats the last one when exhausted.
#[derive(Debug, Default)]
pub struct MockAgentClient {
    script: Mutex<Vec<MockResponse>>,
}

impl MockAgentClient {
    /// A mock that stops on its first iteration.
    pub fn new() -> Self {
        Self::with_script(vec![MockResponse::deciding(Decision::Stop)])
    }

    pub fn with_script(responses: Vec<MockResponse>) -> Self {
        let mut script = responses;
        script.reverse();
        Self {
            script: Mutex::new(script),
        }
    }
}

#[async_trait]
impl AgentClient for MockAgentClient {
    fn check_provider(&self, _provider: &ProviderSpec) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, request: InvocationRequest<'_>) -> Result<AgentInvocation> {
        let response = {
            let mut script = self
                .script
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if script.len() > 1 {
                script.pop()
            } else {
                script.last().cloned()
            }
        }
        .unwrap_or_else(MockResponse::silent);

        if let Some(status) = &response.status {
            status.write(request.status_file)?;
        }
        if let Some(path) = request.output_file {
            crate::fsutil::write_atomic(path, &response.output)?;
        }
        Ok(AgentInvocation {
            output: response.output,
            exit_code: response.exit_code,
        })
    }
}
