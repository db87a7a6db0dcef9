//! Typed engine failures.
//!
//! Every failure that ends a session is one of these variants; the variant
//! name is what lands in `state.json` as `error.type`, so external tools can
//! branch on it without parsing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Agent subprocess returned a non-zero exit code.
    #[error("agent exited with code {code}")]
    AgentExit { code: i32 },

    /// Agent finished but never wrote its status document.
    #[error("agent did not write status.json")]
    MissingStatus,

    /// Status document existed but was malformed or missing `decision`.
    #[error("agent wrote invalid status.json: {0}")]
    InvalidStatus(String),

    /// Session exceeded its configured runtime limit.
    #[error("runtime limit exceeded")]
    Timeout,

    /// A stage loop exited without running a single iteration. This is an
    /// internal invariant violation, not an agent failure.
    #[error("stage '{0}' completed zero iterations")]
    ZeroIterations(String),

    /// One or more providers inside a parallel block failed.
    #[error("parallel block '{block}' failed: {}", failed.join(", "))]
    ParallelBlockFailed { block: String, failed: Vec<String> },

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// The `error.type` string recorded in the state document.
    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::AgentExit { .. } => "exit_code",
            EngineError::MissingStatus => "missing_status",
            EngineError::InvalidStatus(_) => "invalid_status",
            EngineError::Timeout => "timeout",
            EngineError::ZeroIterations(_) => "zero_iterations",
            EngineError::ParallelBlockFailed { .. } => "parallel_block_failed",
            EngineError::Other(_) => "unknown",
        }
    }

    /// Whether `--resume` is expected to recover from this failure.
    /// `zero_iterations` is an engine bug and should be reported, not resumed.
    pub fn resumable(&self) -> bool {
        !matches!(self, EngineError::ZeroIterations(_))
    }
}
