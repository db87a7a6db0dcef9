//! Centralized environment variable registry.
//!
//! Single source of truth for the environment variables conductor reads.
//! CLI flags take precedence over these; these take precedence over pipeline
//! defaults but not over explicit stage-level configuration.

/// An environment variable definition
#[derive(Debug, Clone)]
pub struct EnvVar {
    pub name: &'static str,
    pub description: &'static str,
    pub category: EnvVarCategory,
    pub default: Option<&'static str>,
    pub example: Option<&'static str>,
}

/// Categories for organizing environment variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvVarCategory {
    /// File path configuration
    Paths,
    /// Provider/model/prompt overrides
    Overrides,
    /// Agent execution behavior
    Agents,
    /// Logging configuration
    Logging,
}

impl EnvVarCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            EnvVarCategory::Paths => "Paths",
            EnvVarCategory::Overrides => "Overrides",
            EnvVarCategory::Agents => "Agents",
            EnvVarCategory::Logging => "Logging",
        }
    }

    pub fn all() -> &'static [EnvVarCategory] {
        &[
            EnvVarCategory::Paths,
            EnvVarCategory::Overrides,
            EnvVarCategory::Agents,
            EnvVarCategory::Logging,
        ]
    }
}

/// Static registry of all documented environment variables
pub static ENV_VARS: &[EnvVar] = &[
    // === Paths ===
    EnvVar {
        name: "CONDUCTOR_SESSIONS_ROOT",
        description: "Root directory holding per-session run directories",
        category: EnvVarCategory::Paths,
        default: Some("~/.local/share/conductor/sessions"),
        example: Some("/tmp/conductor/sessions"),
    },
    EnvVar {
        name: "CONDUCTOR_LOCKS_ROOT",
        description: "Directory for per-session lock files",
        category: EnvVarCategory::Paths,
        default: Some("~/.local/share/conductor/locks"),
        example: Some("/tmp/conductor/locks"),
    },
    EnvVar {
        name: "CONDUCTOR_STAGES_DIR",
        description: "Directory containing stage-type definitions",
        category: EnvVarCategory::Paths,
        default: Some("stages"),
        example: Some("/opt/pipelines/stages"),
    },
    // === Overrides ===
    EnvVar {
        name: "CONDUCTOR_PROVIDER",
        description: "Provider override; beats pipeline defaults, loses to stage config",
        category: EnvVarCategory::Overrides,
        default: None,
        example: Some("codex"),
    },
    EnvVar {
        name: "CONDUCTOR_MODEL",
        description: "Model override; beats pipeline defaults, loses to stage config",
        category: EnvVarCategory::Overrides,
        default: None,
        example: Some("opus"),
    },
    EnvVar {
        name: "CONDUCTOR_CONTEXT",
        description: "Value injected into prompts as ${CONTEXT}",
        category: EnvVarCategory::Overrides,
        default: None,
        example: Some("focus on the parser module"),
    },
    // === Agents ===
    EnvVar {
        name: "CONDUCTOR_MOCK_MODE",
        description: "Short-circuit agent execution with fixture responses",
        category: EnvVarCategory::Agents,
        default: Some("false"),
        example: Some("1"),
    },
    // === Logging ===
    EnvVar {
        name: "RUST_LOG",
        description: "tracing filter; overrides the configured log level",
        category: EnvVarCategory::Logging,
        default: None,
        example: Some("conductor=debug"),
    },
];

/// Get all environment variables for a given category
pub fn env_vars_for_category(category: EnvVarCategory) -> impl Iterator<Item = &'static EnvVar> {
    ENV_VARS.iter().filter(move |v| v.category == category)
}
