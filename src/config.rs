use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root directory holding one run directory per session
    #[serde(default = "default_sessions_root")]
    pub sessions: String,
    /// Root directory for session lock files
    #[serde(default = "default_locks_root")]
    pub locks: String,
    /// Directory containing stage-type definitions (`<stages>/<name>/stage.yaml`)
    #[serde(default = "default_stages_dir")]
    pub stages: String,
}

fn default_sessions_root() -> String {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".conductor"))
        .join("conductor")
        .join("sessions")
        .to_string_lossy()
        .to_string()
}

fn default_locks_root() -> String {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".conductor"))
        .join("conductor")
        .join("locks")
        .to_string_lossy()
        .to_string()
}

fn default_stages_dir() -> String {
    "stages".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sessions: default_sessions_root(),
            locks: default_locks_root(),
            stages: default_stages_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Agent providers the engine can invoke
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderSpec>,
    /// Seconds to sleep between iterations when a stage does not override it
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: u64,
    /// Short-circuit agent execution with fixture responses (testing)
    #[serde(default)]
    pub mock_mode: bool,
}

fn default_delay_seconds() -> u64 {
    2
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            delay_seconds: default_delay_seconds(),
            mock_mode: false,
        }
    }
}

/// One invocable agent binary. The prompt is piped to stdin; `{model}` in
/// `args` is replaced with the resolved model at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub default_model: String,
}

fn default_providers() -> Vec<ProviderSpec> {
    vec![
        ProviderSpec {
            name: "claude".to_string(),
            command: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            default_model: "sonnet".to_string(),
        },
        ProviderSpec {
            name: "codex".to_string(),
            command: "codex".to_string(),
            args: vec![
                "exec".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
            ],
            default_model: "gpt-5-codex".to_string(),
        },
        ProviderSpec {
            name: "gemini".to_string(),
            command: "gemini".to_string(),
            args: vec!["--model".to_string(), "{model}".to_string()],
            default_model: "gemini-2.5-pro".to_string(),
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// External queue probe. `{session}` is replaced with `pipeline/<session>`.
    /// Stdout line count is the number of ready items; nothing else is parsed.
    #[serde(default = "default_queue_command")]
    pub command: Vec<String>,
}

fn default_queue_command() -> Vec<String> {
    vec![
        "bd".to_string(),
        "ready".to_string(),
        "--scope".to_string(),
        "{session}".to_string(),
    ]
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            command: default_queue_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write logs to `<run_dir>/logs/` in addition to tracking on stderr
    #[serde(default = "default_log_to_file")]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_to_file() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: default_log_to_file(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, the default location, or
    /// built-in defaults, then apply environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match Self::config_file(path) {
            Some(file) if file.exists() => {
                let contents = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read config {}", file.display()))?;
                serde_yaml::from_str(&contents)
                    .with_context(|| format!("failed to parse config {}", file.display()))?
            }
            Some(file) if path.is_some() => {
                anyhow::bail!("config file not found: {}", file.display());
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn config_file(path: Option<&str>) -> Option<PathBuf> {
        match path {
            Some(p) => Some(PathBuf::from(p)),
            None => dirs::config_dir().map(|d| d.join("conductor").join("config.yaml")),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CONDUCTOR_SESSIONS_ROOT") {
            self.paths.sessions = v;
        }
        if let Ok(v) = std::env::var("CONDUCTOR_LOCKS_ROOT") {
            self.paths.locks = v;
        }
        if let Ok(v) = std::env::var("CONDUCTOR_STAGES_DIR") {
            self.paths.stages = v;
        }
        if let Ok(v) = std::env::var("CONDUCTOR_MOCK_MODE") {
            self.agents.mock_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    pub fn sessions_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.sessions)
    }

    pub fn locks_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.locks)
    }

    pub fn stages_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.stages)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSpec> {
        self.agents.providers.iter().find(|p| p.name == name)
    }
}
