use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.cantina/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
}

impl Config {
    /// Load config from `~/.cantina/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cantina")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

/// CLI binary locations and the optional model override for the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_claude_cli")]
    pub claude_cli: String,
    #[serde(default = "default_codex_cli")]
    pub codex_cli: String,
    #[serde(default = "default_gemini_cli")]
    pub gemini_cli: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            claude_cli: default_claude_cli(),
            codex_cli: default_codex_cli(),
            gemini_cli: default_gemini_cli(),
            model: None,
        }
    }
}

/// Timeouts and output caps for single dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Hard ceiling on a dispatch, seconds.
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
    /// Stall window for fallback CLIs, seconds. 0 disables.
    #[serde(default = "default_fallback_stall")]
    pub fallback_stall_timeout_secs: u64,
    /// Stall window for the primary CLI. Disabled by default; the
    /// primary CLI has legitimate long pauses while it thinks.
    #[serde(default)]
    pub claude_stall_timeout_secs: u64,
    /// Max output lines kept in memory per job; the log file keeps all.
    #[serde(default = "default_max_buffered_lines")]
    pub max_buffered_lines: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: default_total_timeout(),
            fallback_stall_timeout_secs: default_fallback_stall(),
            claude_stall_timeout_secs: 0,
            max_buffered_lines: default_max_buffered_lines(),
        }
    }
}

/// Knobs for parallel batch execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Default concurrent agents within a parallel phase.
    #[serde(default = "default_max_parallel")]
    pub default_max_parallel: usize,
    /// Hard upper bound on concurrent agents.
    #[serde(default = "default_max_parallel_limit")]
    pub max_parallel_limit: usize,
    /// Total timeout for a single agent run, seconds.
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    /// Stall window for agent runs, seconds.
    #[serde(default = "default_agent_stall")]
    pub agent_stall_timeout_secs: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            default_max_parallel: default_max_parallel(),
            max_parallel_limit: default_max_parallel_limit(),
            agent_timeout_secs: default_agent_timeout(),
            agent_stall_timeout_secs: default_agent_stall(),
        }
    }
}

fn default_claude_cli() -> String {
    "claude".into()
}

fn default_codex_cli() -> String {
    "codex".into()
}

fn default_gemini_cli() -> String {
    "gemini".into()
}

fn default_total_timeout() -> u64 {
    900
}

fn default_fallback_stall() -> u64 {
    180
}

fn default_max_buffered_lines() -> usize {
    2000
}

fn default_max_parallel() -> usize {
    3
}

fn default_max_parallel_limit() -> usize {
    8
}

fn default_agent_timeout() -> u64 {
    1800
}

fn default_agent_stall() -> u64 {
    300
}
