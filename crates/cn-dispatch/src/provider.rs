use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Claude usage-limit phrases. Matching is case-insensitive and guarded
/// by [`detect_token_limit`] so passing mentions don't trip it.
pub const TOKEN_LIMIT_PHRASES: [&str; 4] = [
    "usage limit reached",
    "you've exceeded your usage limit",
    "please wait until your limit resets",
    "your claude.ai usage limit",
];

/// A line only counts as a limit hit when it also carries one of these.
const ERROR_INDICATORS: [&str; 4] = ["error", "failed", "exceeded", "reached"];

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// The CLIs the dispatcher knows how to drive. Claude is the primary;
/// Codex and Gemini are fallbacks offered when the primary hits its
/// usage limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }

    /// Display name used in user-facing error messages.
    pub fn cli_name(&self) -> &'static str {
        match self {
            Provider::Claude => "Claude CLI",
            Provider::Codex => "Codex CLI",
            Provider::Gemini => "Gemini CLI",
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Provider::Claude)
    }

    /// Suffix appended to fallback log file names; the primary's logs
    /// are unsuffixed.
    pub fn log_suffix(&self) -> Option<&'static str> {
        match self {
            Provider::Claude => None,
            Provider::Codex => Some("codex"),
            Provider::Gemini => Some("gemini"),
        }
    }

    /// Default stall window. Disabled for the primary CLI; it has
    /// legitimate long pauses while reasoning over large edits.
    pub fn default_stall_timeout(&self) -> Duration {
        match self {
            Provider::Claude => Duration::ZERO,
            Provider::Codex | Provider::Gemini => Duration::from_secs(180),
        }
    }

    /// Environment variables stripped before spawning. The primary CLI
    /// must authenticate via its OAuth login, not an API key.
    pub fn stripped_env_vars(&self) -> &'static [&'static str] {
        match self {
            Provider::Claude => &["ANTHROPIC_API_KEY"],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Command construction
// ---------------------------------------------------------------------------

/// Optional flags for primary-CLI invocations.
#[derive(Debug, Clone, Default)]
pub struct ClaudeOptions {
    pub model: Option<String>,
    pub system_prompt_file: Option<PathBuf>,
    pub agents_json: Option<String>,
}

/// Build the argument list for a provider invocation.
///
/// Arguments are always passed as a list; the prompt is one element and
/// never concatenated into a shell string.
pub fn build_args(provider: Provider, prompt: &str, options: &ClaudeOptions) -> Vec<String> {
    let mut args = Vec::new();
    if provider.is_primary() {
        // acceptEdits lets the CLI apply file changes without interactive
        // prompts, which would otherwise block a headless dispatch.
        args.push("--permission-mode".into());
        args.push("acceptEdits".into());
        if let Some(model) = &options.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(file) = &options.system_prompt_file {
            args.push("--append-system-prompt-file".into());
            args.push(file.to_string_lossy().into_owned());
        }
        if let Some(agents) = &options.agents_json {
            args.push("--agents".into());
            args.push(agents.clone());
        }
    }
    args.push("-p".into());
    args.push(prompt.to_string());
    args
}

// ---------------------------------------------------------------------------
// Sentinel detection
// ---------------------------------------------------------------------------

/// Detect Claude usage-limit messages in CLI output.
///
/// Only matches the specific limit phrases, and only when the matching
/// line also carries an error indicator; "consider adding a rate limit"
/// in ordinary output must not trip this.
pub fn detect_token_limit(output: &str) -> bool {
    let normalized = output.to_lowercase();
    TOKEN_LIMIT_PHRASES.iter().any(|phrase| {
        normalized.contains(phrase)
            && normalized
                .lines()
                .filter(|line| line.contains(phrase))
                .any(|line| ERROR_INDICATORS.iter().any(|ind| line.contains(ind)))
    })
}
