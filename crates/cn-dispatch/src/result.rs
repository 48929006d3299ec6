use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::provider::Provider;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Classified failure codes surfaced to the UI so it can offer the right
/// next step (retry, switch provider, log in, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CliNotFound,
    ExecutionFailed,
    Timeout,
    Stalled,
    Cancelled,
    TokenLimitReached,
    NetworkDisconnect,
    NeedsUserInput,
    AuthRequired,
    /// Reserved: verification is currently informational, but callers
    /// may opt to enforce it in the future.
    VerificationFailed,
    MergeConflict,
}

/// Map a failure to an [`ErrorCode`] from its error message and output.
///
/// The checks run most-specific first; auth comes late because words
/// like "key" show up in unrelated errors too.
pub fn classify_failure(error: Option<&str>, output: Option<&str>) -> ErrorCode {
    let text = format!(
        "{}\n{}",
        error.unwrap_or_default(),
        output.unwrap_or_default()
    )
    .to_lowercase();

    if text.contains("not found at") {
        return ErrorCode::CliNotFound;
    }
    if text.contains("cancelled") {
        return ErrorCode::Cancelled;
    }
    if text.contains("timed out after") {
        return ErrorCode::Timeout;
    }
    if text.contains("stalled with no output") {
        return ErrorCode::Stalled;
    }
    if text.contains("error sending request for url")
        || text.contains("stream disconnected")
        || text.contains("network request failed")
    {
        return ErrorCode::NetworkDisconnect;
    }
    if text.contains("stdin is not a terminal")
        || text.contains("confirm whether you want me to proceed")
        || text.contains("do you want me to proceed")
        || text.contains("please confirm")
        || text.contains("waiting for input")
    {
        return ErrorCode::NeedsUserInput;
    }
    if text.contains("unauthorized")
        || text.contains("invalid api key")
        || text.contains("login")
        || text.contains("auth")
        || text.contains("api key")
    {
        return ErrorCode::AuthRequired;
    }
    if text.contains("verification failed") {
        return ErrorCode::VerificationFailed;
    }
    ErrorCode::ExecutionFailed
}

// ---------------------------------------------------------------------------
// DispatchResult
// ---------------------------------------------------------------------------

/// Normalized outcome of one CLI dispatch. The supervisor always returns
/// one of these; child misbehaviour is classified, never raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub success: bool,
    pub session_id: String,
    pub output_file: Option<PathBuf>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub token_limit_reached: bool,
    pub cancelled: bool,
    pub provider: Provider,
}

impl DispatchResult {
    pub fn success(
        session_id: impl Into<String>,
        provider: Provider,
        output_file: Option<PathBuf>,
        output: Option<String>,
    ) -> Self {
        Self {
            success: true,
            session_id: session_id.into(),
            output_file,
            output,
            error: None,
            error_code: None,
            token_limit_reached: false,
            cancelled: false,
            provider,
        }
    }

    pub fn failure(
        session_id: impl Into<String>,
        provider: Provider,
        error: impl Into<String>,
        error_code: ErrorCode,
    ) -> Self {
        Self {
            success: false,
            session_id: session_id.into(),
            output_file: None,
            output: None,
            error: Some(error.into()),
            error_code: Some(error_code),
            token_limit_reached: error_code == ErrorCode::TokenLimitReached,
            cancelled: error_code == ErrorCode::Cancelled,
            provider,
        }
    }

    pub fn with_output_file(mut self, output_file: impl Into<PathBuf>) -> Self {
        self.output_file = Some(output_file.into());
        self
    }

    pub fn with_output(mut self, output: Option<String>) -> Self {
        self.output = output.filter(|o| !o.is_empty());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_failures() {
        assert_eq!(
            classify_failure(Some("Gemini CLI not found at 'gemini'."), None),
            ErrorCode::CliNotFound
        );
        assert_eq!(
            classify_failure(Some("run cancelled by user"), None),
            ErrorCode::Cancelled
        );
        assert_eq!(
            classify_failure(Some("Codex CLI timed out after 900s."), None),
            ErrorCode::Timeout
        );
        assert_eq!(
            classify_failure(Some("Gemini CLI stalled with no output for 180s."), None),
            ErrorCode::Stalled
        );
        assert_eq!(
            classify_failure(None, Some("error sending request for url (https://x)")),
            ErrorCode::NetworkDisconnect
        );
        assert_eq!(
            classify_failure(None, Some("Do you want me to proceed? [y/N]")),
            ErrorCode::NeedsUserInput
        );
        assert_eq!(
            classify_failure(None, Some("401 unauthorized")),
            ErrorCode::AuthRequired
        );
        assert_eq!(
            classify_failure(Some("exit status 2"), Some("boom")),
            ErrorCode::ExecutionFailed
        );
    }

    #[test]
    fn failure_constructor_sets_flags() {
        let r = DispatchResult::failure("s", Provider::Claude, "limit", ErrorCode::TokenLimitReached);
        assert!(r.token_limit_reached);
        assert!(!r.cancelled);
        let r = DispatchResult::failure("s", Provider::Codex, "stop", ErrorCode::Cancelled);
        assert!(r.cancelled);
    }

    #[test]
    fn result_serializes_snake_case_codes() {
        let r = DispatchResult::failure("s", Provider::Gemini, "x", ErrorCode::CliNotFound);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"cli_not_found\""));
        assert!(json.contains("\"gemini\""));
    }
}
