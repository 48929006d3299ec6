//! Prompt previews and error-message extraction.
//!
//! Job records persist a short preview of every prompt. Prompts routinely
//! quote project files, which routinely contain credentials, so previews
//! are redacted before they touch a store.

/// Key substrings that mark a `key=value` / `key: value` pair as secret.
const SECRET_KEY_HINTS: [&str; 6] = [
    "password", "secret", "token", "api_key", "apikey", "credential",
];

/// Well-known credential prefixes (API keys, PATs, bot tokens).
const SECRET_VALUE_PREFIXES: [&str; 6] =
    ["sk-", "ghp_", "github_pat_", "xoxb-", "xoxp-", "AKIA"];

/// Build a whitespace-collapsed, redacted preview of a prompt.
pub fn prompt_preview(prompt: &str, max_chars: usize) -> String {
    let collapsed: String = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    let redacted = redact_secrets(&collapsed);
    truncate_chars(&redacted, max_chars)
}

/// Mask credential-looking tokens with `[REDACTED]`.
pub fn redact_secrets(text: &str) -> String {
    text.split(' ')
        .map(redact_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn redact_word(word: &str) -> String {
    // key=value or key:value with a secret-looking key.
    for sep in ['=', ':'] {
        if let Some((key, value)) = word.split_once(sep) {
            let key_lower = key.to_lowercase();
            if !value.is_empty()
                && SECRET_KEY_HINTS.iter().any(|hint| key_lower.contains(hint))
            {
                return format!("{key}{sep}[REDACTED]");
            }
        }
    }

    // Bare credential with a recognizable prefix and enough entropy to
    // be real (short fragments like "sk-" alone stay readable).
    if SECRET_VALUE_PREFIXES
        .iter()
        .any(|prefix| word.starts_with(prefix))
        && word.len() > 8
    {
        return "[REDACTED]".to_string();
    }

    word.to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

/// Extract a concise error message from CLI output: the first non-empty
/// line, capped at 240 chars, else a generic exit-code message.
pub fn extract_error_message(output: &str, exit_code: i32, cli_name: &str) -> String {
    for line in output.lines() {
        let cleaned = line.trim();
        if !cleaned.is_empty() {
            return truncate_chars(cleaned, 240);
        }
    }
    format!("{cli_name} exited with code {exit_code}.")
}
