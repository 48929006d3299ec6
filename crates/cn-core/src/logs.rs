//! Read-time sanitation for dispatch log files.
//!
//! Log files are written raw (ANSI escapes and all) by the supervisor;
//! cleanup happens when status endpoints read a tail back out.

use std::path::Path;

use crate::runtime::runtime_home;

/// Strip ANSI CSI (`ESC [ ... <final>`) and OSC (`ESC ] ... BEL/ST`)
/// sequences from a string.
pub fn strip_ansi(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\u{1b}' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI: parameter/intermediate bytes then a final byte @..~
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                // OSC: terminated by BEL or ESC \
                while let Some(c) = chars.next() {
                    if c == '\u{07}' {
                        break;
                    }
                    if c == '\u{1b}' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            Some(_) => {
                // Two-char escape (e.g. ESC c); drop both.
                chars.next();
            }
            None => {}
        }
    }
    out
}

/// Extract human-readable text from a JSONL log line.
///
/// The primary CLI emits lines like `{"level":"info","message":"..."}`;
/// plain lines pass through untouched.
pub fn parse_jsonl_line(line: &str) -> String {
    let stripped = line.trim();
    if !stripped.starts_with('{') {
        return line.to_string();
    }
    match serde_json::from_str::<serde_json::Value>(stripped) {
        Ok(value) => value
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| line.to_string()),
        Err(_) => line.to_string(),
    }
}

/// Keep the last `max_lines` non-empty lines of `text`, capped at
/// `max_chars` (from the end, preserving the most recent output).
pub fn tail_text(text: &str, max_lines: usize, max_chars: usize) -> Option<String> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(max_lines);
    let tail = lines[start..].join("\n");
    if tail.len() > max_chars {
        let cut = tail.len() - max_chars;
        // Land on a char boundary.
        let cut = (cut..tail.len())
            .find(|i| tail.is_char_boundary(*i))
            .unwrap_or(tail.len());
        Some(tail[cut..].to_string())
    } else {
        Some(tail)
    }
}

/// Read the sanitized tail of a dispatch log file.
///
/// Paths outside the runtime home (or the system temp dir, which tests
/// and the tmp-fallback home use) are refused; status endpoints must
/// not become a generic file reader.
pub fn read_log_tail(log_file: &Path, max_lines: usize, max_chars: usize) -> Option<String> {
    let path = std::fs::canonicalize(log_file).ok()?;
    let allowed = [
        runtime_home().to_path_buf(),
        std::env::temp_dir(),
    ];
    let permitted = allowed.iter().any(|prefix| {
        let resolved = std::fs::canonicalize(prefix).unwrap_or_else(|_| prefix.clone());
        path.starts_with(resolved)
    });
    if !permitted {
        return None;
    }

    let content = std::fs::read_to_string(&path).ok()?;
    if content.trim().is_empty() {
        return None;
    }
    let sanitized = strip_ansi(&content);
    let lines: Vec<String> = sanitized
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_jsonl_line)
        .collect();
    if lines.is_empty() {
        return None;
    }
    tail_text(&lines.join("\n"), max_lines, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_sequences() {
        assert_eq!(strip_ansi("\u{1b}[1;36mhello\u{1b}[0m"), "hello");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn strips_osc_sequences() {
        assert_eq!(strip_ansi("\u{1b}]0;title\u{07}body"), "body");
        assert_eq!(strip_ansi("\u{1b}]8;;http://x\u{1b}\\link"), "link");
    }

    #[test]
    fn jsonl_message_extracted() {
        assert_eq!(
            parse_jsonl_line(r#"{"level":"info","message":"Working on it"}"#),
            "Working on it"
        );
        assert_eq!(parse_jsonl_line("not json"), "not json");
        assert_eq!(parse_jsonl_line(r#"{"no_message": 1}"#), r#"{"no_message": 1}"#);
    }

    #[test]
    fn tail_respects_line_and_char_caps() {
        let text = "one\ntwo\nthree\nfour";
        assert_eq!(tail_text(text, 2, 1000).unwrap(), "three\nfour");
        assert_eq!(tail_text(text, 10, 4).unwrap(), "four");
        assert!(tail_text("", 5, 100).is_none());
        assert!(tail_text("\n\n  \n", 5, 100).is_none());
    }

    #[test]
    fn read_log_tail_from_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("session.log");
        std::fs::write(&file, "\u{1b}[32mline one\u{1b}[0m\nline two\n").unwrap();

        let tail = read_log_tail(&file, 10, 1000).unwrap();
        assert_eq!(tail, "line one\nline two");
    }

    #[test]
    fn read_log_tail_missing_file() {
        assert!(read_log_tail(Path::new("/tmp/does-not-exist-cn.log"), 5, 100).is_none());
    }
}
