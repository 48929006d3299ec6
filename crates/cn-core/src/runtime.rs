//! Runtime identity and storage layout.
//!
//! Every registered project gets a stable 16-hex id derived from its
//! canonical path, and a runtime directory under
//! `<runtime home>/projects/<project-id>/` where dispatch logs live. The
//! runtime home is `$CANTINA_HOME` when set and writable, `~/.cantina`
//! otherwise, with a tmp-dir fallback for restricted environments.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Local;

/// Subdirectory of a project's runtime dir holding per-dispatch log files.
pub const DISPATCH_OUTPUT_DIR: &str = "dispatch-output";

static RUNTIME_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Resolve the canonical runtime home, cached for the process lifetime.
pub fn runtime_home() -> &'static Path {
    RUNTIME_HOME.get_or_init(resolve_runtime_home)
}

fn resolve_runtime_home() -> PathBuf {
    if let Ok(configured) = std::env::var("CANTINA_HOME") {
        let path = PathBuf::from(configured);
        if is_writable_dir(&path) {
            return path;
        }
    }

    if let Some(home) = dirs::home_dir() {
        let preferred = home.join(".cantina");
        if is_writable_dir(&preferred) {
            return preferred;
        }
    }

    let fallback = std::env::temp_dir().join("cantina-runtime");
    let _ = std::fs::create_dir_all(&fallback);
    fallback
}

/// Whether `path` exists (or can be created) and accepts write + delete.
fn is_writable_dir(path: &Path) -> bool {
    if std::fs::create_dir_all(path).is_err() {
        return false;
    }
    let probe = path.join(format!(
        ".cn-write-probe-{}",
        uuid::Uuid::new_v4().simple()
    ));
    match std::fs::write(&probe, "ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Stable canonical project id from an absolute path.
///
/// The id is the first 16 hex chars of a digest over the symlink-resolved
/// path, so the same repository always maps to the same runtime dir.
pub fn project_id_for_path(project_path: &Path) -> String {
    let canonical = std::fs::canonicalize(project_path)
        .unwrap_or_else(|_| project_path.to_path_buf());
    let digest = ring::digest::digest(
        &ring::digest::SHA256,
        canonical.to_string_lossy().as_bytes(),
    );
    let mut hex = String::with_capacity(16);
    for byte in digest.as_ref().iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Return (and create) the runtime directory for a project id.
pub fn project_runtime_dir(project_id: &str) -> std::io::Result<PathBuf> {
    let target = runtime_home().join("projects").join(project_id);
    std::fs::create_dir_all(&target)?;
    Ok(target)
}

/// Generate a fresh session id with the given prefix.
///
/// Format: `<prefix>-YYYYMMDDHHMMSS-<8 hex>`. `dispatch` is used for
/// blocking dispatches, `stream` for streaming ones.
pub fn new_session_id(prefix: &str) -> String {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{stamp}-{}", &suffix[..8])
}

/// Reserve a session id and log file path for a dispatch.
///
/// Callers get the path before the dispatch starts so they can monitor
/// the file during execution. `provider_suffix` distinguishes fallback
/// provider logs (`<session>-codex.log`). If the reserved path already
/// exists a fresh session id is drawn; collisions are unlikely
/// (timestamp + 8 random hex) but cheap to rule out.
pub fn dispatch_output_path(
    project_path: &Path,
    session_prefix: &str,
    provider_suffix: Option<&str>,
) -> std::io::Result<(String, PathBuf)> {
    let project_id = project_id_for_path(project_path);
    let output_dir = project_runtime_dir(&project_id)?.join(DISPATCH_OUTPUT_DIR);
    std::fs::create_dir_all(&output_dir)?;

    loop {
        let session_id = new_session_id(session_prefix);
        let file_name = match provider_suffix {
            Some(provider) => format!("{session_id}-{provider}.log"),
            None => format!("{session_id}.log"),
        };
        let path = output_dir.join(file_name);
        if !path.exists() {
            return Ok((session_id, path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_stable_and_short() {
        let a = project_id_for_path(Path::new("/tmp"));
        let b = project_id_for_path(Path::new("/tmp"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn project_id_differs_per_path() {
        let a = project_id_for_path(Path::new("/tmp"));
        let b = project_id_for_path(Path::new("/usr"));
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_format() {
        let id = new_session_id("dispatch");
        assert!(id.starts_with("dispatch-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 14); // YYYYMMDDHHMMSS
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn session_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..20).map(|_| new_session_id("stream")).collect();
        assert_eq!(ids.len(), 20);
    }

    #[test]
    fn dispatch_output_path_creates_dir_and_reserves_log() {
        let tmp = tempfile::tempdir().unwrap();
        let (session_id, path) =
            dispatch_output_path(tmp.path(), "dispatch", None).unwrap();
        assert!(path.parent().unwrap().ends_with(DISPATCH_OUTPUT_DIR));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&session_id));
        assert!(!path.exists());
    }

    #[test]
    fn dispatch_output_path_fallback_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, path) =
            dispatch_output_path(tmp.path(), "dispatch", Some("gemini")).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("-gemini.log"));
    }

    #[test]
    fn runtime_home_is_writable() {
        assert!(is_writable_dir(&runtime_home().to_path_buf()));
    }
}
