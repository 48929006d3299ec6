//! Supervisor integration tests against real child processes.
//!
//! These use `sh`/`sleep` stand-ins for the AI CLIs; the supervisor
//! only cares about a command line, a cwd, and pipes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use cn_dispatch::events::{CompletionStatus, DispatchEvent, EventKind, EventSender};
use cn_dispatch::provider::Provider;
use cn_dispatch::result::ErrorCode;
use cn_dispatch::supervisor::{run_supervised, CancelHandle, SupervisorSpec};

fn spec(
    dir: &tempfile::TempDir,
    provider: Provider,
    cli_path: &str,
    args: &[&str],
) -> SupervisorSpec {
    SupervisorSpec {
        provider,
        cli_path: cli_path.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        cwd: dir.path().to_path_buf(),
        log_file: dir.path().join("run.log"),
        session_id: "test-session".into(),
        total_timeout: Duration::from_secs(30),
        stall_timeout: Duration::ZERO,
        max_buffered_lines: 2000,
        cancel: CancelHandle::new(),
        events: None,
    }
}

fn sh(dir: &tempfile::TempDir, provider: Provider, script: &str) -> SupervisorSpec {
    spec(dir, provider, "sh", &["-c", script])
}

#[tokio::test]
async fn success_captures_output_and_writes_log() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_supervised(sh(&dir, Provider::Codex, "echo line1; echo line2")).await;

    assert!(result.success);
    assert!(result.error.is_none());
    let output = result.output.unwrap();
    assert!(output.contains("line1"));
    assert!(output.contains("line2"));

    let log = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
    assert_eq!(log, "line1\nline2\n");
}

#[tokio::test]
async fn stderr_is_merged_into_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let result =
        run_supervised(sh(&dir, Provider::Codex, "echo out; echo err 1>&2")).await;

    assert!(result.success);
    let output = result.output.unwrap();
    assert!(output.contains("out"));
    assert!(output.contains("err"));
}

#[tokio::test]
async fn nonzero_exit_extracts_first_line_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_supervised(sh(
        &dir,
        Provider::Gemini,
        "echo 'boom: something broke'; exit 3",
    ))
    .await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("boom: something broke"));
    assert_eq!(result.error_code, Some(ErrorCode::ExecutionFailed));
}

#[tokio::test]
async fn nonzero_exit_with_no_output_reports_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_supervised(sh(&dir, Provider::Gemini, "exit 7")).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("exited with code 7"));
}

#[tokio::test]
async fn missing_cli_classifies_as_cli_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_supervised(spec(
        &dir,
        Provider::Claude,
        "definitely-not-a-real-cli-xyz",
        &[],
    ))
    .await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::CliNotFound));
    assert!(result.error.unwrap().contains("not found at"));
}

#[tokio::test]
async fn total_timeout_kills_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = spec(&dir, Provider::Codex, "sleep", &["30"]);
    s.total_timeout = Duration::from_secs(1);

    let started = Instant::now();
    let result = run_supervised(s).await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::Timeout));
    assert!(result.error.unwrap().contains("timed out after 1s"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn stall_timeout_kills_a_silent_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = sh(&dir, Provider::Gemini, "echo first; sleep 30");
    s.stall_timeout = Duration::from_secs(1);

    let result = run_supervised(s).await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::Stalled));
    assert!(result.error.unwrap().contains("stalled with no output for 1s"));
    // Output before the stall was still captured.
    assert!(result.output.unwrap().contains("first"));
}

#[tokio::test]
async fn cancel_terminates_within_the_grace_window() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelHandle::new();
    let mut s = spec(&dir, Provider::Codex, "sleep", &["60"]);
    s.cancel = cancel.clone();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = run_supervised(s).await;

    assert!(!result.success);
    assert!(result.cancelled);
    assert_eq!(result.error_code, Some(ErrorCode::Cancelled));
    // SIGTERM + 5s grace + poll tick; well under the 60s sleep.
    assert!(started.elapsed() < Duration::from_secs(7));
}

#[tokio::test]
async fn token_limit_sentinel_fails_a_zero_exit_run() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_supervised(sh(
        &dir,
        Provider::Claude,
        "echo 'Error: usage limit reached for your account'",
    ))
    .await;

    assert!(!result.success);
    assert!(result.token_limit_reached);
    assert_eq!(result.error_code, Some(ErrorCode::TokenLimitReached));
}

#[tokio::test]
async fn rate_limit_chatter_is_not_a_token_limit() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_supervised(sh(
        &dir,
        Provider::Claude,
        "echo 'consider adding a rate limit to this endpoint'",
    ))
    .await;

    assert!(result.success);
    assert!(!result.token_limit_reached);
}

#[tokio::test]
async fn sentinels_only_apply_to_the_primary_provider() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_supervised(sh(
        &dir,
        Provider::Gemini,
        "echo 'Error: usage limit reached'",
    ))
    .await;

    assert!(result.success);
    assert!(!result.token_limit_reached);
}

#[tokio::test]
async fn event_stream_is_ordered_and_terminates_with_complete() {
    let dir = tempfile::tempdir().unwrap();
    let (sender, rx) = EventSender::channel(256);
    let mut s = sh(&dir, Provider::Codex, "echo a; echo b");
    s.events = Some(sender);

    let result = run_supervised(s).await;
    assert!(result.success);

    let events: Vec<DispatchEvent> = rx.drain().collect();
    assert!(!events.is_empty());
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }
    assert_eq!(events[0].kind, EventKind::Start);
    assert_eq!(
        events.last().unwrap().kind,
        EventKind::Complete(CompletionStatus::Success)
    );
    let outputs: Vec<&DispatchEvent> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Output(_)))
        .collect();
    assert_eq!(outputs.len(), 2);
}

#[tokio::test]
async fn cancelled_run_completes_with_cancelled_status() {
    let dir = tempfile::tempdir().unwrap();
    let (sender, rx) = EventSender::channel(256);
    let cancel = CancelHandle::new();
    let mut s = spec(&dir, Provider::Codex, "sleep", &["60"]);
    s.cancel = cancel.clone();
    s.events = Some(sender);

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let _ = run_supervised(s).await;
    let events: Vec<DispatchEvent> = rx.drain().collect();
    assert_eq!(
        events.last().unwrap().kind,
        EventKind::Complete(CompletionStatus::Cancelled)
    );
}

#[tokio::test]
async fn log_parent_directories_are_created() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = sh(&dir, Provider::Codex, "echo nested");
    s.log_file = dir.path().join("a/b/c/run.log");

    let result = run_supervised(s).await;
    assert!(result.success);
    assert!(dir.path().join("a/b/c/run.log").exists());
    assert_eq!(result.output_file, Some(dir.path().join("a/b/c/run.log")));
}

#[tokio::test]
async fn working_directory_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
    let result = run_supervised(sh(&dir, Provider::Codex, "ls")).await;

    assert!(result.success);
    assert!(result.output.unwrap().contains("marker.txt"));
}

#[tokio::test]
async fn output_file_is_reported_even_on_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_supervised(spec(&dir, Provider::Codex, "no-such-binary-cn", &[])).await;
    assert_eq!(result.output_file, Some(PathBuf::from(dir.path().join("run.log"))));
}
