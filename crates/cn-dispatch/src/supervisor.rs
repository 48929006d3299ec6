//! Process supervisor for AI CLI dispatches.
//!
//! Wraps one child-process invocation with line streaming, total and
//! stall timeouts, cooperative cancellation, and outcome classification.
//! The supervisor never errors on child misbehaviour; every run ends in
//! a [`DispatchResult`].

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use cn_core::config::Config;
use cn_core::runtime::{dispatch_output_path, new_session_id};

use crate::events::{CompletionStatus, EventKind, EventSender};
use crate::provider::{build_args, detect_token_limit, ClaudeOptions, Provider};
use crate::redact::extract_error_message;
use crate::result::{classify_failure, DispatchResult, ErrorCode};

/// Cancel-to-SIGKILL grace period.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Poll cadence for cancel/timeout checks between reads.
const SELECT_TICK: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// CancelHandle
// ---------------------------------------------------------------------------

/// Settable-once cancellation signal, cheap to poll, shared between a
/// batch and every supervisor it spawned.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Returns `true` the first time, `false` after.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// SupervisorSpec
// ---------------------------------------------------------------------------

/// Everything one supervised run needs.
pub struct SupervisorSpec {
    pub provider: Provider,
    pub cli_path: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub log_file: PathBuf,
    pub session_id: String,
    /// Hard ceiling; must be at least one second.
    pub total_timeout: Duration,
    /// Zero disables stall detection.
    pub stall_timeout: Duration,
    /// Lines kept in memory; the log file keeps everything.
    pub max_buffered_lines: usize,
    pub cancel: CancelHandle,
    pub events: Option<EventSender>,
}

fn emit(events: &Option<EventSender>, kind: EventKind) {
    if let Some(sender) = events {
        sender.send(kind);
    }
}

// ---------------------------------------------------------------------------
// run_supervised
// ---------------------------------------------------------------------------

enum LoopExit {
    Eof,
    Cancelled,
    TimedOut,
    Stalled,
}

/// Launch the child described by `spec` and supervise it to completion.
pub async fn run_supervised(spec: SupervisorSpec) -> DispatchResult {
    assert!(
        spec.total_timeout >= Duration::from_secs(1),
        "total_timeout must be at least 1s"
    );
    assert!(
        spec.stall_timeout <= spec.total_timeout || spec.stall_timeout.is_zero(),
        "stall_timeout must not exceed total_timeout"
    );

    let cli_name = spec.provider.cli_name();

    if let Some(parent) = spec.log_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut log = match std::fs::File::create(&spec.log_file) {
        Ok(file) => file,
        Err(e) => {
            return DispatchResult::failure(
                spec.session_id.clone(),
                spec.provider,
                format!("failed to open log file {}: {e}", spec.log_file.display()),
                ErrorCode::ExecutionFailed,
            );
        }
    };

    emit(&spec.events, EventKind::Start);
    emit(
        &spec.events,
        EventKind::Status(format!("Launching {cli_name}...")),
    );

    let mut cmd = Command::new(&spec.cli_path);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        // Null stdin: the child must never block waiting for input in a
        // non-TTY environment.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for var in spec.provider.stripped_env_vars() {
        cmd.env_remove(var);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let (message, code) = if e.kind() == std::io::ErrorKind::NotFound {
                (
                    format!("{cli_name} not found at '{}'.", spec.cli_path),
                    ErrorCode::CliNotFound,
                )
            } else {
                (
                    format!("failed to launch {cli_name}: {e}"),
                    ErrorCode::ExecutionFailed,
                )
            };
            warn!(provider = %spec.provider, error = %message, "spawn failed");
            emit(&spec.events, EventKind::Error(message.clone()));
            emit(&spec.events, EventKind::Complete(CompletionStatus::Failed));
            return DispatchResult::failure(spec.session_id.clone(), spec.provider, message, code)
                .with_output_file(&spec.log_file);
        }
    };

    info!(
        provider = %spec.provider,
        session_id = %spec.session_id,
        cwd = %spec.cwd.display(),
        "child launched"
    );

    // stdout and stderr merge into one line channel; the senders close
    // when both pipes hit EOF, which is how the loop learns the child
    // is done talking.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, line_tx.clone());
    }
    drop(line_tx);

    emit(
        &spec.events,
        EventKind::Status(format!("{cli_name} is processing your task...")),
    );

    let started = Instant::now();
    let mut last_output = Instant::now();
    let mut lines: VecDeque<String> = VecDeque::new();
    let mut tick = tokio::time::interval(SELECT_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            maybe_line = line_rx.recv() => match maybe_line {
                Some(line) => {
                    record_line(line, &mut log, &mut lines, spec.max_buffered_lines, &spec.events);
                    last_output = Instant::now();
                }
                None => break LoopExit::Eof,
            },
            _ = tick.tick() => {
                if spec.cancel.is_cancelled() {
                    break LoopExit::Cancelled;
                }
                if started.elapsed() > spec.total_timeout {
                    break LoopExit::TimedOut;
                }
                if !spec.stall_timeout.is_zero() && last_output.elapsed() > spec.stall_timeout {
                    break LoopExit::Stalled;
                }
            }
        }
    };

    match exit {
        LoopExit::Eof => {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    let message = format!("error waiting on {cli_name}: {e}");
                    emit(&spec.events, EventKind::Error(message.clone()));
                    emit(&spec.events, EventKind::Complete(CompletionStatus::Failed));
                    return DispatchResult::failure(
                        spec.session_id.clone(),
                        spec.provider,
                        message,
                        ErrorCode::ExecutionFailed,
                    )
                    .with_output_file(&spec.log_file);
                }
            };
            drain_lines(&mut line_rx, &mut log, &mut lines, spec.max_buffered_lines, &spec.events);
            let output = joined(&lines);

            if spec.provider.is_primary() && detect_token_limit(&output) {
                let message = "Claude Code token limit reached. Choose an alternative \
                               provider or wait for reset."
                    .to_string();
                emit(&spec.events, EventKind::Error(message.clone()));
                emit(&spec.events, EventKind::Complete(CompletionStatus::TokenLimit));
                return DispatchResult::failure(
                    spec.session_id.clone(),
                    spec.provider,
                    message,
                    ErrorCode::TokenLimitReached,
                )
                .with_output_file(&spec.log_file)
                .with_output(Some(output));
            }

            if !status.success() {
                let exit_code = status.code().unwrap_or(-1);
                let message = extract_error_message(&output, exit_code, cli_name);
                let code = classify_failure(Some(&message), Some(&output));
                debug!(exit_code, ?code, "child failed");
                emit(&spec.events, EventKind::Error(message.clone()));
                emit(&spec.events, EventKind::Complete(CompletionStatus::Failed));
                return DispatchResult::failure(spec.session_id.clone(), spec.provider, message, code)
                    .with_output_file(&spec.log_file)
                    .with_output(Some(output));
            }

            emit(
                &spec.events,
                EventKind::Status(format!("{cli_name} completed successfully.")),
            );
            emit(&spec.events, EventKind::Complete(CompletionStatus::Success));
            DispatchResult::success(
                spec.session_id.clone(),
                spec.provider,
                Some(spec.log_file.clone()),
                Some(output).filter(|o| !o.is_empty()),
            )
        }
        LoopExit::Cancelled => {
            info!(session_id = %spec.session_id, "cancel observed, terminating child");
            terminate_then_kill(&mut child).await;
            drain_lines(&mut line_rx, &mut log, &mut lines, spec.max_buffered_lines, &spec.events);
            emit(&spec.events, EventKind::Status("Dispatch cancelled.".into()));
            emit(&spec.events, EventKind::Complete(CompletionStatus::Cancelled));
            DispatchResult::failure(
                spec.session_id.clone(),
                spec.provider,
                "run cancelled by user.",
                ErrorCode::Cancelled,
            )
            .with_output_file(&spec.log_file)
            .with_output(Some(joined(&lines)))
        }
        LoopExit::TimedOut => {
            kill_now(&mut child).await;
            drain_lines(&mut line_rx, &mut log, &mut lines, spec.max_buffered_lines, &spec.events);
            let message = format!(
                "{cli_name} timed out after {}s.",
                spec.total_timeout.as_secs()
            );
            warn!(session_id = %spec.session_id, "{message}");
            emit(&spec.events, EventKind::Error(message.clone()));
            emit(&spec.events, EventKind::Complete(CompletionStatus::Failed));
            DispatchResult::failure(spec.session_id.clone(), spec.provider, message, ErrorCode::Timeout)
                .with_output_file(&spec.log_file)
                .with_output(Some(joined(&lines)))
        }
        LoopExit::Stalled => {
            kill_now(&mut child).await;
            drain_lines(&mut line_rx, &mut log, &mut lines, spec.max_buffered_lines, &spec.events);
            let message = format!(
                "{cli_name} stalled with no output for {}s.",
                spec.stall_timeout.as_secs()
            );
            warn!(session_id = %spec.session_id, "{message}");
            emit(&spec.events, EventKind::Error(message.clone()));
            emit(&spec.events, EventKind::Complete(CompletionStatus::Failed));
            DispatchResult::failure(spec.session_id.clone(), spec.provider, message, ErrorCode::Stalled)
                .with_output_file(&spec.log_file)
                .with_output(Some(joined(&lines)))
        }
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

fn record_line(
    line: String,
    log: &mut std::fs::File,
    lines: &mut VecDeque<String>,
    cap: usize,
    events: &Option<EventSender>,
) {
    let line = line.trim_end_matches('\r').to_string();
    // Flushed per line so callers can tail the file mid-run.
    let _ = writeln!(log, "{line}");
    let _ = log.flush();
    if lines.len() >= cap {
        // Oldest lines fall out of memory; the file keeps them.
        lines.pop_front();
    }
    emit(events, EventKind::Output(line.clone()));
    lines.push_back(line);
}

fn drain_lines(
    rx: &mut mpsc::Receiver<String>,
    log: &mut std::fs::File,
    lines: &mut VecDeque<String>,
    cap: usize,
    events: &Option<EventSender>,
) {
    while let Ok(line) = rx.try_recv() {
        record_line(line, log, lines, cap, events);
    }
}

fn joined(lines: &VecDeque<String>) -> String {
    lines.iter().cloned().collect::<Vec<_>>().join("\n")
}

/// SIGTERM, wait up to the grace period, then SIGKILL.
async fn terminate_then_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "child ignored SIGTERM, escalating to SIGKILL");
    }
    kill_now(child).await;
}

async fn kill_now(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

// ---------------------------------------------------------------------------
// CliDispatcher seam
// ---------------------------------------------------------------------------

/// One dispatch request against a project directory.
pub struct DispatchRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Pre-reserved log file; resolved from the runtime layout when
    /// absent.
    pub output_file: Option<PathBuf>,
    pub session_id: Option<String>,
    pub total_timeout: Option<Duration>,
    pub stall_timeout: Option<Duration>,
    pub cancel: CancelHandle,
    pub events: Option<EventSender>,
}

impl DispatchRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            output_file: None,
            session_id: None,
            total_timeout: None,
            stall_timeout: None,
            cancel: CancelHandle::new(),
            events: None,
        }
    }

    pub fn with_output_file(mut self, output_file: impl Into<PathBuf>) -> Self {
        self.output_file = Some(output_file.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }
}

/// Abstraction over CLI dispatch so orchestration layers can be tested
/// without real child processes.
#[async_trait]
pub trait CliDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult;
}

/// Production dispatcher: builds provider commands and runs them through
/// the supervisor with runtime-layout log files.
pub struct SupervisorDispatcher {
    provider: Provider,
    cli_path: String,
    options: ClaudeOptions,
    total_timeout: Duration,
    stall_timeout: Duration,
    max_buffered_lines: usize,
}

impl SupervisorDispatcher {
    pub fn new(provider: Provider, cli_path: impl Into<String>) -> Self {
        Self {
            provider,
            cli_path: cli_path.into(),
            options: ClaudeOptions::default(),
            total_timeout: Duration::from_secs(900),
            stall_timeout: provider.default_stall_timeout(),
            max_buffered_lines: 2000,
        }
    }

    /// Build a dispatcher for `provider` from loaded configuration.
    pub fn from_config(provider: Provider, config: &Config) -> Self {
        let cli_path = match provider {
            Provider::Claude => config.providers.claude_cli.clone(),
            Provider::Codex => config.providers.codex_cli.clone(),
            Provider::Gemini => config.providers.gemini_cli.clone(),
        };
        let stall_secs = if provider.is_primary() {
            config.dispatch.claude_stall_timeout_secs
        } else {
            config.dispatch.fallback_stall_timeout_secs
        };
        Self {
            provider,
            cli_path,
            options: ClaudeOptions {
                model: config.providers.model.clone(),
                ..ClaudeOptions::default()
            },
            total_timeout: Duration::from_secs(config.dispatch.total_timeout_secs),
            stall_timeout: Duration::from_secs(stall_secs),
            max_buffered_lines: config.dispatch.max_buffered_lines,
        }
    }

    pub fn with_options(mut self, options: ClaudeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

#[async_trait]
impl CliDispatcher for SupervisorDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        let (session_id, log_file) = match (&request.session_id, &request.output_file) {
            (Some(session), Some(file)) => (session.clone(), file.clone()),
            (None, Some(file)) => (new_session_id("dispatch"), file.clone()),
            _ => match dispatch_output_path(
                &request.working_dir,
                "dispatch",
                self.provider.log_suffix(),
            ) {
                Ok(pair) => pair,
                Err(e) => {
                    return DispatchResult::failure(
                        new_session_id("dispatch"),
                        self.provider,
                        format!("failed to reserve dispatch output path: {e}"),
                        ErrorCode::ExecutionFailed,
                    );
                }
            },
        };

        let args = build_args(self.provider, &request.prompt, &self.options);
        run_supervised(SupervisorSpec {
            provider: self.provider,
            cli_path: self.cli_path.clone(),
            args,
            cwd: request.working_dir,
            log_file,
            session_id,
            total_timeout: request.total_timeout.unwrap_or(self.total_timeout),
            stall_timeout: request.stall_timeout.unwrap_or(self.stall_timeout),
            max_buffered_lines: self.max_buffered_lines,
            cancel: request.cancel,
            events: request.events,
        })
        .await
    }
}
