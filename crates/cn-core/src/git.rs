use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Default deadline for ordinary git operations. Merges pass their own.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Abstraction over git CLI operations so they can be mocked in tests.
///
/// `Err` means the command could not be run at all (binary missing);
/// everything git itself reports comes back as a `GitOutput` so callers
/// classify rather than unwind.
pub trait GitRunner: Send + Sync + std::fmt::Debug {
    fn run_git(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput, String>;
}

/// Real git runner that shells out to the `git` binary with a deadline.
#[derive(Debug)]
pub struct SystemGitRunner;

impl GitRunner for SystemGitRunner {
    fn run_git(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput, String> {
        let mut child = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to spawn git: {e}"))?;

        // Drain pipes on their own threads so a chatty command can't fill
        // the pipe buffer and wedge the deadline loop below.
        let stdout_handle = child.stdout.take().map(spawn_pipe_reader);
        let stderr_handle = child.stderr.take().map(spawn_pipe_reader);

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        break None;
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(format!("failed to wait on git: {e}")),
            }
        };

        let stdout = join_pipe_reader(stdout_handle);
        let stderr = join_pipe_reader(stderr_handle);

        match status {
            Some(status) => Ok(GitOutput {
                success: status.success(),
                stdout: trim_trailing_newlines(stdout),
                stderr,
            }),
            None => Ok(GitOutput {
                success: false,
                stdout: String::new(),
                stderr: format!(
                    "git {} timed out after {}s",
                    args.first().unwrap_or(&""),
                    timeout.as_secs()
                ),
            }),
        }
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    mut pipe: R,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_pipe_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn trim_trailing_newlines(mut text: String) -> String {
    while text.ends_with('\n') || text.ends_with('\r') {
        text.pop();
    }
    text
}
