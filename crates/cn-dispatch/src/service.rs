//! Background dispatch jobs: store bookkeeping around the supervisor.
//!
//! This is the in-process API the HTTP layer consumes; start a job and
//! get a job id back immediately, then poll the store while the
//! supervisor streams into the job's log file.

use std::path::PathBuf;
use std::sync::Arc;

use cn_core::logs::tail_text;
use cn_core::runtime::dispatch_output_path;

use crate::job_store::{DispatchJob, JobPatch, JobPhase, JobStatus, JobStore, StoreKind};
use crate::provider::Provider;
use crate::redact::prompt_preview;
use crate::supervisor::{CliDispatcher, DispatchRequest};

/// Lines / chars of output kept on the job record for quick status
/// reads; the full output stays in the log file.
const TAIL_LINES: usize = 24;
const TAIL_CHARS: usize = 2400;

/// Runs dispatches as background jobs against one store.
///
/// The primary service uses a [`StoreKind::Primary`] store and a
/// Claude-backed dispatcher; fallback services pair a
/// [`StoreKind::Fallback`] store with the Codex or Gemini dispatcher.
pub struct DispatchService {
    provider: Provider,
    dispatcher: Arc<dyn CliDispatcher>,
    store: Arc<JobStore>,
}

impl DispatchService {
    pub fn new(
        provider: Provider,
        kind: StoreKind,
        dispatcher: Arc<dyn CliDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            dispatcher,
            store: Arc::new(JobStore::new(kind)),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn job(&self, job_id: &str) -> Option<DispatchJob> {
        self.store.get(job_id)
    }

    /// Request cancellation of a running job. The supervisor observes
    /// the flag within one poll tick.
    pub fn cancel(&self, job_id: &str) -> bool {
        let Some(job) = self.store.get(job_id) else {
            return false;
        };
        if job.done {
            return false;
        }
        if let Some(handle) = self.store.cancel_handle(job_id) {
            handle.cancel();
        }
        self.store.update(
            job_id,
            JobPatch {
                phase: Some(JobPhase::Cancelling),
                message: Some("Cancellation requested.".into()),
                ..JobPatch::default()
            },
        );
        true
    }

    /// Create a job record and launch the dispatch in the background.
    /// Returns the queued job snapshot immediately.
    pub fn start(self: &Arc<Self>, prompt: String, project_path: PathBuf) -> DispatchJob {
        let session = dispatch_output_path(
            &project_path,
            "dispatch",
            self.provider.log_suffix(),
        )
        .ok();
        let job = self.store.create(
            prompt_preview(&prompt, 180),
            project_path.clone(),
            session.as_ref().map(|(_, path)| path.clone()),
        );

        let service = Arc::clone(self);
        let job_id = job.job_id.clone();
        let cancel = job.cancel.clone();
        tokio::spawn(async move {
            let cli_name = service.provider.cli_name();
            service.store.update(
                &job_id,
                JobPatch {
                    status: Some(JobStatus::Running),
                    phase: Some(JobPhase::Launching),
                    message: Some(format!("Launching {cli_name}...")),
                    started_at: Some(chrono::Utc::now()),
                    ..JobPatch::default()
                },
            );
            service.store.update(
                &job_id,
                JobPatch {
                    phase: Some(JobPhase::Running),
                    message: Some(format!("{cli_name} is processing your task.")),
                    ..JobPatch::default()
                },
            );

            let mut request = DispatchRequest::new(prompt, project_path).with_cancel(cancel);
            if let Some((session_id, path)) = session {
                request.session_id = Some(session_id);
                request.output_file = Some(path);
            }
            let result = service.dispatcher.dispatch(request).await;

            let succeeded = result.success;
            let message = if succeeded {
                format!("{cli_name} completed successfully.")
            } else if result.token_limit_reached {
                format!("{cli_name} token limit reached. Choose a fallback provider.")
            } else if result.cancelled {
                "Dispatch cancelled.".to_string()
            } else {
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{cli_name} did not complete successfully."))
            };
            let output_tail = result
                .output
                .as_deref()
                .and_then(|output| tail_text(output, TAIL_LINES, TAIL_CHARS));
            let log_file = result.output_file.clone();

            service.store.update(
                &job_id,
                JobPatch {
                    status: Some(if succeeded {
                        JobStatus::Succeeded
                    } else {
                        JobStatus::Failed
                    }),
                    phase: Some(if succeeded {
                        JobPhase::Complete
                    } else if result.cancelled {
                        JobPhase::Cancelled
                    } else {
                        JobPhase::Failed
                    }),
                    message: Some(message),
                    finished_at: Some(chrono::Utc::now()),
                    done: Some(true),
                    output_tail,
                    log_file,
                    result: Some(result),
                    ..JobPatch::default()
                },
            );
        });

        job
    }
}
