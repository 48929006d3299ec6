//! Bounded in-memory job stores.
//!
//! Each store maps job id → [`DispatchJob`] under one mutex. Reads hand
//! out snapshot clones so callers never observe torn updates; writes go
//! through field patches; terminal jobs are immutable except to
//! eviction. Stores cap at 200 records, evicting oldest-finished
//! terminal jobs first and never a running one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::result::DispatchResult;
use crate::supervisor::CancelHandle;

const DEFAULT_JOB_CAP: usize = 200;

// ---------------------------------------------------------------------------
// Store kinds
// ---------------------------------------------------------------------------

/// The four stores have identical shape and differ only in id prefix
/// and eviction policy (plan jobs live as long as the batch they serve).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Primary,
    Fallback,
    Stream,
    Plan,
}

impl StoreKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            StoreKind::Primary => "disp-",
            StoreKind::Fallback => "fb-",
            StoreKind::Stream => "stream-",
            StoreKind::Plan => "plan-",
        }
    }

    fn evicts(&self) -> bool {
        !matches!(self, StoreKind::Plan)
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Queued,
    Launching,
    Running,
    Verifying,
    Complete,
    Failed,
    Cancelled,
    Cancelling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub job_id: String,
    pub status: JobStatus,
    pub phase: JobPhase,
    /// Human-readable current state for the UI.
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub done: bool,
    pub project_path: PathBuf,
    pub prompt_preview: String,
    /// Reserved at creation so status readers can tail mid-run.
    pub log_file: Option<PathBuf>,
    pub output_tail: Option<String>,
    pub result: Option<DispatchResult>,
    pub error_detail: Option<String>,
    #[serde(skip, default)]
    pub cancel: CancelHandle,
}

/// Fields that may change after creation. `None` leaves a field alone.
#[derive(Debug, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub phase: Option<JobPhase>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub done: Option<bool>,
    pub log_file: Option<PathBuf>,
    pub output_tail: Option<String>,
    pub result: Option<DispatchResult>,
    pub error_detail: Option<String>,
}

impl JobPatch {
    /// Convenience patch for a finished job.
    pub fn finished(
        status: JobStatus,
        phase: JobPhase,
        message: impl Into<String>,
        result: Option<DispatchResult>,
    ) -> Self {
        Self {
            status: Some(status),
            phase: Some(phase),
            message: Some(message.into()),
            finished_at: Some(Utc::now()),
            done: Some(true),
            result,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

pub struct JobStore {
    kind: StoreKind,
    cap: usize,
    jobs: Mutex<HashMap<String, DispatchJob>>,
}

impl JobStore {
    pub fn new(kind: StoreKind) -> Self {
        Self::with_cap(kind, DEFAULT_JOB_CAP)
    }

    /// A store with a custom cap, for tests.
    pub fn with_cap(kind: StoreKind, cap: usize) -> Self {
        Self {
            kind,
            cap,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Create a job record and return a snapshot of it.
    pub fn create(
        &self,
        prompt_preview: impl Into<String>,
        project_path: impl Into<PathBuf>,
        log_file: Option<PathBuf>,
    ) -> DispatchJob {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let job_id = format!("{}{}", self.kind.prefix(), &suffix[..12]);
        let job = DispatchJob {
            job_id: job_id.clone(),
            status: JobStatus::Queued,
            phase: JobPhase::Queued,
            message: "Dispatch queued.".into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            done: false,
            project_path: project_path.into(),
            prompt_preview: prompt_preview.into(),
            log_file,
            output_tail: None,
            result: None,
            error_detail: None,
            cancel: CancelHandle::new(),
        };

        let mut jobs = self.jobs.lock().expect("job store lock");
        jobs.insert(job_id, job.clone());
        self.trim_locked(&mut jobs);
        job
    }

    /// Snapshot of a job, or `None`.
    pub fn get(&self, job_id: &str) -> Option<DispatchJob> {
        self.jobs.lock().expect("job store lock").get(job_id).cloned()
    }

    /// Apply a patch atomically. No-op when the job is absent; refused
    /// when the job is already terminal. Returns the updated snapshot.
    pub fn update(&self, job_id: &str, patch: JobPatch) -> Option<DispatchJob> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let job = jobs.get_mut(job_id)?;
        if job.done {
            return Some(job.clone());
        }

        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(phase) = patch.phase {
            job.phase = phase;
        }
        if let Some(message) = patch.message {
            job.message = message;
        }
        if let Some(started_at) = patch.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            job.finished_at = Some(finished_at);
        }
        if let Some(log_file) = patch.log_file {
            job.log_file = Some(log_file);
        }
        if let Some(output_tail) = patch.output_tail {
            job.output_tail = Some(output_tail);
        }
        if let Some(result) = patch.result {
            job.result = Some(result);
        }
        if let Some(error_detail) = patch.error_detail {
            job.error_detail = Some(error_detail);
        }
        if let Some(done) = patch.done {
            job.done = done;
            if done && job.finished_at.is_none() {
                job.finished_at = Some(Utc::now());
            }
        }
        Some(job.clone())
    }

    /// The cancel handle for a job, used by the control-plane cancel
    /// endpoint to reach a running supervisor.
    pub fn cancel_handle(&self, job_id: &str) -> Option<CancelHandle> {
        self.jobs
            .lock()
            .expect("job store lock")
            .get(job_id)
            .map(|job| job.cancel.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("job store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict the oldest terminal jobs while over cap. Running jobs are
    /// never evicted, so a store saturated with live work may exceed the
    /// cap until they finish.
    fn trim_locked(&self, jobs: &mut HashMap<String, DispatchJob>) {
        if !self.kind.evicts() || jobs.len() <= self.cap {
            return;
        }
        let mut terminal: Vec<(String, DateTime<Utc>, DateTime<Utc>)> = jobs
            .values()
            .filter(|job| job.done)
            .map(|job| {
                (
                    job.job_id.clone(),
                    job.finished_at.unwrap_or(job.created_at),
                    job.created_at,
                )
            })
            .collect();
        terminal.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

        let mut victims = terminal.into_iter();
        while jobs.len() > self.cap {
            match victims.next() {
                Some((job_id, _, _)) => {
                    jobs.remove(&job_id);
                }
                None => break,
            }
        }
    }
}
