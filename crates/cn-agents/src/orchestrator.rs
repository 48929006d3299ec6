//! The parallel orchestrator; executes an approved plan end-to-end.
//!
//! Phases run sequentially; agents within a phase fan out under a
//! bounded semaphore, each in its own git worktree created from the
//! current HEAD (so later phases see earlier phases' merges). Agent
//! work is committed before any worktree is removed, merges apply in a
//! deterministic order with conflict isolation, verification is
//! recorded but never gates, and cleanup runs on every exit path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use cn_core::config::ParallelConfig;
use cn_core::runtime::{dispatch_output_path, new_session_id};
use cn_core::worktree_manager::WorktreeManager;
use cn_dispatch::supervisor::{CancelHandle, CliDispatcher, DispatchRequest};

use crate::plan::{AgentAssignment, ExecutionPlan, TaskItem, VerificationResult};
use crate::planner::PlanningAgent;
use crate::prompts::RosterEntry;
use crate::roadmap::{FileRoadmapMarker, RoadmapMarker};

// ---------------------------------------------------------------------------
// Status models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Pending => "pending",
            SlotStatus::Running => "running",
            SlotStatus::Succeeded => "succeeded",
            SlotStatus::Failed => "failed",
            SlotStatus::Cancelled => "cancelled",
            SlotStatus::Skipped => "skipped",
        }
    }
}

/// One task assigned to one agent in one phase. Exactly one slot exists
/// per (batch, task_index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSlot {
    pub task_index: usize,
    pub task_text: String,
    pub prompt: String,
    pub group_id: u32,
    pub phase_id: u32,
    pub status: SlotStatus,
    pub worktree_path: Option<PathBuf>,
    pub branch: Option<String>,
    pub output_file: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMethod {
    Clean,
    Conflict,
    Abort,
}

/// Outcome of merging one agent branch back into the main branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub branch: String,
    pub success: bool,
    pub conflict_files: Vec<String>,
    pub resolution_method: ResolutionMethod,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPhase {
    Idle,
    Running,
    Merging,
    Verifying,
    Finalizing,
    Complete,
    Failed,
    Cancelled,
}

impl BatchPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchPhase::Complete | BatchPhase::Failed | BatchPhase::Cancelled
        )
    }
}

/// Full status of one parallel batch, owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBatchStatus {
    pub batch_id: String,
    pub phase: BatchPhase,
    pub current_phase_id: u32,
    pub current_phase_name: String,
    pub agents: Vec<AgentSlot>,
    pub merge_results: Vec<MergeResult>,
    pub verification: Option<VerificationResult>,
    pub verification_output_file: Option<PathBuf>,
    pub finalize_message: Option<String>,
    pub plan_summary: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ParallelBatchStatus {
    fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            phase: BatchPhase::Idle,
            current_phase_id: 0,
            current_phase_name: String::new(),
            agents: Vec::new(),
            merge_results: Vec::new(),
            verification: None,
            verification_output_file: None,
            finalize_message: None,
            plan_summary: String::new(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Slot construction
// ---------------------------------------------------------------------------

/// Build one slot per unique task index referenced by the plan; the
/// first occurrence wins when agents overlap. Indices outside the task
/// list are dropped with a warning.
pub fn build_agent_slots(tasks: &[TaskItem], plan: &ExecutionPlan) -> Vec<AgentSlot> {
    let mut phases: Vec<_> = plan.phases.iter().collect();
    phases.sort_by_key(|p| p.phase_id);

    let mut seen = std::collections::HashSet::new();
    let mut slots = Vec::new();
    for phase in phases {
        let mut agents: Vec<_> = phase.agents.iter().collect();
        agents.sort_by_key(|a| a.agent_id);
        for agent in agents {
            for &task_index in &agent.task_indices {
                if !seen.insert(task_index) {
                    continue;
                }
                let Some(task) = tasks.get(task_index) else {
                    warn!(task_index, "plan references a task index outside the task list");
                    continue;
                };
                slots.push(AgentSlot {
                    task_index,
                    task_text: task.text.clone(),
                    prompt: task.effective_prompt().to_string(),
                    group_id: agent.agent_id,
                    phase_id: phase.phase_id,
                    status: SlotStatus::Pending,
                    worktree_path: None,
                    branch: None,
                    output_file: None,
                    started_at: None,
                    finished_at: None,
                    error: None,
                });
            }
        }
    }
    slots
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct OrchestratorInner {
    project_path: PathBuf,
    dispatcher: Arc<dyn CliDispatcher>,
    roadmap: Arc<dyn RoadmapMarker>,
    parallel_cfg: ParallelConfig,
    batches: Mutex<HashMap<String, ParallelBatchStatus>>,
    cancel_flags: Mutex<HashMap<String, CancelHandle>>,
}

impl OrchestratorInner {
    fn with_status<F: FnOnce(&mut ParallelBatchStatus)>(&self, batch_id: &str, f: F) {
        let mut batches = self.batches.lock().expect("batch map lock");
        if let Some(status) = batches.get_mut(batch_id) {
            f(status);
        }
    }

    fn status_snapshot(&self, batch_id: &str) -> Option<ParallelBatchStatus> {
        self.batches
            .lock()
            .expect("batch map lock")
            .get(batch_id)
            .cloned()
    }

    fn update_slots<F: Fn(&mut AgentSlot)>(&self, batch_id: &str, indices: &[usize], f: F) {
        self.with_status(batch_id, |status| {
            for slot in &mut status.agents {
                if indices.contains(&slot.task_index) {
                    f(slot);
                }
            }
        });
    }

    fn fail_batch(&self, batch_id: &str, error: String) {
        warn!(batch_id, error = %error, "batch failed");
        self.with_status(batch_id, |status| {
            status.phase = BatchPhase::Failed;
            status.error = Some(error);
        });
    }
}

/// Drives parallel batches. One orchestrator serves one repository;
/// only one batch may mutate the repo at a time (enforced by the
/// clean-tree precondition).
pub struct ParallelOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl ParallelOrchestrator {
    pub fn new(project_path: impl Into<PathBuf>, dispatcher: Arc<dyn CliDispatcher>) -> Self {
        let project_path = project_path.into();
        let roadmap: Arc<dyn RoadmapMarker> = Arc::new(FileRoadmapMarker::new(&project_path));
        Self::with_parts(project_path, dispatcher, roadmap, ParallelConfig::default())
    }

    pub fn with_parts(
        project_path: impl Into<PathBuf>,
        dispatcher: Arc<dyn CliDispatcher>,
        roadmap: Arc<dyn RoadmapMarker>,
        parallel_cfg: ParallelConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                project_path: project_path.into(),
                dispatcher,
                roadmap,
                parallel_cfg,
                batches: Mutex::new(HashMap::new()),
                cancel_flags: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fresh batch id: `par-YYYYMMDDHHMMSS-<8 hex>`.
    pub fn generate_batch_id() -> String {
        new_session_id("par")
    }

    pub fn project_path(&self) -> &std::path::Path {
        &self.inner.project_path
    }

    /// Snapshot of a batch's status.
    pub fn get_status(&self, batch_id: &str) -> Option<ParallelBatchStatus> {
        self.inner.status_snapshot(batch_id)
    }

    /// Request cancellation of a batch. Idempotent; `false` for unknown
    /// batches. Running supervisors observe the flag within one poll
    /// tick and terminate their children.
    pub fn cancel_batch(&self, batch_id: &str) -> bool {
        let flags = self.inner.cancel_flags.lock().expect("cancel map lock");
        match flags.get(batch_id) {
            Some(handle) => {
                handle.cancel();
                info!(batch_id, "batch cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Execute an approved plan end-to-end and return the terminal
    /// batch status. Cleanup (worktrees, branches, `finished_at`) runs
    /// on every exit path, including panics inside the batch task.
    pub async fn execute_plan(
        &self,
        batch_id: &str,
        tasks: &[TaskItem],
        plan: &ExecutionPlan,
        max_parallel: usize,
    ) -> ParallelBatchStatus {
        let cancel = CancelHandle::new();
        {
            let mut status = ParallelBatchStatus::new(batch_id);
            status.plan_summary = plan.summary.clone();
            status.started_at = Some(Utc::now());
            status.phase = BatchPhase::Running;
            self.inner
                .batches
                .lock()
                .expect("batch map lock")
                .insert(batch_id.to_string(), status);
            self.inner
                .cancel_flags
                .lock()
                .expect("cancel map lock")
                .insert(batch_id.to_string(), cancel.clone());
        }

        info!(
            batch_id,
            phases = plan.phases.len(),
            tasks = tasks.len(),
            max_parallel,
            "starting parallel batch"
        );

        let run = tokio::spawn(run_batch(
            Arc::clone(&self.inner),
            batch_id.to_string(),
            tasks.to_vec(),
            plan.clone(),
            max_parallel,
            cancel,
        ));
        if let Err(join_error) = run.await {
            self.inner.fail_batch(
                batch_id,
                format!("batch task aborted unexpectedly: {join_error}"),
            );
        }

        // Guaranteed cleanup: whatever survived (commit failures, panic
        // paths) is removed together with the batch's branches.
        if let Ok(wm) = WorktreeManager::new(&self.inner.project_path) {
            let cleaned = wm.cleanup_batch(batch_id);
            if cleaned > 0 {
                info!(batch_id, cleaned, "cleaned surviving worktrees");
            }
        }

        self.inner.with_status(batch_id, |status| {
            if !status.phase.is_terminal() {
                status.phase = BatchPhase::Failed;
                status
                    .error
                    .get_or_insert_with(|| "batch ended without a terminal phase".to_string());
            }
            status.finished_at = Some(Utc::now());
        });

        self.inner
            .status_snapshot(batch_id)
            .unwrap_or_else(|| ParallelBatchStatus::new(batch_id))
    }
}

// ---------------------------------------------------------------------------
// Batch execution
// ---------------------------------------------------------------------------

async fn run_batch(
    inner: Arc<OrchestratorInner>,
    batch_id: String,
    tasks: Vec<TaskItem>,
    plan: ExecutionPlan,
    max_parallel: usize,
    cancel: CancelHandle,
) {
    let wm = match WorktreeManager::new(&inner.project_path) {
        Ok(wm) => Arc::new(wm),
        Err(e) => {
            inner.fail_batch(&batch_id, e.to_string());
            return;
        }
    };

    // Stale worktrees from prior crashes go before anything else.
    let orphans = wm.cleanup_orphans();
    if orphans > 0 {
        info!(%batch_id, orphans, "removed stale worktrees from a previous run");
    }

    // Refuse to run over uncommitted tracked changes; merges would
    // destroy them.
    if !wm.is_working_tree_clean() {
        let dirty = wm.get_dirty_files().join(", ");
        inner.fail_batch(&batch_id, format!("uncommitted changes: {dirty}"));
        return;
    }

    let slots = build_agent_slots(&tasks, &plan);
    if slots.is_empty() {
        inner.fail_batch(&batch_id, "plan references no valid tasks".to_string());
        return;
    }
    inner.with_status(&batch_id, |status| status.agents = slots);

    // Worktrees share the object store, but each still materializes the
    // working tree; surface the footprint before creating any.
    let agent_count: usize = plan.phases.iter().map(|p| p.agents.len()).sum();
    let estimated_bytes = wm.estimate_disk_usage(agent_count as u64);
    if estimated_bytes > 0 {
        debug!(%batch_id, agent_count, estimated_bytes, "estimated worktree disk usage");
    }

    let mut phases = plan.phases.clone();
    phases.sort_by_key(|p| p.phase_id);

    let limit_cap = inner.parallel_cfg.max_parallel_limit.max(1);
    let mut merge_conflict = false;
    let mut cancelled = false;

    for phase in &phases {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        inner.with_status(&batch_id, |status| {
            status.phase = BatchPhase::Running;
            status.current_phase_id = phase.phase_id;
            status.current_phase_name = phase.name.clone();
        });
        info!(
            %batch_id,
            phase_id = phase.phase_id,
            name = %phase.name,
            parallel = phase.parallel,
            "entering phase"
        );

        let limit = if phase.parallel {
            max_parallel.clamp(1, limit_cap)
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(limit));

        let mut agents: Vec<AgentAssignment> = phase.agents.clone();
        agents.sort_by_key(|a| (a.agent_id, lead_index(a)));

        let mut handles = Vec::new();
        for agent in agents.clone() {
            let indices = slot_indices_for(&inner, &batch_id, &agent);
            if indices.is_empty() {
                continue;
            }
            let handle = tokio::spawn(run_agent_group(
                Arc::clone(&inner),
                Arc::clone(&wm),
                batch_id.clone(),
                agent,
                indices.clone(),
                cancel.clone(),
                Arc::clone(&semaphore),
            ));
            handles.push((indices, handle));
        }

        // Phase barrier: every agent finishes (or dies) before merging.
        for (indices, handle) in handles {
            if handle.await.is_err() {
                inner.update_slots(&batch_id, &indices, |slot| {
                    slot.status = SlotStatus::Failed;
                    slot.error = Some("agent task aborted unexpectedly".into());
                    slot.finished_at = Some(Utc::now());
                });
            }
        }

        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        // Merge phase: deterministic (phase, group, task index) order.
        inner.with_status(&batch_id, |status| status.phase = BatchPhase::Merging);
        for agent in &agents {
            let Some(slot) = lead_slot_snapshot(&inner, &batch_id, agent) else {
                continue;
            };
            let (Some(worktree_path), Some(branch)) = (slot.worktree_path, slot.branch) else {
                continue;
            };

            let (removed, message) = wm.remove_worktree(&worktree_path, true);
            if !removed {
                warn!(%batch_id, branch = %branch, %message, "worktree removal failed before merge");
            }

            let (merged, message, conflict_files) = wm.merge_branch(&branch, "HEAD");
            let resolution_method = if merged {
                ResolutionMethod::Clean
            } else if !conflict_files.is_empty() {
                ResolutionMethod::Conflict
            } else {
                ResolutionMethod::Abort
            };
            if resolution_method == ResolutionMethod::Conflict {
                merge_conflict = true;
                warn!(%batch_id, branch = %branch, files = ?conflict_files, "merge conflict");
            }

            inner.with_status(&batch_id, |status| {
                status.merge_results.push(MergeResult {
                    branch: branch.clone(),
                    success: merged,
                    conflict_files: conflict_files.clone(),
                    resolution_method,
                    message: message.clone(),
                });
            });

            wm.delete_branch(&branch);
        }
    }

    if cancelled {
        inner.with_status(&batch_id, |status| {
            for slot in &mut status.agents {
                if matches!(slot.status, SlotStatus::Pending | SlotStatus::Running) {
                    slot.status = SlotStatus::Cancelled;
                }
            }
            status.phase = BatchPhase::Cancelled;
        });
        info!(%batch_id, "batch cancelled; skipping verification and finalize");
        return;
    }

    let snapshot = inner
        .status_snapshot(&batch_id)
        .unwrap_or_else(|| ParallelBatchStatus::new(batch_id.clone()));
    let any_failed = snapshot
        .agents
        .iter()
        .any(|slot| slot.status == SlotStatus::Failed);

    // Verification is informational: always recorded, never gating.
    inner.with_status(&batch_id, |status| status.phase = BatchPhase::Verifying);
    let roster: Vec<RosterEntry> = snapshot
        .agents
        .iter()
        .map(|slot| RosterEntry {
            group_id: slot.group_id,
            phase_id: slot.phase_id,
            status: slot.status.as_str().to_string(),
            error: slot.error.clone(),
            task_text: slot.task_text.clone(),
        })
        .collect();
    let planner = PlanningAgent::new(&inner.project_path, Arc::clone(&inner.dispatcher));
    let verify_log = dispatch_output_path(&inner.project_path, "dispatch", None).ok();
    let verification = planner
        .verify_completion(
            &plan,
            &roster,
            None,
            verify_log.as_ref().map(|(_, path)| path.clone()),
        )
        .await;
    inner.with_status(&batch_id, |status| {
        status.verification = Some(verification.clone());
        status.verification_output_file = verify_log.map(|(_, path)| path);
    });

    if any_failed || merge_conflict {
        let error = if merge_conflict {
            "one or more agent branches had merge conflicts"
        } else {
            "one or more agents failed"
        };
        inner.fail_batch(&batch_id, error.to_string());
        return;
    }

    inner.with_status(&batch_id, |status| status.phase = BatchPhase::Finalizing);
    let finalize_message = finalize(&inner, &wm, &batch_id, &snapshot, &verification);
    inner.with_status(&batch_id, |status| {
        status.finalize_message = Some(finalize_message);
        status.phase = BatchPhase::Complete;
    });
    info!(%batch_id, "batch complete");
}

fn lead_index(agent: &AgentAssignment) -> usize {
    agent.task_indices.iter().copied().min().unwrap_or(0)
}

fn slot_indices_for(
    inner: &OrchestratorInner,
    batch_id: &str,
    agent: &AgentAssignment,
) -> Vec<usize> {
    inner
        .status_snapshot(batch_id)
        .map(|status| {
            status
                .agents
                .iter()
                .filter(|slot| {
                    slot.group_id == agent.agent_id && agent.task_indices.contains(&slot.task_index)
                })
                .map(|slot| slot.task_index)
                .collect()
        })
        .unwrap_or_default()
}

fn lead_slot_snapshot(
    inner: &OrchestratorInner,
    batch_id: &str,
    agent: &AgentAssignment,
) -> Option<AgentSlot> {
    inner.status_snapshot(batch_id).and_then(|status| {
        status
            .agents
            .iter()
            .filter(|slot| slot.group_id == agent.agent_id)
            .min_by_key(|slot| slot.task_index)
            .cloned()
    })
}

/// One agent's full lifecycle: worktree, dispatch, commit, slot states.
async fn run_agent_group(
    inner: Arc<OrchestratorInner>,
    wm: Arc<WorktreeManager>,
    batch_id: String,
    agent: AgentAssignment,
    indices: Vec<usize>,
    cancel: CancelHandle,
    semaphore: Arc<Semaphore>,
) {
    let Ok(_permit) = semaphore.acquire().await else {
        return;
    };

    if cancel.is_cancelled() {
        inner.update_slots(&batch_id, &indices, |slot| {
            slot.status = SlotStatus::Cancelled;
        });
        return;
    }

    // The worktree branches from the current HEAD of the main branch,
    // so this phase's agents see every earlier phase's merges.
    let lead = indices.iter().copied().min().unwrap_or(0) as u32;
    let worktree = match wm.create_worktree(&batch_id, lead, "HEAD") {
        Ok(info) => info,
        Err(e) => {
            inner.update_slots(&batch_id, &indices, |slot| {
                slot.status = SlotStatus::Failed;
                slot.error = Some(format!("worktree creation failed: {e}"));
                slot.finished_at = Some(Utc::now());
            });
            return;
        }
    };

    let log = dispatch_output_path(&inner.project_path, "dispatch", None).ok();
    inner.update_slots(&batch_id, &indices, |slot| {
        slot.status = SlotStatus::Running;
        slot.started_at = Some(Utc::now());
        slot.worktree_path = Some(worktree.path.clone());
        slot.branch = Some(worktree.branch.clone());
        slot.output_file = log.as_ref().map(|(_, path)| path.clone());
    });

    let prompt = agent_dispatch_prompt(&inner, &batch_id, &agent, &indices);
    let mut request = DispatchRequest::new(prompt, &worktree.path)
        .with_cancel(cancel.clone())
        .with_total_timeout(Duration::from_secs(inner.parallel_cfg.agent_timeout_secs))
        .with_stall_timeout(Duration::from_secs(
            inner.parallel_cfg.agent_stall_timeout_secs,
        ));
    if let Some((session_id, path)) = log {
        request.session_id = Some(session_id);
        request.output_file = Some(path);
    }

    let result = inner.dispatcher.dispatch(request).await;

    // Lost-work rule: commit whatever the agent produced before anyone
    // can remove this worktree. Nothing-to-commit is not an error.
    wm.commit_worktree_changes(&worktree.path, &batch_id);

    inner.update_slots(&batch_id, &indices, |slot| {
        slot.finished_at = Some(Utc::now());
        if result.cancelled {
            slot.status = SlotStatus::Cancelled;
        } else if result.success {
            slot.status = SlotStatus::Succeeded;
        } else {
            slot.status = SlotStatus::Failed;
            slot.error = result.error.clone();
        }
    });
}

/// The prompt for one agent: the planner's detailed prompt when it
/// wrote one, else the assigned tasks spelled out.
fn agent_dispatch_prompt(
    inner: &OrchestratorInner,
    batch_id: &str,
    agent: &AgentAssignment,
    indices: &[usize],
) -> String {
    if !agent.agent_prompt.is_empty() {
        return agent.agent_prompt.clone();
    }
    let tasks = inner
        .status_snapshot(batch_id)
        .map(|status| {
            status
                .agents
                .iter()
                .filter(|slot| indices.contains(&slot.task_index))
                .enumerate()
                .map(|(i, slot)| format!("{}. {}", i + 1, slot.prompt))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    format!("Complete the following tasks in this repository:\n{tasks}")
}

/// Finalize: one commit marking the batch boundary (carrying any stray
/// leftovers from merges), roadmap bookkeeping, and the message the UI
/// shows.
fn finalize(
    inner: &OrchestratorInner,
    wm: &WorktreeManager,
    batch_id: &str,
    snapshot: &ParallelBatchStatus,
    verification: &VerificationResult,
) -> String {
    // Roadmap bookkeeping happens first so the checkbox edits ride the
    // finalize commit and the tree ends clean.
    let succeeded_tasks: Vec<String> = snapshot
        .agents
        .iter()
        .filter(|slot| slot.status == SlotStatus::Succeeded)
        .map(|slot| slot.task_text.clone())
        .collect();
    let marked = inner.roadmap.mark_tasks_complete(&succeeded_tasks);

    wm.stage_all();
    let commit_message = format!(
        "feat(parallel): finalize batch {batch_id} — {}",
        if snapshot.plan_summary.is_empty() {
            "parallel execution"
        } else {
            snapshot.plan_summary.as_str()
        }
    );
    let (mut committed, mut sha) = wm.commit(&commit_message);
    if !committed {
        // Nothing staged; still record the batch boundary on main.
        (committed, sha) = wm.commit_allow_empty(&commit_message);
    }

    let mut parts = Vec::new();
    if committed {
        parts.push(format!("changes committed as {sha}"));
    }
    parts.push(format!("marked {marked} item(s) complete"));
    if !verification.overall_pass {
        parts.push("verification noted issues".to_string());
    }
    parts.join("; ")
}
