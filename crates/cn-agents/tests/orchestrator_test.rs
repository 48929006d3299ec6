//! End-to-end orchestrator tests against real temp git repositories.
//!
//! Agent executions are mocked through the `CliDispatcher` seam; the
//! mock writes files into the worktree it is handed, which is exactly
//! what a real agent CLI does from the orchestrator's point of view.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cn_agents::orchestrator::{
    BatchPhase, ParallelOrchestrator, ResolutionMethod, SlotStatus,
};
use cn_agents::plan::{AgentAssignment, ExecutionPhase, ExecutionPlan, TaskItem};
use cn_core::worktree::WORKTREE_DIR_NAME;
use cn_core::worktree_manager::WorktreeManager;
use cn_dispatch::provider::Provider;
use cn_dispatch::result::{DispatchResult, ErrorCode};
use cn_dispatch::supervisor::{CliDispatcher, DispatchRequest};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn init_repo() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    git(tmp.path(), &["init"]);
    git(tmp.path(), &["config", "user.email", "test@test.com"]);
    git(tmp.path(), &["config", "user.name", "Test User"]);
    std::fs::write(tmp.path().join("README.md"), "# Test\n").unwrap();
    git(tmp.path(), &["add", "."]);
    git(tmp.path(), &["commit", "-m", "Initial commit"]);
    tmp
}

fn sample_tasks() -> Vec<TaskItem> {
    vec![
        TaskItem::with_prompt("Add utility functions to src/core/utils.py", "Add helpers"),
        TaskItem::with_prompt("Create tests/test_helpers.py", "Write tests"),
        TaskItem::with_prompt("Update src/components/Header.tsx", "Fix header"),
    ]
}

fn assignment(agent_id: u32, theme: &str, indices: &[usize]) -> AgentAssignment {
    AgentAssignment {
        agent_id,
        theme: theme.into(),
        task_indices: indices.to_vec(),
        rationale: String::new(),
        agent_prompt: format!("Work on tasks {indices:?}"),
    }
}

fn plan(summary: &str, phases: Vec<ExecutionPhase>) -> ExecutionPlan {
    ExecutionPlan {
        summary: summary.into(),
        phases,
        success_criteria: vec!["All tasks completed".into()],
        estimated_total_agents: 0,
        warnings: Vec::new(),
        raw_output: String::new(),
    }
}

fn phase(phase_id: u32, name: &str, parallel: bool, agents: Vec<AgentAssignment>) -> ExecutionPhase {
    ExecutionPhase {
        phase_id,
        name: name.into(),
        description: String::new(),
        parallel,
        agents,
    }
}

fn sequential_plan() -> ExecutionPlan {
    plan(
        "Sequential plan",
        vec![phase(0, "All Tasks", false, vec![assignment(0, "All", &[0, 1, 2])])],
    )
}

fn parallel_plan() -> ExecutionPlan {
    plan(
        "Parallel plan",
        vec![phase(
            0,
            "Parallel Work",
            true,
            vec![
                assignment(0, "Backend", &[0]),
                assignment(1, "Tests", &[1]),
                assignment(2, "Frontend", &[2]),
            ],
        )],
    )
}

fn mixed_plan() -> ExecutionPlan {
    plan(
        "Mixed plan",
        vec![
            phase(0, "Foundation", false, vec![assignment(0, "Backend", &[0])]),
            phase(
                1,
                "Parallel Work",
                true,
                vec![assignment(1, "Tests", &[1]), assignment(2, "Frontend", &[2])],
            ),
        ],
    )
}

// ---------------------------------------------------------------------------
// Mock dispatcher
// ---------------------------------------------------------------------------

const VERIFY_PASS: &str =
    r#"{"overall_pass": true, "criteria_results": [], "summary": "All criteria passed"}"#;
const VERIFY_FAIL: &str = r#"{"overall_pass": false,
  "criteria_results": [{"criterion": "lint passes", "passed": false, "evidence": "errors", "notes": ""}],
  "summary": "Lint failed"}"#;

/// Task index baked into the worktree directory name: `<batch>-<index>`.
fn worktree_index(worktree: &Path) -> usize {
    worktree
        .file_name()
        .unwrap()
        .to_string_lossy()
        .rsplit('-')
        .next()
        .unwrap()
        .parse()
        .unwrap()
}

type AgentAction = dyn Fn(&Path) -> Result<(), String> + Send + Sync;

/// Dispatcher that runs `agent_action` for worktree dispatches and
/// answers verification dispatches (project root) with canned JSON.
struct MockDispatcher {
    agent_action: Box<AgentAction>,
    verification_json: String,
    verification_calls: Mutex<usize>,
}

impl MockDispatcher {
    fn new(action: impl Fn(&Path) -> Result<(), String> + Send + Sync + 'static) -> Arc<Self> {
        Self::with_verification(action, VERIFY_PASS)
    }

    fn with_verification(
        action: impl Fn(&Path) -> Result<(), String> + Send + Sync + 'static,
        verification_json: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_action: Box::new(action),
            verification_json: verification_json.into(),
            verification_calls: Mutex::new(0),
        })
    }

    /// Agents write `agent_output_<task index>.txt` into their worktree.
    fn writing_files() -> Arc<Self> {
        Self::new(|worktree| {
            let index = worktree_index(worktree);
            std::fs::write(
                worktree.join(format!("agent_output_{index}.txt")),
                format!("Output from task {index}\n"),
            )
            .map_err(|e| e.to_string())
        })
    }

    fn verification_count(&self) -> usize {
        *self.verification_calls.lock().unwrap()
    }
}

#[async_trait]
impl CliDispatcher for MockDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        let in_worktree = request
            .working_dir
            .to_string_lossy()
            .contains(WORKTREE_DIR_NAME);
        if in_worktree {
            match (self.agent_action)(&request.working_dir) {
                Ok(()) => DispatchResult::success(
                    "mock-session",
                    Provider::Claude,
                    request.output_file.clone(),
                    Some("agent finished".into()),
                ),
                Err(e) => DispatchResult::failure(
                    "mock-session",
                    Provider::Claude,
                    e,
                    ErrorCode::ExecutionFailed,
                ),
            }
        } else {
            *self.verification_calls.lock().unwrap() += 1;
            DispatchResult::success("verify-session", Provider::Claude, None, None)
                .with_output(Some(self.verification_json.clone()))
        }
    }
}

/// Dispatcher that cancels the batch from inside the first agent run.
struct CancellingDispatcher;

#[async_trait]
impl CliDispatcher for CancellingDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        request.cancel.cancel();
        DispatchResult::failure(
            "mock-session",
            Provider::Claude,
            "run cancelled by user.",
            ErrorCode::Cancelled,
        )
    }
}

fn orchestrator(repo: &tempfile::TempDir, dispatcher: Arc<dyn CliDispatcher>) -> ParallelOrchestrator {
    ParallelOrchestrator::new(repo.path(), dispatcher)
}

// ---------------------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dirty_tree_is_refused_without_creating_worktrees() {
    let repo = init_repo();
    std::fs::write(repo.path().join("README.md"), "# Modified content\n").unwrap();

    let orch = orchestrator(&repo, MockDispatcher::writing_files());
    let batch_id = ParallelOrchestrator::generate_batch_id();
    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &sequential_plan(), 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Failed);
    assert!(status.error.unwrap().contains("uncommitted changes"));
    assert!(!repo.path().join(WORKTREE_DIR_NAME).exists());
}

#[tokio::test]
async fn untracked_files_do_not_block_execution() {
    let repo = init_repo();
    std::fs::write(repo.path().join("scratch.txt"), "untracked").unwrap();

    let orch = orchestrator(&repo, MockDispatcher::writing_files());
    let batch_id = ParallelOrchestrator::generate_batch_id();
    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &sequential_plan(), 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Complete);
}

#[tokio::test]
async fn stale_worktrees_are_cleaned_before_the_batch_runs() {
    // Scenario F: a crashed prior batch left a worktree behind.
    let repo = init_repo();
    let wm = WorktreeManager::new(repo.path()).unwrap();
    wm.create_worktree("par-stale", 0, "HEAD").unwrap();

    let orch = orchestrator(&repo, MockDispatcher::writing_files());
    let batch_id = ParallelOrchestrator::generate_batch_id();
    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &sequential_plan(), 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Complete);
    assert!(wm.list_worktrees().is_empty());
    let stale_branches = git(repo.path(), &["branch", "--list", "parallel/par-stale/*"]);
    assert!(stale_branches.trim().is_empty());
}

// ---------------------------------------------------------------------------
// Scenario A: sequential happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_batch_merges_agent_work_and_finalizes() {
    let repo = init_repo();
    let dispatcher = MockDispatcher::new(|worktree| {
        std::fs::write(worktree.join("helpers.py"), "def helper(): pass\n")
            .map_err(|e| e.to_string())
    });
    let orch = orchestrator(&repo, dispatcher);
    let batch_id = ParallelOrchestrator::generate_batch_id();

    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &sequential_plan(), 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Complete);
    assert_eq!(status.agents.len(), 3);
    assert!(status
        .agents
        .iter()
        .all(|slot| slot.status == SlotStatus::Succeeded));
    assert!(status.started_at.is_some());
    assert!(status.finished_at.is_some());

    // Lost-work rule: the agent's file landed on main.
    assert!(repo.path().join("helpers.py").exists());

    // One agent-work commit, finalize commit last.
    let log = git(repo.path(), &["log", "--oneline"]);
    assert!(log.contains(&format!("Agent work for batch {batch_id}")));
    let head = git(repo.path(), &["log", "--oneline", "-1"]);
    assert!(head.contains("feat(parallel)"));

    // Worktrees and branches are gone.
    assert!(!repo.path().join(WORKTREE_DIR_NAME).exists());
    let branches = git(repo.path(), &["branch", "--list", "parallel/*"]);
    assert!(branches.trim().is_empty());

    let finalize = status.finalize_message.unwrap().to_lowercase();
    assert!(finalize.contains("committed as"));
    assert!(finalize.contains("item(s) complete"));
}

// ---------------------------------------------------------------------------
// Scenario B: parallel independent agents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_agents_merge_in_task_index_order() {
    let repo = init_repo();
    let orch = orchestrator(&repo, MockDispatcher::writing_files());
    let batch_id = ParallelOrchestrator::generate_batch_id();

    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &parallel_plan(), 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Complete);
    for index in 0..3 {
        assert!(
            repo.path().join(format!("agent_output_{index}.txt")).exists(),
            "agent {index} output missing on main"
        );
    }

    // Merge order determinism: branches apply in task-index order.
    assert_eq!(status.merge_results.len(), 3);
    for (position, merge) in status.merge_results.iter().enumerate() {
        assert_eq!(merge.branch, format!("parallel/{batch_id}/{position}"));
        assert!(merge.success);
        assert_eq!(merge.resolution_method, ResolutionMethod::Clean);
    }
}

// ---------------------------------------------------------------------------
// Scenario C: mixed phases; later phases see earlier merges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_phase_worktrees_contain_first_phase_output() {
    let repo = init_repo();
    let core_seen: Arc<Mutex<HashMap<usize, bool>>> = Arc::new(Mutex::new(HashMap::new()));
    let seen = Arc::clone(&core_seen);

    let dispatcher = MockDispatcher::new(move |worktree| {
        let index = worktree_index(worktree);
        if index == 0 {
            std::fs::write(worktree.join("core.py"), "CORE = True\n").map_err(|e| e.to_string())
        } else {
            seen.lock()
                .unwrap()
                .insert(index, worktree.join("core.py").exists());
            std::fs::write(
                worktree.join(format!("output_{index}.txt")),
                "phase one output\n",
            )
            .map_err(|e| e.to_string())
        }
    });

    let orch = orchestrator(&repo, dispatcher);
    let batch_id = ParallelOrchestrator::generate_batch_id();
    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &mixed_plan(), 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Complete);
    assert_eq!(status.plan_summary, "Mixed plan");

    let seen = core_seen.lock().unwrap();
    assert_eq!(seen.get(&1), Some(&true), "agent 1 did not see core.py");
    assert_eq!(seen.get(&2), Some(&true), "agent 2 did not see core.py");

    assert!(repo.path().join("core.py").exists());
    assert!(repo.path().join("output_1.txt").exists());
    assert!(repo.path().join("output_2.txt").exists());
}

// ---------------------------------------------------------------------------
// Scenario D: conflict isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conflicting_agents_first_wins_and_main_stays_consistent() {
    let repo = init_repo();
    let dispatcher = MockDispatcher::new(|worktree| {
        let index = worktree_index(worktree);
        std::fs::write(worktree.join("README.md"), format!("# Agent {index}\n"))
            .map_err(|e| e.to_string())
    });

    let two_agent_plan = plan(
        "Conflict plan",
        vec![phase(
            0,
            "Conflicting Work",
            true,
            vec![assignment(0, "A", &[0]), assignment(1, "B", &[1])],
        )],
    );

    let orch = orchestrator(&repo, dispatcher);
    let batch_id = ParallelOrchestrator::generate_batch_id();
    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &two_agent_plan, 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Failed);
    assert!(status.error.unwrap().contains("conflict"));

    assert_eq!(status.merge_results.len(), 2);
    let first = &status.merge_results[0];
    assert!(first.success);
    assert_eq!(first.resolution_method, ResolutionMethod::Clean);

    let second = &status.merge_results[1];
    assert!(!second.success);
    assert_eq!(second.resolution_method, ResolutionMethod::Conflict);
    assert_eq!(second.conflict_files, vec!["README.md"]);

    // merge --abort left main exactly at the first agent's state.
    let readme = std::fs::read_to_string(repo.path().join("README.md")).unwrap();
    assert_eq!(readme, "# Agent 0\n");
    let wm = WorktreeManager::new(repo.path()).unwrap();
    assert!(wm.is_working_tree_clean());
}

// ---------------------------------------------------------------------------
// Scenario E: cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_batch_skips_verification_and_finalize() {
    let repo = init_repo();
    let orch = orchestrator(&repo, Arc::new(CancellingDispatcher));
    let batch_id = ParallelOrchestrator::generate_batch_id();

    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &parallel_plan(), 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Cancelled);
    assert!(status.verification.is_none());
    assert!(status.finalize_message.is_none());
    assert!(status
        .agents
        .iter()
        .all(|slot| slot.status == SlotStatus::Cancelled));
    assert!(!repo.path().join(WORKTREE_DIR_NAME).exists());
    assert!(status.finished_at.is_some());
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_failure_fails_the_batch_but_cleanup_still_runs() {
    let repo = init_repo();
    let dispatcher = MockDispatcher::new(|_| Err("agent crashed".to_string()));
    let orch = orchestrator(&repo, dispatcher);
    let batch_id = ParallelOrchestrator::generate_batch_id();

    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &sequential_plan(), 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Failed);
    assert!(status.error.unwrap().contains("agents failed"));
    assert!(status
        .agents
        .iter()
        .all(|slot| slot.status == SlotStatus::Failed));
    assert_eq!(
        status.agents[0].error.as_deref(),
        Some("agent crashed")
    );
    assert!(status.finished_at.is_some());
    assert!(!repo.path().join(WORKTREE_DIR_NAME).exists());
}

#[tokio::test]
async fn one_failed_agent_does_not_abort_the_others() {
    let repo = init_repo();
    let dispatcher = MockDispatcher::new(|worktree| {
        let index = worktree_index(worktree);
        if index == 1 {
            return Err("agent 1 crashed".to_string());
        }
        std::fs::write(
            worktree.join(format!("agent_output_{index}.txt")),
            "output\n",
        )
        .map_err(|e| e.to_string())
    });
    let orch = orchestrator(&repo, dispatcher);
    let batch_id = ParallelOrchestrator::generate_batch_id();

    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &parallel_plan(), 3)
        .await;

    assert_eq!(status.phase, BatchPhase::Failed);
    // The surviving agents' work still merged.
    assert!(repo.path().join("agent_output_0.txt").exists());
    assert!(repo.path().join("agent_output_2.txt").exists());

    let statuses: HashMap<usize, SlotStatus> = status
        .agents
        .iter()
        .map(|slot| (slot.task_index, slot.status))
        .collect();
    assert_eq!(statuses[&0], SlotStatus::Succeeded);
    assert_eq!(statuses[&1], SlotStatus::Failed);
    assert_eq!(statuses[&2], SlotStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// Verification and roadmap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verification_runs_and_is_recorded() {
    let repo = init_repo();
    let dispatcher = MockDispatcher::writing_files();
    let orch = orchestrator(&repo, Arc::clone(&dispatcher) as Arc<dyn CliDispatcher>);
    let batch_id = ParallelOrchestrator::generate_batch_id();

    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &parallel_plan(), 3)
        .await;

    assert_eq!(dispatcher.verification_count(), 1);
    let verification = status.verification.unwrap();
    assert!(verification.overall_pass);
    assert_eq!(verification.summary, "All criteria passed");
}

#[tokio::test]
async fn failed_verification_is_informational_and_roadmap_still_marked() {
    let repo = init_repo();
    let planning_dir = repo.path().join(".claude/planning");
    std::fs::create_dir_all(&planning_dir).unwrap();
    let roadmap = planning_dir.join("ROADMAP.md");
    std::fs::write(
        &roadmap,
        "# Roadmap\n\n## Milestone 1: Test\n\
         - [ ] Add utility functions to src/core/utils.py\n\
         - [ ] Create tests/test_helpers.py\n\
         - [ ] Update src/components/Header.tsx\n",
    )
    .unwrap();
    git(repo.path(), &["add", "."]);
    git(repo.path(), &["commit", "-m", "Add roadmap"]);

    let dispatcher = MockDispatcher::with_verification(
        |worktree| {
            let index = worktree_index(worktree);
            std::fs::write(worktree.join(format!("out_{index}.txt")), "x")
                .map_err(|e| e.to_string())
        },
        VERIFY_FAIL,
    );
    let orch = orchestrator(&repo, dispatcher);
    let batch_id = ParallelOrchestrator::generate_batch_id();

    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &sequential_plan(), 3)
        .await;

    // Verification failure never blocks completion.
    assert_eq!(status.phase, BatchPhase::Complete);
    assert!(!status.verification.unwrap().overall_pass);

    let finalize = status.finalize_message.unwrap().to_lowercase();
    assert!(finalize.contains("marked 3 item(s) complete"));
    assert!(finalize.contains("verification noted"));

    let content = std::fs::read_to_string(&roadmap).unwrap();
    assert!(content.contains("- [x] Add utility functions"));
    assert!(content.contains("- [x] Create tests/test_helpers.py"));
    assert!(content.contains("- [x] Update src/components/Header.tsx"));
}

// ---------------------------------------------------------------------------
// Status and cancel surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_batch_has_no_status_and_cannot_cancel() {
    let repo = init_repo();
    let orch = orchestrator(&repo, MockDispatcher::writing_files());
    assert!(orch.get_status("par-nonexistent").is_none());
    assert!(!orch.cancel_batch("par-nonexistent"));
}

#[tokio::test]
async fn status_is_queryable_after_completion() {
    let repo = init_repo();
    let orch = orchestrator(&repo, MockDispatcher::writing_files());
    let batch_id = ParallelOrchestrator::generate_batch_id();

    orch.execute_plan(&batch_id, &sample_tasks(), &sequential_plan(), 3)
        .await;

    let status = orch.get_status(&batch_id).unwrap();
    assert_eq!(status.batch_id, batch_id);
    assert_eq!(status.phase, BatchPhase::Complete);
    assert_eq!(status.plan_summary, "Sequential plan");
}

#[tokio::test]
async fn commit_before_remove_leaves_no_dirty_worktree() {
    // Instrumented variant of the lost-work rule: the dispatcher checks
    // that no *previous* worktree left uncommitted changes behind.
    let repo = init_repo();
    let dirty_seen = Arc::new(Mutex::new(false));
    let dirty_flag = Arc::clone(&dirty_seen);

    let dispatcher = MockDispatcher::new(move |worktree| {
        let root = worktree.parent().unwrap();
        if let Ok(entries) = std::fs::read_dir(root) {
            for entry in entries.flatten() {
                if entry.path() == worktree {
                    continue;
                }
                let status = Command::new("git")
                    .args(["status", "--porcelain"])
                    .current_dir(entry.path())
                    .output();
                if let Ok(out) = status {
                    if !String::from_utf8_lossy(&out.stdout).trim().is_empty() {
                        *dirty_flag.lock().unwrap() = true;
                    }
                }
            }
        }
        let index = worktree_index(worktree);
        std::fs::write(worktree.join(format!("f{index}.txt")), "x").map_err(|e| e.to_string())
    });

    let orch = orchestrator(&repo, dispatcher);
    let batch_id = ParallelOrchestrator::generate_batch_id();
    // max_parallel = 1 serializes the agents, so each one observes the
    // worktrees its predecessors left behind.
    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &parallel_plan(), 1)
        .await;

    assert_eq!(status.phase, BatchPhase::Complete);
    assert!(!*dirty_seen.lock().unwrap(), "a worktree was left dirty");
}

#[tokio::test]
async fn agent_slot_output_files_are_recorded() {
    let repo = init_repo();
    let orch = orchestrator(&repo, MockDispatcher::writing_files());
    let batch_id = ParallelOrchestrator::generate_batch_id();

    let status = orch
        .execute_plan(&batch_id, &sample_tasks(), &parallel_plan(), 3)
        .await;

    for slot in &status.agents {
        assert!(slot.output_file.is_some(), "slot missing output file");
        assert!(slot.started_at.is_some());
        assert!(slot.finished_at.is_some());
        assert!(slot.branch.as_deref().unwrap().starts_with("parallel/"));
    }
}
