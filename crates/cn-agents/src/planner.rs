//! The planning/verification agent and its background plan jobs.
//!
//! Planning is one dispatch whose stdout must contain a JSON plan;
//! verification is a second dispatch over the executed roster. Both go
//! through the [`CliDispatcher`] seam, so tests swap in mocks and the
//! production path runs the real supervisor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info};

use cn_core::git::{GitRunner, SystemGitRunner, DEFAULT_GIT_TIMEOUT};
use cn_core::runtime::dispatch_output_path;
use cn_dispatch::job_store::{DispatchJob, JobPatch, JobPhase, JobStatus, JobStore, StoreKind};
use cn_dispatch::redact::prompt_preview;
use cn_dispatch::supervisor::{CliDispatcher, DispatchRequest};

use crate::plan::{
    extract_json, parse_plan, parse_plan_output, parse_verification_output, ExecutionPlan,
    TaskItem, VerificationResult,
};
use crate::prompts::{
    planning_prompt, replanning_prompt, verification_prompt, AgentGroup, ProjectContext,
    RosterEntry,
};
use crate::roadmap::ROADMAP_RELATIVE_PATH;

/// Planning and verification dispatches get ten minutes each.
const PLAN_DISPATCH_TIMEOUT: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// PlanningAgent
// ---------------------------------------------------------------------------

/// AI-driven execution planner that leverages full project context.
pub struct PlanningAgent {
    project_path: PathBuf,
    dispatcher: Arc<dyn CliDispatcher>,
    git: Box<dyn GitRunner>,
}

impl PlanningAgent {
    pub fn new(project_path: impl Into<PathBuf>, dispatcher: Arc<dyn CliDispatcher>) -> Self {
        Self {
            project_path: project_path.into(),
            dispatcher,
            git: Box::new(SystemGitRunner),
        }
    }

    pub fn with_git_runner(
        project_path: impl Into<PathBuf>,
        dispatcher: Arc<dyn CliDispatcher>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            project_path: project_path.into(),
            dispatcher,
            git,
        }
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Dispatch the planning agent and parse its output into a plan.
    ///
    /// Pass `revision` to re-plan: the previous plan plus free-text user
    /// feedback. A plan with empty `phases` means planning failed; its
    /// summary and warnings say why.
    pub async fn create_plan(
        &self,
        tasks: &[TaskItem],
        milestone_title: &str,
        output_file: Option<PathBuf>,
        revision: Option<(&ExecutionPlan, &str)>,
    ) -> ExecutionPlan {
        let ctx = self.gather_context();
        let groups = self.agent_groups(milestone_title);
        let prompt = match revision {
            Some((previous, feedback)) => {
                let previous_json = serde_json::to_string_pretty(previous)
                    .unwrap_or_else(|_| "{}".to_string());
                replanning_prompt(&ctx, &previous_json, feedback, &groups)
            }
            None => planning_prompt(&ctx, tasks, milestone_title, &groups),
        };

        let mut request = DispatchRequest::new(prompt, &self.project_path)
            .with_total_timeout(PLAN_DISPATCH_TIMEOUT);
        if let Some(file) = output_file {
            request = request.with_output_file(file);
        }

        let result = self.dispatcher.dispatch(request).await;
        let raw = result.output.clone().unwrap_or_default();

        if !result.success {
            let reason = result
                .error
                .unwrap_or_else(|| "unknown dispatch error".to_string());
            error!(error = %reason, "planning agent dispatch failed");
            return ExecutionPlan::degenerate(format!("Planning failed: {reason}"), reason, &raw);
        }

        let plan = parse_plan_output(&raw);
        if !plan.phases.is_empty() {
            info!(
                phases = plan.phases.len(),
                agents = plan.estimated_total_agents,
                "plan parsed"
            );
            return plan;
        }

        // The model may have written the plan to a file despite the
        // stdout-only instruction; recover it and scrub the file.
        if let Some(value) = self.try_read_agent_file(&raw) {
            let recovered = parse_plan(&value, &raw);
            if !recovered.phases.is_empty() {
                info!("plan recovered from agent-written file");
                return recovered;
            }
        }

        plan
    }

    /// Dispatch the verification agent over the executed roster.
    /// Informational: the orchestrator records the result but never
    /// gates finalization on it.
    pub async fn verify_completion(
        &self,
        plan: &ExecutionPlan,
        roster: &[RosterEntry],
        gate_summary: Option<&str>,
        output_file: Option<PathBuf>,
    ) -> VerificationResult {
        let prompt = verification_prompt(&plan.success_criteria, gate_summary, roster);
        let mut request = DispatchRequest::new(prompt, &self.project_path)
            .with_total_timeout(PLAN_DISPATCH_TIMEOUT);
        if let Some(file) = output_file {
            request = request.with_output_file(file);
        }

        let result = self.dispatcher.dispatch(request).await;
        let raw = result.output.clone().unwrap_or_default();

        if !result.success {
            let reason = result
                .error
                .unwrap_or_else(|| "unknown dispatch error".to_string());
            return VerificationResult {
                overall_pass: false,
                criteria_results: Vec::new(),
                summary: format!("Verification agent failed: {reason}"),
                raw_output: raw,
            };
        }

        parse_verification_output(&raw)
    }

    // -----------------------------------------------------------------------
    // Context gathering
    // -----------------------------------------------------------------------

    fn gather_context(&self) -> ProjectContext {
        ProjectContext {
            conventions: std::fs::read_to_string(self.project_path.join("CLAUDE.md"))
                .unwrap_or_default(),
            roadmap_status: std::fs::read_to_string(
                self.project_path.join(ROADMAP_RELATIVE_PATH),
            )
            .unwrap_or_default(),
            file_tree: self.run_git(&["ls-files"]),
            recent_changes: self.run_git(&["log", "--name-only", "-5", "--oneline"]),
        }
    }

    fn run_git(&self, args: &[&str]) -> String {
        match self.git.run_git(&self.project_path, args, DEFAULT_GIT_TIMEOUT) {
            Ok(out) if out.success => out.stdout,
            _ => String::new(),
        }
    }

    /// Pre-declared agent groups from the milestone's roadmap section:
    /// `### <name> (tasks: 0, 2, 5)` sub-headings pin the grouping.
    fn agent_groups(&self, milestone_title: &str) -> Vec<AgentGroup> {
        if milestone_title.is_empty() {
            return Vec::new();
        }
        let Ok(content) =
            std::fs::read_to_string(self.project_path.join(ROADMAP_RELATIVE_PATH))
        else {
            return Vec::new();
        };

        let mut groups = Vec::new();
        let mut in_milestone = false;
        for line in content.lines() {
            if let Some(heading) = line.strip_prefix("## ") {
                in_milestone = heading.contains(milestone_title);
                continue;
            }
            if !in_milestone {
                continue;
            }
            if let Some(heading) = line.strip_prefix("### ") {
                if let Some((name, indices)) = parse_group_heading(heading) {
                    groups.push(AgentGroup {
                        name,
                        task_indices: indices,
                    });
                }
            }
        }
        groups
    }

    // -----------------------------------------------------------------------
    // File fallback
    // -----------------------------------------------------------------------

    /// If stdout references a `.json`/`.md` file inside the project (or
    /// an `EXECUTION-PLAN*` / `plan*.json` file exists at its root),
    /// read it, extract JSON, and delete the file.
    fn try_read_agent_file(&self, raw_output: &str) -> Option<Value> {
        let mut candidates: Vec<PathBuf> = raw_output
            .split_whitespace()
            .map(|token| token.trim_matches(['`', '"', '\'', '(', ')', ',', '.', ':']))
            .filter(|token| {
                token.starts_with('/')
                    && (token.ends_with(".json") || token.ends_with(".md"))
            })
            .map(PathBuf::from)
            .filter(|path| path.starts_with(&self.project_path))
            .collect();

        if let Ok(entries) = std::fs::read_dir(&self.project_path) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let planish = name.starts_with("EXECUTION-PLAN")
                    || (name.starts_with("plan") && name.ends_with(".json"));
                if planish {
                    candidates.push(entry.path());
                }
            }
        }

        for path in candidates {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(value) = extract_json(&content) {
                let _ = std::fs::remove_file(&path);
                debug!(path = %path.display(), "recovered plan JSON from file");
                return Some(value);
            }
        }
        None
    }
}

/// Parse `<name> (tasks: 0, 2, 5)` into a group. Any integers inside
/// the parentheses count; a heading without them is ordinary prose.
fn parse_group_heading(heading: &str) -> Option<(String, Vec<usize>)> {
    let open = heading.find('(')?;
    let close = heading[open..].find(')')? + open;
    let indices: Vec<usize> = heading[open + 1..close]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    if indices.is_empty() {
        return None;
    }
    Some((heading[..open].trim().to_string(), indices))
}

// ---------------------------------------------------------------------------
// PlanService; background plan jobs
// ---------------------------------------------------------------------------

/// Runs planning as background jobs in a non-evicting plan store, and
/// keeps the parsed internal plans (with `agent_prompt` fields intact)
/// alongside for the orchestrator to consume.
pub struct PlanService {
    agent: Arc<PlanningAgent>,
    store: Arc<JobStore>,
    plans: Mutex<HashMap<String, ExecutionPlan>>,
}

impl PlanService {
    pub fn new(agent: Arc<PlanningAgent>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            store: Arc::new(JobStore::new(StoreKind::Plan)),
            plans: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Start a planning job. Returns immediately with the job snapshot;
    /// poll the store (or [`PlanService::plan_for_job`]) for the result.
    pub fn start_plan(
        self: &Arc<Self>,
        tasks: Vec<TaskItem>,
        milestone_title: String,
    ) -> DispatchJob {
        self.start_inner(tasks, milestone_title, None)
    }

    /// Start a re-planning job from a previous plan plus user feedback.
    pub fn start_replan(
        self: &Arc<Self>,
        tasks: Vec<TaskItem>,
        milestone_title: String,
        previous: ExecutionPlan,
        feedback: String,
    ) -> DispatchJob {
        self.start_inner(tasks, milestone_title, Some((previous, feedback)))
    }

    fn start_inner(
        self: &Arc<Self>,
        tasks: Vec<TaskItem>,
        milestone_title: String,
        revision: Option<(ExecutionPlan, String)>,
    ) -> DispatchJob {
        let task_summary = tasks
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let log_file =
            dispatch_output_path(self.agent.project_path(), "dispatch", None).ok();
        let job = self.store.create(
            prompt_preview(&task_summary, 180),
            self.agent.project_path(),
            log_file.as_ref().map(|(_, path)| path.clone()),
        );

        let service = Arc::clone(self);
        let job_id = job.job_id.clone();
        let output_file = log_file.map(|(_, path)| path);
        tokio::spawn(async move {
            service.store.update(
                &job_id,
                JobPatch {
                    status: Some(JobStatus::Running),
                    phase: Some(JobPhase::Running),
                    message: Some("Planning agent is analyzing the tasks...".into()),
                    started_at: Some(chrono::Utc::now()),
                    ..JobPatch::default()
                },
            );

            let plan = service
                .agent
                .create_plan(
                    &tasks,
                    &milestone_title,
                    output_file,
                    revision
                        .as_ref()
                        .map(|(previous, feedback)| (previous, feedback.as_str())),
                )
                .await;

            if plan.phases.is_empty() {
                let reason = if plan.summary.is_empty() {
                    "Planning produced no phases".to_string()
                } else {
                    plan.summary.clone()
                };
                service.store.update(
                    &job_id,
                    JobPatch::finished(JobStatus::Failed, JobPhase::Failed, reason, None),
                );
            } else {
                service
                    .plans
                    .lock()
                    .expect("plan map lock")
                    .insert(job_id.clone(), plan);
                service.store.update(
                    &job_id,
                    JobPatch::finished(
                        JobStatus::Succeeded,
                        JobPhase::Complete,
                        "Planning complete.",
                        None,
                    ),
                );
            }
        });

        job
    }

    pub fn job(&self, job_id: &str) -> Option<DispatchJob> {
        self.store.get(job_id)
    }

    /// The internal plan for a finished job, `agent_prompt`s preserved
    /// verbatim.
    pub fn plan_for_job(&self, job_id: &str) -> Option<ExecutionPlan> {
        self.plans.lock().expect("plan map lock").get(job_id).cloned()
    }

    /// Fallback lookup when the caller only has a wire-level plan.
    pub fn find_plan_by_summary(&self, summary: &str) -> Option<ExecutionPlan> {
        self.plans
            .lock()
            .expect("plan map lock")
            .values()
            .find(|plan| plan.summary == summary)
            .cloned()
    }

    /// Cancel a running plan job.
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
            JobPatch::finished(
                JobStatus::Failed,
                JobPhase::Cancelled,
                "Cancelled by user",
                None,
            ),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cn_dispatch::provider::Provider;
    use cn_dispatch::result::DispatchResult;

    struct CannedDispatcher {
        output: String,
        succeed: bool,
    }

    #[async_trait]
    impl CliDispatcher for CannedDispatcher {
        async fn dispatch(&self, _request: DispatchRequest) -> DispatchResult {
            if self.succeed {
                DispatchResult::success("plan-session", Provider::Claude, None, None)
                    .with_output(Some(self.output.clone()))
            } else {
                DispatchResult::failure(
                    "plan-session",
                    Provider::Claude,
                    "Claude CLI timed out after 600s.",
                    cn_dispatch::result::ErrorCode::Timeout,
                )
            }
        }
    }

    const PLAN_OUTPUT: &str = r#"Analysis: one theme.
```json
{"summary": "One-phase plan",
 "phases": [{"phase_id": 0, "name": "All", "description": "", "parallel": false,
             "agents": [{"agent_id": 0, "theme": "All", "task_indices": [0],
                         "rationale": "", "agent_prompt": "Do the task"}]}],
 "success_criteria": ["It works"], "estimated_total_agents": 1, "warnings": []}
```"#;

    fn repo_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn agent_with(dir: &tempfile::TempDir, dispatcher: Arc<dyn CliDispatcher>) -> PlanningAgent {
        PlanningAgent::new(dir.path(), dispatcher)
    }

    #[tokio::test]
    async fn create_plan_parses_dispatcher_output() {
        let dir = repo_dir();
        let agent = agent_with(
            &dir,
            Arc::new(CannedDispatcher {
                output: PLAN_OUTPUT.into(),
                succeed: true,
            }),
        );
        let plan = agent
            .create_plan(&[TaskItem::new("task one")], "M1", None, None)
            .await;
        assert_eq!(plan.summary, "One-phase plan");
        assert_eq!(plan.phases.len(), 1);
        assert_eq!(plan.phases[0].agents[0].agent_prompt, "Do the task");
    }

    #[tokio::test]
    async fn failed_dispatch_yields_degenerate_plan() {
        let dir = repo_dir();
        let agent = agent_with(
            &dir,
            Arc::new(CannedDispatcher {
                output: String::new(),
                succeed: false,
            }),
        );
        let plan = agent
            .create_plan(&[TaskItem::new("task one")], "", None, None)
            .await;
        assert!(plan.phases.is_empty());
        assert!(plan.summary.contains("Planning failed"));
        assert!(plan.warnings[0].contains("timed out"));
    }

    #[tokio::test]
    async fn plan_recovered_from_agent_written_file() {
        let dir = repo_dir();
        let plan_file = dir.path().join("EXECUTION-PLAN.md");
        std::fs::write(&plan_file, PLAN_OUTPUT).unwrap();

        let agent = agent_with(
            &dir,
            Arc::new(CannedDispatcher {
                output: "I saved the plan to EXECUTION-PLAN.md instead.".into(),
                succeed: true,
            }),
        );
        let plan = agent
            .create_plan(&[TaskItem::new("task one")], "", None, None)
            .await;
        assert_eq!(plan.summary, "One-phase plan");
        // The recovered file was scrubbed.
        assert!(!plan_file.exists());
    }

    #[tokio::test]
    async fn verification_parses_output() {
        let dir = repo_dir();
        let output = r#"{"overall_pass": true, "criteria_results": [], "summary": "ok"}"#;
        let agent = agent_with(
            &dir,
            Arc::new(CannedDispatcher {
                output: output.into(),
                succeed: true,
            }),
        );
        let plan = ExecutionPlan::degenerate("s", "w", "");
        let vr = agent.verify_completion(&plan, &[], None, None).await;
        assert!(vr.overall_pass);
    }

    #[test]
    fn group_heading_parsing() {
        assert_eq!(
            parse_group_heading("Backend (tasks: 0, 2, 5)"),
            Some(("Backend".to_string(), vec![0, 2, 5]))
        );
        assert_eq!(
            parse_group_heading("UI polish (1)"),
            Some(("UI polish".to_string(), vec![1]))
        );
        assert_eq!(parse_group_heading("Notes for later"), None);
        assert_eq!(parse_group_heading("Caveats (none)"), None);
    }

    #[test]
    fn agent_groups_read_from_milestone_section() {
        let dir = repo_dir();
        let planning = dir.path().join(".claude/planning");
        std::fs::create_dir_all(&planning).unwrap();
        std::fs::write(
            planning.join("ROADMAP.md"),
            "# Roadmap\n\n## Milestone 1: Core\n### Backend (tasks: 0, 1)\n- [ ] a\n\
             ### Tests (tasks: 2)\n- [ ] b\n\n## Milestone 2: Later\n### Other (tasks: 3)\n",
        )
        .unwrap();

        let agent = agent_with(
            &dir,
            Arc::new(CannedDispatcher {
                output: String::new(),
                succeed: true,
            }),
        );
        let groups = agent.agent_groups("Milestone 1");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "Backend");
        assert_eq!(groups[0].task_indices, vec![0, 1]);
        assert_eq!(groups[1].task_indices, vec![2]);
    }

    #[tokio::test]
    async fn plan_service_runs_job_to_completion() {
        let dir = repo_dir();
        let agent = Arc::new(agent_with(
            &dir,
            Arc::new(CannedDispatcher {
                output: PLAN_OUTPUT.into(),
                succeed: true,
            }),
        ));
        let service = PlanService::new(agent);

        let job = service.start_plan(vec![TaskItem::new("task one")], "M1".into());
        assert!(job.job_id.starts_with("plan-"));

        // Poll until the background job settles.
        let mut done = false;
        for _ in 0..100 {
            if service.job(&job.job_id).is_some_and(|j| j.done) {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(done, "plan job never finished");

        let finished = service.job(&job.job_id).unwrap();
        assert_eq!(finished.status, JobStatus::Succeeded);
        let plan = service.plan_for_job(&job.job_id).unwrap();
        assert_eq!(plan.summary, "One-phase plan");
        assert!(service.find_plan_by_summary("One-phase plan").is_some());
    }

    #[tokio::test]
    async fn plan_service_cancel_unknown_job() {
        let dir = repo_dir();
        let agent = Arc::new(agent_with(
            &dir,
            Arc::new(CannedDispatcher {
                output: String::new(),
                succeed: true,
            }),
        ));
        let service = PlanService::new(agent);
        assert!(!service.cancel("plan-nope"));
    }
}
