//! Prompt assembly for the planning and verification agents.
//!
//! The planner gets the richest context we can cheaply gather: project
//! conventions, roadmap status, a tracked-file listing, recent commits,
//! and the task list. Caps keep each section from flooding the prompt.

use crate::plan::TaskItem;

pub const CONVENTIONS_CAP: usize = 12_000;
pub const ROADMAP_CAP: usize = 2_000;
pub const FILE_TREE_CAP: usize = 8_000;
pub const RECENT_CHANGES_CAP: usize = 2_000;

/// Project context gathered for prompt assembly.
#[derive(Debug, Clone, Default)]
pub struct ProjectContext {
    pub conventions: String,
    pub roadmap_status: String,
    pub file_tree: String,
    pub recent_changes: String,
}

/// A pre-declared agent grouping from the roadmap. When present, the
/// planner must use these groupings verbatim.
#[derive(Debug, Clone)]
pub struct AgentGroup {
    pub name: String,
    pub task_indices: Vec<usize>,
}

/// One agent's outcome, fed to the verification prompt as ground truth.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub group_id: u32,
    pub phase_id: u32,
    pub status: String,
    pub error: Option<String>,
    pub task_text: String,
}

/// Truncate on a char boundary, appending a marker when cut.
pub fn truncate_section(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let cut: String = text.chars().take(cap).collect();
    format!("{cut}\n... (truncated)")
}

fn or_unavailable(text: &str) -> &str {
    if text.trim().is_empty() {
        "(not available)"
    } else {
        text
    }
}

fn format_tasks(tasks: &[TaskItem]) -> String {
    tasks
        .iter()
        .enumerate()
        .map(|(i, task)| {
            let custom = if task.prompt.as_deref().is_some_and(|p| p != task.text) {
                format!("\n     Custom prompt: {}", task.effective_prompt())
            } else {
                "\n     Custom prompt: None".to_string()
            };
            format!("{}. {}{custom}", i + 1, task.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_agent_groups(groups: &[AgentGroup]) -> String {
    let mut lines = vec![
        String::new(),
        "## Pre-defined Agent Groups (MUST follow)".to_string(),
        "The milestone author has pre-defined agent groupings. You MUST use these exact groupings."
            .to_string(),
        "Do NOT re-group or split tasks differently.".to_string(),
        String::new(),
    ];
    for (i, group) in groups.iter().enumerate() {
        let indices = group
            .task_indices
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!(
            "**Group {}: {}** — task_indices: [{indices}]",
            i + 1,
            group.name
        ));
    }
    lines.push(String::new());
    lines.push(
        "Determine the execution order (which groups can run in parallel vs sequential)"
            .to_string(),
    );
    lines.push(
        "and write a detailed agent_prompt for each group. Do NOT change the task-to-group assignments."
            .to_string(),
    );
    lines.join("\n")
}

/// The full planning prompt.
pub fn planning_prompt(
    ctx: &ProjectContext,
    tasks: &[TaskItem],
    milestone_title: &str,
    agent_groups: &[AgentGroup],
) -> String {
    let tasks_text = format_tasks(tasks);
    let (group_section, grouping_rule) = if agent_groups.is_empty() {
        (
            String::new(),
            "- Target 2-5 agents total, never one agent per task",
        )
    } else {
        (
            format_agent_groups(agent_groups),
            "- Use the pre-defined agent groups above — do NOT re-group or split tasks differently",
        )
    };

    format!(
        r#"You are an expert software architect planning the parallel execution of a milestone's tasks.
You have deep understanding of the project's architecture, conventions, and codebase.

## Project Conventions (from CLAUDE.md)
{conventions}

## Roadmap Context
{roadmap}

## Project File Structure
{file_tree}

## Recently Modified Files
{recent_changes}

## Milestone: {milestone_title}
## Tasks to Execute
{tasks_text}
{group_section}

## Your Job

IMPORTANT: First, write a brief analysis section describing:
- What themes/categories you see in the tasks
- Which tasks have dependencies on each other
- How you plan to group them into agents
- Any potential file conflicts between parallel agents

Then, output the execution plan as a JSON block.

Create an execution plan that:
1. Groups tasks by THEME (backend core, frontend UI, API/config, tests, etc.)
2. Determines execution ORDER — which tasks must complete before others can start
3. Assigns tasks to AGENTS — each agent gets a themed batch to run sequentially
4. Writes DETAILED IMPLEMENTATION PROMPTS for each agent — not just the raw task text, but rich prompts with:
   - Specific files to create/modify (based on the project structure above)
   - Code patterns to follow (from conventions)
   - What other agents are doing in parallel (so they don't conflict)
   - Clear completion criteria per task
5. Defines SUCCESS CRITERIA — concrete, verifiable checks for the milestone

After your analysis, output the plan as JSON:

```json
{{
  "summary": "Brief strategy description",
  "phases": [
    {{
      "phase_id": 0,
      "name": "Phase name",
      "description": "Why this phase exists",
      "parallel": true,
      "agents": [
        {{
          "agent_id": 0,
          "theme": "Agent theme name",
          "task_indices": [0, 2, 5],
          "rationale": "Why these tasks belong together",
          "agent_prompt": "DETAILED implementation prompt for this agent..."
        }}
      ]
    }}
  ],
  "success_criteria": [
    "All new modules have corresponding test files",
    "The project builds without errors"
  ],
  "estimated_total_agents": 3,
  "warnings": ["Any dependency risks or concerns"]
}}
```

CRITICAL OUTPUT RULES:
- You MUST output the JSON plan directly to stdout — do NOT write files to disk
- Do NOT create any .md, .json, or other files — your ONLY output is text to stdout
- The JSON block MUST appear in your stdout output wrapped in ```json ... ``` fences
- Even for large plans with many tasks, output everything to stdout
- All IDs (agent_id, phase_id) MUST be plain integers (0, 1, 2, ...) — NOT strings like "1A"

Planning rules:
{grouping_rule}
- Group by theme and semantic dependency, not just file names
- agent_prompt MUST be detailed enough for an agent to work independently
- Success criteria MUST be concrete (runnable commands, checkable file existence, etc.)
- If a task depends on another task's output, they must be in sequential phases
- task_indices are 0-based indices into the task list above

## Cross-file dependency rules (IMPORTANT)
When tasks create new files that must be registered/imported elsewhere, the agent_prompt MUST include
the registration step. Common patterns:
- A new route/handler module MUST also be wired into the router/server entry point
- A new UI component MUST also be added to the parent that renders it
- A new module MUST also be re-exported where the project's convention expects it
- A new test file should import from the module it tests
Do NOT assume a separate agent will wire things up — each agent must complete the full integration for its files."#,
        conventions = truncate_section(or_unavailable(&ctx.conventions), CONVENTIONS_CAP),
        roadmap = truncate_section(or_unavailable(&ctx.roadmap_status), ROADMAP_CAP),
        file_tree = truncate_section(or_unavailable(&ctx.file_tree), FILE_TREE_CAP),
        recent_changes =
            truncate_section(or_unavailable(&ctx.recent_changes), RECENT_CHANGES_CAP),
    )
}

/// Re-planning prompt: the previous plan plus user feedback.
pub fn replanning_prompt(
    ctx: &ProjectContext,
    previous_plan_json: &str,
    feedback: &str,
    agent_groups: &[AgentGroup],
) -> String {
    let group_section = if agent_groups.is_empty() {
        String::new()
    } else {
        format_agent_groups(agent_groups)
    };
    format!(
        r#"You are an expert software architect revising a parallel execution plan.

## Previous Plan
{previous_plan_json}

## User Feedback
{feedback}

## Project Context
{conventions}

## Project File Structure
{file_tree}
{group_section}

## Instructions
First, briefly describe what changes you're making to the plan based on the user's feedback.
Then output the revised JSON plan in the same format as the previous plan, wrapped in ```json ... ``` fences.
Keep the same level of detail in agent_prompt fields."#,
        conventions = truncate_section(or_unavailable(&ctx.conventions), 6_000),
        file_tree = truncate_section(or_unavailable(&ctx.file_tree), 4_000),
    )
}

fn format_roster(roster: &[RosterEntry]) -> String {
    if roster.is_empty() {
        return String::new();
    }
    let mut lines = Vec::new();
    let mut failed = 0usize;
    for entry in roster {
        let mut label = format!(
            "Agent {} (phase {}): {}",
            entry.group_id, entry.phase_id, entry.status
        );
        if let Some(error) = &entry.error {
            label.push_str(&format!(" — {error}"));
            failed += 1;
        }
        lines.push(format!("- {label} | task: {}", entry.task_text));
    }
    let succeeded = roster.iter().filter(|e| e.status == "succeeded").count();
    format!(
        "\n## Agent Execution Results (FACTUAL — use these for completion criteria)\n{}\n\n\
         Total agents: {}, succeeded: {succeeded}, failed: {failed}\n\n\
         IMPORTANT: For any criterion about 'all tasks completed without errors', \
         use the agent execution results above as the source of truth, NOT file existence.",
        lines.join("\n"),
        roster.len(),
    )
}

/// The verification prompt: success criteria, optional quality-gate
/// summary, and the factual agent roster.
pub fn verification_prompt(
    success_criteria: &[String],
    gate_summary: Option<&str>,
    roster: &[RosterEntry],
) -> String {
    let criteria_text = success_criteria
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {c}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    let gate_section = gate_summary
        .map(|summary| format!("\n## Quality Gate Results\n{summary}"))
        .unwrap_or_default();

    format!(
        r#"You are verifying whether a milestone's implementation meets its success criteria.

## Success Criteria
{criteria_text}
{gate_section}
{roster_section}

## Instructions
Check each criterion by examining the codebase. For each criterion:
1. Look for the expected files, code, or behavior
2. Determine if it passes or fails
3. Provide evidence (file paths, command output references, etc.)
4. For criteria about task completion or errors, cross-reference the Agent Execution Results above

Output ONLY valid JSON:
{{
  "overall_pass": true/false,
  "criteria_results": [
    {{
      "criterion": "The criterion text",
      "passed": true/false,
      "evidence": "What you found",
      "notes": "Any additional context"
    }}
  ],
  "summary": "Brief overall assessment"
}}"#,
        roster_section = format_roster(roster),
    )
}
