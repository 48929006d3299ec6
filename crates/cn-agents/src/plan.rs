//! Execution-plan models and a total parser for free-form model output.
//!
//! Planning and verification agents are asked for fenced JSON, but what
//! actually arrives varies: prose around the block, no fences at all,
//! string ids like `"1A"`, missing fields. The parser never fails; it
//! produces either a usable plan or a degenerate one whose warnings
//! carry the reason.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Task input
// ---------------------------------------------------------------------------

/// One task handed to the planner / orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub text: String,
    /// Optional custom prompt; falls back to the task text.
    #[serde(default)]
    pub prompt: Option<String>,
}

impl TaskItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prompt: None,
        }
    }

    pub fn with_prompt(text: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prompt: Some(prompt.into()),
        }
    }

    pub fn effective_prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(&self.text)
    }
}

// ---------------------------------------------------------------------------
// Plan models
// ---------------------------------------------------------------------------

/// A themed batch of tasks assigned to a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub agent_id: u32,
    pub theme: String,
    pub task_indices: Vec<usize>,
    pub rationale: String,
    /// Detailed implementation prompt written by the planner.
    #[serde(default)]
    pub agent_prompt: String,
}

/// An ordered segment of the plan. Phases execute in ascending
/// `phase_id`; agents within a phase run in parallel when `parallel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPhase {
    pub phase_id: u32,
    pub name: String,
    pub description: String,
    pub parallel: bool,
    pub agents: Vec<AgentAssignment>,
}

/// Complete AI-generated execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub summary: String,
    pub phases: Vec<ExecutionPhase>,
    pub success_criteria: Vec<String>,
    pub estimated_total_agents: u32,
    pub warnings: Vec<String>,
    /// Full planner output, kept for display. Not serialized.
    #[serde(skip)]
    pub raw_output: String,
}

impl ExecutionPlan {
    /// A plan that carries only an error; `phases` is empty so callers
    /// treat it as failed planning.
    pub fn degenerate(summary: impl Into<String>, warning: impl Into<String>, raw: &str) -> Self {
        Self {
            summary: summary.into(),
            phases: Vec::new(),
            success_criteria: Vec::new(),
            estimated_total_agents: 0,
            warnings: vec![warning.into()],
            raw_output: raw.to_string(),
        }
    }
}

/// Result of checking a single success criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    pub evidence: String,
    pub notes: String,
}

/// Result of verifying plan completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub overall_pass: bool,
    pub criteria_results: Vec<CriterionResult>,
    pub summary: String,
    #[serde(skip)]
    pub raw_output: String,
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Extract the JSON object from mixed model output.
///
/// Fenced blocks win; otherwise the first balanced `{ ... }` in the
/// text, found by brace counting that respects string literals and
/// escapes.
pub fn extract_json(output: &str) -> Result<Value, String> {
    // Pass 1: fenced blocks.
    let mut rest = output;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        // Skip the optional language tag line.
        let body_start = after_fence.find('\n').map_or(after_fence.len(), |i| i + 1);
        let body = &after_fence[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        let candidate = body[..close].trim();
        if candidate.starts_with('{') {
            if let Some(object) = scan_object(candidate) {
                if let Ok(value) = serde_json::from_str(object) {
                    return Ok(value);
                }
            }
        }
        rest = &body[close + 3..];
    }

    // Pass 2: bare brace counting over the whole output.
    match scan_object(output) {
        Some(object) => {
            serde_json::from_str(object).map_err(|e| format!("invalid JSON object: {e}"))
        }
        None => Err("no JSON object found in output".to_string()),
    }
}

/// Find the first balanced top-level `{ ... }`, honouring string
/// literals and backslash escapes.
fn scan_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match byte {
            b'\\' => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Plan parsing
// ---------------------------------------------------------------------------

/// Coerce an id that may arrive as `2`, `"2"`, or `"1A"` to an integer,
/// falling back to the positional index.
fn coerce_id(raw: Option<&Value>, fallback: u32) -> u32 {
    match raw {
        Some(Value::Number(n)) => n.as_u64().map_or(fallback, |v| v as u32),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Build an [`ExecutionPlan`] from a parsed JSON value. Total: ids are
/// coerced, missing fields defaulted, and every repair leaves a warning.
pub fn parse_plan(value: &Value, raw_output: &str) -> ExecutionPlan {
    let mut warnings = string_array(value, "warnings");

    let mut phases = Vec::new();
    for (phase_pos, phase_value) in value
        .get("phases")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
    {
        let mut agents = Vec::new();
        for (agent_pos, agent_value) in phase_value
            .get("agents")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
        {
            let raw_id = agent_value.get("agent_id");
            let agent_id = coerce_id(raw_id, agent_pos as u32);
            if matches!(raw_id, Some(Value::String(_))) {
                warnings.push(format!(
                    "agent_id {:?} coerced to {agent_id}",
                    raw_id.and_then(Value::as_str).unwrap_or("?")
                ));
            }
            let agent_prompt = string_field(agent_value, "agent_prompt");
            if agent_prompt.is_empty() {
                warnings.push(format!("agent {agent_id} is missing agent_prompt"));
            }
            let task_indices = agent_value
                .get("task_indices")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| match v {
                            Value::Number(n) => n.as_u64().map(|x| x as usize),
                            Value::String(s) => s.trim().parse().ok(),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            agents.push(AgentAssignment {
                agent_id,
                theme: string_field(agent_value, "theme"),
                task_indices,
                rationale: string_field(agent_value, "rationale"),
                agent_prompt,
            });
        }

        phases.push(ExecutionPhase {
            phase_id: coerce_id(phase_value.get("phase_id"), phase_pos as u32),
            name: string_field(phase_value, "name"),
            description: string_field(phase_value, "description"),
            parallel: phase_value
                .get("parallel")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            agents,
        });
    }

    ExecutionPlan {
        summary: string_field(value, "summary"),
        phases,
        success_criteria: string_array(value, "success_criteria"),
        estimated_total_agents: value
            .get("estimated_total_agents")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        warnings,
        raw_output: raw_output.to_string(),
    }
}

/// Parse raw planner stdout into a plan. Never fails.
pub fn parse_plan_output(output: &str) -> ExecutionPlan {
    match extract_json(output) {
        Ok(value) => parse_plan(&value, output),
        Err(e) => ExecutionPlan::degenerate(
            format!("failed to parse plan: {e}"),
            format!("JSON parsing failed: {e}"),
            output,
        ),
    }
}

/// Parse raw verifier stdout. Never fails: unparseable output becomes a
/// non-passing result whose summary carries the reason.
pub fn parse_verification_output(output: &str) -> VerificationResult {
    match extract_json(output) {
        Ok(value) => VerificationResult {
            overall_pass: value
                .get("overall_pass")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            criteria_results: value
                .get("criteria_results")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .map(|cr| CriterionResult {
                    criterion: string_field(cr, "criterion"),
                    passed: cr.get("passed").and_then(Value::as_bool).unwrap_or(false),
                    evidence: string_field(cr, "evidence"),
                    notes: string_field(cr, "notes"),
                })
                .collect(),
            summary: string_field(&value, "summary"),
            raw_output: output.to_string(),
        },
        Err(e) => VerificationResult {
            overall_pass: false,
            criteria_results: Vec::new(),
            summary: format!("failed to parse verification output: {e}"),
            raw_output: output.to_string(),
        },
    }
}
