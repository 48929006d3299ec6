//! Roadmap checkbox marking; the finalize step's collaborator.
//!
//! After a batch merges, tasks that executed successfully are reflected
//! back into the project's roadmap by flipping their `- [ ]` items to
//! `- [x]`. Matching is fuzzy: task text and item text rarely agree
//! byte-for-byte once a planner has rephrased things.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Relative path of the roadmap inside a project.
pub const ROADMAP_RELATIVE_PATH: &str = ".claude/planning/ROADMAP.md";

/// Seam between the orchestrator and roadmap bookkeeping.
pub trait RoadmapMarker: Send + Sync {
    /// Mark roadmap items matching the given task texts complete.
    /// Returns the number of items marked.
    fn mark_tasks_complete(&self, tasks: &[String]) -> usize;
}

/// Marker for embedders without a roadmap.
pub struct NoopRoadmapMarker;

impl RoadmapMarker for NoopRoadmapMarker {
    fn mark_tasks_complete(&self, _tasks: &[String]) -> usize {
        0
    }
}

/// File-backed marker over `.claude/planning/ROADMAP.md`.
pub struct FileRoadmapMarker {
    roadmap_path: PathBuf,
}

impl FileRoadmapMarker {
    pub fn new(project_path: &Path) -> Self {
        Self {
            roadmap_path: project_path.join(ROADMAP_RELATIVE_PATH),
        }
    }

    pub fn at(roadmap_path: impl Into<PathBuf>) -> Self {
        Self {
            roadmap_path: roadmap_path.into(),
        }
    }
}

impl RoadmapMarker for FileRoadmapMarker {
    fn mark_tasks_complete(&self, tasks: &[String]) -> usize {
        let Ok(content) = std::fs::read_to_string(&self.roadmap_path) else {
            debug!(path = %self.roadmap_path.display(), "no roadmap to mark");
            return 0;
        };

        let normalized_tasks: Vec<String> = tasks.iter().map(|t| normalize(t)).collect();
        let mut marked = 0usize;
        let mut out_lines = Vec::with_capacity(content.lines().count());

        for line in content.lines() {
            let Some(item) = pending_item_text(line) else {
                out_lines.push(line.to_string());
                continue;
            };
            let normalized_item = normalize(item);
            let matches = normalized_tasks
                .iter()
                .any(|task| fuzzy_match(&normalized_item, task));
            if matches {
                out_lines.push(line.replacen("- [ ]", "- [x]", 1));
                marked += 1;
            } else {
                out_lines.push(line.to_string());
            }
        }

        if marked > 0 {
            let mut updated = out_lines.join("\n");
            if content.ends_with('\n') {
                updated.push('\n');
            }
            if std::fs::write(&self.roadmap_path, updated).is_err() {
                return 0;
            }
            info!(marked, path = %self.roadmap_path.display(), "roadmap items marked complete");
        }
        marked
    }
}

/// The item text of a pending checkbox line, or `None`.
fn pending_item_text(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix("- [ ]").map(str::trim)
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Either side containing the other counts as a match; planners trim
/// and extend task phrasing in both directions.
fn fuzzy_match(item: &str, task: &str) -> bool {
    if item.is_empty() || task.is_empty() {
        return false;
    }
    item.contains(task) || task.contains(item)
}
