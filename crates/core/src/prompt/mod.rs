//! Builds the per-iteration system prompt from the task, bounded execution
//! history, workspace context, prior project memory, and the loop
//! detector's known-bad-action hints. A function of the agent loop's
//! per-iteration state rather than a fixed template string.

use crate::model::{Step, StepKind, StepStatus, Task};
use crate::workspace::WorkspaceContext;

/// Read-step output is far more likely to still be needed verbatim (file
/// contents) than other step kinds, so it gets a larger history cap.
const READ_STEP_OUTPUT_CAP: usize = 4000;
const OTHER_STEP_OUTPUT_CAP: usize = 800;
const MAX_HISTORY_STEPS: usize = 30;

pub struct PromptContext<'a> {
    pub task: &'a Task,
    pub workspace: &'a WorkspaceContext,
    pub history: &'a [Step],
    pub known_bad_actions: &'a [String],
    pub already_read_files: &'a [String],
    pub modification_required: bool,
    pub must_force_write: bool,
    pub done_rejected_once: bool,
    pub project_memory: Option<&'a str>,
}

/// The fixed system prelude, independent of task/iteration state.
fn system_preamble() -> &'static str {
    r#"You are an autonomous coding agent operating directly on a project's
files. Each turn you must invoke exactly one tool. Prefer minimal, correct
changes. Use the structured edit block format when editing an existing file
by anchor or line range; use write_file for whole-file creation/replacement.
Never fabricate file contents you have not read or written yourself."#
}

/// Builds the full per-iteration prompt.
pub fn build_prompt(ctx: &PromptContext) -> String {
    let mut sections = vec![system_preamble().to_string()];

    sections.push(format!("# Task\n{}", ctx.task.description));

    if let Some(root) = &ctx.task.project_root {
        sections.push(format!("# Project root\n{}", root.display()));
    }

    if let Some(project_type) = ctx.workspace.project_type {
        sections.push(format!("# Project type\n{}", project_type.name()));
    }

    if let Some(rules) = &ctx.workspace.rules {
        sections.push(format!("# Project rules\n{rules}"));
    }

    if let Some(memory) = ctx.project_memory {
        if !memory.trim().is_empty() {
            sections.push(format!("# Project memory\n{memory}"));
        }
    }

    let structure = crate::workspace::project_structure(&ctx.workspace.project_root);
    if !structure.is_empty() {
        sections.push(format!("# Project structure (depth 2)\n{structure}"));
    }

    sections.push(format!(
        "# Task intent\nmodification_required = {}",
        ctx.modification_required
    ));

    if !ctx.already_read_files.is_empty() {
        sections.push(format!(
            "# Already read this task (do not re-read)\n{}",
            ctx.already_read_files.join("\n")
        ));
    }

    if !ctx.known_bad_actions.is_empty() {
        sections.push(format!(
            "# Avoid repeating these actions\n{}",
            ctx.known_bad_actions.join("\n")
        ));
    }

    if ctx.must_force_write {
        sections.push(
            "# Escalation\nYou have spent too many iterations without writing a file. \
             You MUST call write_file this turn."
                .to_string(),
        );
    } else if ctx.done_rejected_once {
        sections.push(
            "# Escalation\nThis task requires modifications and no files have been \
             written yet. You MUST call write_file before calling done."
                .to_string(),
        );
    }

    if !ctx.history.is_empty() {
        sections.push(format!("# Execution history\n{}", render_history(ctx.history)));
    }

    sections.join("\n\n")
}

fn render_history(history: &[Step]) -> String {
    let start = history.len().saturating_sub(MAX_HISTORY_STEPS);
    history[start..]
        .iter()
        .map(render_step)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_step(step: &Step) -> String {
    let cap = match step.kind {
        StepKind::FileRead => READ_STEP_OUTPUT_CAP,
        _ => OTHER_STEP_OUTPUT_CAP,
    };
    let status = match step.status {
        StepStatus::Completed => "ok",
        StepStatus::Failed => "failed",
        StepStatus::Cancelled => "cancelled",
        StepStatus::Running => "running",
        StepStatus::Pending => "pending",
    };
    let mut output = step.output.clone();
    if output.len() > cap {
        output.truncate(cap);
        output.push_str("\n...(truncated)");
    }
    if let Some(err) = &step.error {
        format!("- [{status}] {:?} {}: {}\n{}", step.kind, step.description, err, output)
    } else {
        format!("- [{status}] {:?} {}\n{}", step.kind, step.description, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::ProjectType;
    use std::path::PathBuf;

    fn workspace(root: PathBuf) -> WorkspaceContext {
        WorkspaceContext {
            project_root: root,
            project_type: Some(ProjectType::Rust),
            git_branch: None,
            has_lingcode_config: false,
            rules: None,
        }
    }

    #[test]
    fn includes_modification_required_flag_and_task_description() {
        let task = Task::new("refactor the parser", None);
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path().to_path_buf());
        let ctx = PromptContext {
            task: &task,
            workspace: &ws,
            history: &[],
            known_bad_actions: &[],
            already_read_files: &[],
            modification_required: true,
            must_force_write: false,
            done_rejected_once: false,
            project_memory: None,
        };
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("refactor the parser"));
        assert!(prompt.contains("modification_required = true"));
    }

    #[test]
    fn force_write_escalation_appears_when_flagged() {
        let task = Task::new("fix bug", None);
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path().to_path_buf());
        let ctx = PromptContext {
            task: &task,
            workspace: &ws,
            history: &[],
            known_bad_actions: &[],
            already_read_files: &[],
            modification_required: true,
            must_force_write: true,
            done_rejected_once: false,
            project_memory: None,
        };
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("MUST call write_file this turn"));
    }

    #[test]
    fn read_step_output_gets_larger_truncation_cap() {
        let mut step = Step::new(StepKind::FileRead, "read a.rs".to_string());
        step.status = StepStatus::Completed;
        step.output = "x".repeat(5000);
        let rendered = render_step(&step);
        assert!(rendered.len() > OTHER_STEP_OUTPUT_CAP + 50);
    }
}
