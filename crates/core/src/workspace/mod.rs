//! Workspace detection: project root, project type, git branch, and the
//! `.lingcode/` project directory (rules + project-local config overlay).
//! Grounded on the teacher's `workspace/mod.rs`, renamed from `.nyzhi` to
//! `.lingcode` per spec §6's filesystem conventions.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    pub project_root: PathBuf,
    pub project_type: Option<ProjectType>,
    pub git_branch: Option<String>,
    pub has_lingcode_config: bool,
    pub rules: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    Rust,
    Node,
    Python,
    Go,
    Unknown,
}

impl ProjectType {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectType::Rust => "rust",
            ProjectType::Node => "node",
            ProjectType::Python => "python",
            ProjectType::Go => "go",
            ProjectType::Unknown => "unknown",
        }
    }
}

pub fn detect_workspace(cwd: &Path) -> WorkspaceContext {
    let project_root = find_project_root(cwd);
    let project_type = detect_project_type(&project_root);
    let git_branch = detect_git_branch(&project_root);
    let has_lingcode_config = project_root.join(".lingcode").join("config.toml").exists();
    let rules = load_rules(&project_root);

    WorkspaceContext {
        project_root,
        project_type,
        git_branch,
        has_lingcode_config,
        rules,
    }
}

fn find_project_root(start: &Path) -> PathBuf {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".lingcode").is_dir() {
            return current;
        }
        if current.join(".git").exists() {
            return current;
        }
        if !current.pop() {
            return start.to_path_buf();
        }
    }
}

fn detect_project_type(root: &Path) -> Option<ProjectType> {
    if root.join("Cargo.toml").exists() {
        Some(ProjectType::Rust)
    } else if root.join("package.json").exists() {
        Some(ProjectType::Node)
    } else if root.join("pyproject.toml").exists()
        || root.join("setup.py").exists()
        || root.join("requirements.txt").exists()
    {
        Some(ProjectType::Python)
    } else if root.join("go.mod").exists() {
        Some(ProjectType::Go)
    } else {
        None
    }
}

fn detect_git_branch(root: &Path) -> Option<String> {
    let head_path = root.join(".git").join("HEAD");
    let content = std::fs::read_to_string(head_path).ok()?;
    let content = content.trim();
    if let Some(branch) = content.strip_prefix("ref: refs/heads/") {
        Some(branch.to_string())
    } else if content.len() >= 8 {
        Some(content[..8].to_string())
    } else {
        None
    }
}

/// Reads `AGENTS.md` or `.lingcode/rules.md`, the project instructions
/// folded into every prompt (§4.7 step 2).
pub fn load_rules(root: &Path) -> Option<String> {
    let candidates = [
        root.join("AGENTS.md"),
        root.join(".lingcode").join("rules.md"),
        root.join(".lingcode").join("instructions.md"),
    ];

    for path in &candidates {
        if let Ok(content) = std::fs::read_to_string(path) {
            if !content.trim().is_empty() {
                return Some(content);
            }
        }
    }
    None
}

/// Depth-2 project structure listing for prompt composition (§4.7 step 2),
/// excluding the directories the spec names.
pub fn project_structure(root: &Path) -> String {
    const SKIP: &[&str] = &["node_modules", ".git", "build", "dist", "vendor", ".build"];
    let mut out = String::new();
    list_depth(root, root, 0, 2, SKIP, &mut out);
    out
}

fn list_depth(
    root: &Path,
    dir: &Path,
    depth: usize,
    max_depth: usize,
    skip: &[&str],
    out: &mut String,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut names: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    names.sort_by_key(|e| e.file_name());

    for entry in names {
        let name = entry.file_name().to_string_lossy().to_string();
        if skip.contains(&name.as_str()) {
            continue;
        }
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).display();
        let indent = "  ".repeat(depth);
        if path.is_dir() {
            out.push_str(&format!("{indent}{rel}/\n"));
            if depth < max_depth {
                list_depth(root, &path, depth + 1, max_depth, skip, out);
            }
        } else {
            out.push_str(&format!("{indent}{rel}\n"));
        }
    }
}

/// Scaffolds `.lingcode/` in a fresh project: a commented config template,
/// a rules file, and an empty `memory.md` (§6 filesystem conventions).
pub fn scaffold_lingcode_dir(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let lingcode_dir = root.join(".lingcode");
    std::fs::create_dir_all(&lingcode_dir)?;

    let mut created = Vec::new();

    let config_path = lingcode_dir.join("config.toml");
    if !config_path.exists() {
        std::fs::write(
            &config_path,
            r#"# Project-level lingcode configuration
# These settings override your global ~/.config/lingcode/config.toml

# [provider]
# default = "anthropic"
#
# [provider.anthropic]
# model = "claude-sonnet-4-20250514"

# [agent]
# max_iterations = 20
# custom_instructions = "Always write tests for new functions."
"#,
        )?;
        created.push(config_path);
    }

    let rules_path = lingcode_dir.join("rules.md");
    if !rules_path.exists() {
        std::fs::write(
            &rules_path,
            r#"# Project Rules

These instructions are injected into every lingcode task in this project.

## Guidelines

- Describe your project's coding conventions here.
- Specify preferred patterns, testing requirements, or constraints.
- Example: "Use `anyhow::Result` for all error handling."
- Example: "Run `cargo test` before considering a task complete."
"#,
        )?;
        created.push(rules_path);
    }

    let memory_path = lingcode_dir.join("memory.md");
    if !memory_path.exists() {
        std::fs::write(&memory_path, "# Project memory\n\n")?;
        created.push(memory_path);
    }

    Ok(created)
}

/// Reads `<project>/.lingcode/memory.md` for prompt injection (§6
/// filesystem conventions). `None` if absent or empty.
pub fn read_project_memory(root: &Path) -> Option<String> {
    let path = root.join(".lingcode").join("memory.md");
    let content = std::fs::read_to_string(path).ok()?;
    if content.trim().is_empty() {
        None
    } else {
        Some(content)
    }
}

/// Appends short, deduplicated learnings to project memory on successful
/// task finalization (§6). Lines already present are skipped.
pub fn append_project_memory(root: &Path, learnings: &[String]) -> std::io::Result<()> {
    if learnings.is_empty() {
        return Ok(());
    }
    let lingcode_dir = root.join(".lingcode");
    std::fs::create_dir_all(&lingcode_dir)?;
    let path = lingcode_dir.join("memory.md");

    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    let mut new_lines = Vec::new();
    for learning in learnings {
        let line = format!("- {learning}");
        if !existing.contains(&line) {
            new_lines.push(line);
        }
    }
    if new_lines.is_empty() {
        return Ok(());
    }

    let mut content = existing;
    if content.trim().is_empty() {
        content = "# Project memory\n\n".to_string();
    }
    if !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&new_lines.join("\n"));
    content.push('\n');
    std::fs::write(&path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_rust_project_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(detect_project_type(dir.path()), Some(ProjectType::Rust));
    }

    #[test]
    fn unknown_project_type_when_no_manifest_present() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_project_type(dir.path()), None);
    }

    #[test]
    fn project_structure_skips_git_and_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("main.rs"), "").unwrap();
        let listing = project_structure(dir.path());
        assert!(listing.contains("main.rs"));
        assert!(!listing.contains(".git"));
        assert!(!listing.contains("node_modules"));
    }

    #[test]
    fn scaffold_creates_memory_and_rules_files() {
        let dir = tempfile::tempdir().unwrap();
        let created = scaffold_lingcode_dir(dir.path()).unwrap();
        assert!(dir.path().join(".lingcode/memory.md").exists());
        assert!(dir.path().join(".lingcode/rules.md").exists());
        assert_eq!(created.len(), 3);
    }

    #[test]
    fn appends_new_learnings_and_skips_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        append_project_memory(dir.path(), &["uses tokio for async".to_string()]).unwrap();
        append_project_memory(
            dir.path(),
            &[
                "uses tokio for async".to_string(),
                "prefers anyhow for errors".to_string(),
            ],
        )
        .unwrap();

        let memory = read_project_memory(dir.path()).unwrap();
        assert_eq!(memory.matches("uses tokio for async").count(), 1);
        assert!(memory.contains("prefers anyhow for errors"));
    }

    #[test]
    fn reads_none_when_memory_file_absent_or_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_project_memory(dir.path()).is_none());
    }
}
