use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::{Tool, ToolContext, ToolResult};

const SKIP_DIRS: &[&str] = &["node_modules", ".git", "target", "vendor", "dist", "build", ".build"];
const MAX_FILES_SCANNED: usize = 2000;
const MAX_MATCHES: usize = 50;

/// `codebase_search` (§6): "keyword search within project". The teacher's
/// TF-IDF/embeddings index (`index.rs`, dropped — see DESIGN.md) solves a
/// fuzzy-relevance problem this tool doesn't need to; a bounded
/// directory-walk substring scan satisfies the one-line contract.
pub struct CodebaseSearchTool;

#[async_trait]
impl Tool for CodebaseSearchTool {
    fn name(&self) -> &str {
        "codebase_search"
    }

    fn description(&self) -> &str {
        "Search the project for lines containing a keyword or phrase. \
         Returns matching file paths with line numbers, bounded to the \
         first matches found."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Keyword or phrase to search for"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: query"))?;

        let matches = search(&ctx.project_root, query);
        let truncated = matches.len() >= MAX_MATCHES;
        let output = if matches.is_empty() {
            format!("No matches for \"{query}\" in {}", ctx.project_root.display())
        } else {
            let mut out = matches.join("\n");
            if truncated {
                out.push_str("\n... (truncated)");
            }
            out
        };

        Ok(ToolResult {
            output,
            title: format!("codebase_search: {query}"),
            metadata: json!({ "match_count": matches.len(), "truncated": truncated }),
        })
    }
}

fn search(project: &Path, query: &str) -> Vec<String> {
    let needle = query.to_lowercase();
    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = vec![project.to_path_buf()];
    let mut scanned = 0usize;

    while let Some(path) = stack.pop() {
        if out.len() >= MAX_MATCHES || scanned >= MAX_FILES_SCANNED {
            break;
        }
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if SKIP_DIRS.contains(&name) {
                    continue;
                }
            }
            let Ok(rd) = std::fs::read_dir(&path) else { continue };
            stack.extend(rd.filter_map(|e| e.ok().map(|e| e.path())));
            continue;
        }

        scanned += 1;
        let Ok(content) = std::fs::read_to_string(&path) else { continue };
        let rel = path.strip_prefix(project).unwrap_or(&path);
        for (i, line) in content.lines().enumerate() {
            if line.to_lowercase().contains(&needle) {
                out.push(format!("{}:{}: {}", rel.display(), i + 1, line.trim()));
                if out.len() >= MAX_MATCHES {
                    break;
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_matching_lines_and_skips_noise_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn compute_total() {}\n").unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules/b.rs"), "fn compute_total() {}\n").unwrap();

        let results = search(dir.path(), "compute_total");
        assert_eq!(results.len(), 1);
        assert!(results[0].starts_with("a.rs:1:"));
    }
}
