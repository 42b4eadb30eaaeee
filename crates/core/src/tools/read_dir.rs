use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;

use super::{Tool, ToolContext, ToolResult};

const MAX_RECURSIVE_DEPTH: usize = 4;
const SKIP_DIRS: &[&str] = &["node_modules", ".git", "target", "vendor", "dist", "build", ".build"];

pub struct ReadDirTool;

#[async_trait]
impl Tool for ReadDirTool {
    fn name(&self) -> &str {
        "read_directory"
    }

    fn description(&self) -> &str {
        "List directory entries with [FILE]/[DIR] prefixes. Set `recursive` \
         to walk subdirectories (bounded depth), skipping node_modules, .git, \
         target, vendor, dist, build."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "directory_path": {
                    "type": "string",
                    "description": "Path to the directory to list"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Walk subdirectories instead of a single level (default false)"
                }
            },
            "required": ["directory_path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let dir_path = args
            .get("directory_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: directory_path"))?;
        let recursive = args.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);

        let path = resolve_path(dir_path, &ctx.cwd);
        if !path.is_dir() {
            return Ok(ToolResult {
                output: format!("Not a directory: {}", path.display()),
                title: format!("read_directory: {dir_path}"),
                metadata: json!({ "error": "not_a_directory" }),
            });
        }

        let output = if recursive {
            let mut lines = Vec::new();
            walk(&path, "", 0, &mut lines).await?;
            if lines.is_empty() {
                format!("{} is empty", path.display())
            } else {
                lines.join("\n")
            }
        } else {
            list_one_level(&path).await?
        };

        Ok(ToolResult {
            output,
            title: format!("read_directory: {dir_path}"),
            metadata: json!({ "recursive": recursive }),
        })
    }
}

async fn list_one_level(path: &Path) -> Result<String> {
    let mut entries = Vec::new();
    let mut rd = tokio::fs::read_dir(path).await?;
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if SKIP_DIRS.contains(&name.as_str()) {
            continue;
        }
        let ft = entry.file_type().await?;
        if ft.is_dir() {
            entries.push(format!("[DIR]  {name}/"));
        } else {
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            entries.push(format!("[FILE] {name} ({size} bytes)"));
        }
    }
    entries.sort();
    if entries.is_empty() {
        Ok(format!("{} is empty", path.display()))
    } else {
        Ok(entries.join("\n"))
    }
}

fn walk<'a>(
    dir: &'a Path,
    prefix: &'a str,
    depth: usize,
    lines: &'a mut Vec<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + 'a>> {
    Box::pin(async move {
        if depth >= MAX_RECURSIVE_DEPTH {
            return Ok(());
        }
        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            let ft = entry.file_type().await?;
            entries.push((name, ft.is_dir(), entry.path()));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, is_dir, child) in entries {
            if is_dir {
                lines.push(format!("{prefix}{name}/"));
                walk(&child, &format!("{prefix}  "), depth + 1, lines).await?;
            } else {
                lines.push(format!("{prefix}{name}"));
            }
        }
        Ok(())
    })
}

fn resolve_path(raw: &str, cwd: &Path) -> std::path::PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_level_listing_skips_noise_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        let out = list_one_level(dir.path()).await.unwrap();
        assert!(out.contains("a.rs"));
        assert!(!out.contains("node_modules"));
    }
}
