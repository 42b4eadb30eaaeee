//! Runs a file's linter (and, where a whole-project build is cheap and a
//! manifest is present, the build) inside an isolated shadow copy of the
//! project so validation never mutates the real tree.
//!
//! Shares `tools/bash.rs`'s process-spawn/timeout/kill shape for running the
//! linter/build subprocess, and uses `tempfile` for the isolated shadow dir.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::model::ValidationResult;

const VALIDATION_TIMEOUT_SECS: u64 = 60;

/// Manifests to copy into the shadow for each extension the validator
/// understands, alongside the modified file itself.
fn manifests_for(ext: &str) -> &'static [&'static str] {
    match ext {
        "rs" => &["Cargo.toml", "Cargo.lock"],
        "js" | "ts" | "jsx" | "tsx" => &["package.json", "package-lock.json", "tsconfig.json"],
        "py" => &["pyproject.toml", "requirements.txt", "setup.py"],
        "go" => &["go.mod", "go.sum"],
        _ => &[],
    }
}

struct LintSpec {
    program: &'static str,
    args: &'static [&'static str],
}

fn lint_for(ext: &str) -> Option<LintSpec> {
    match ext {
        "rs" => Some(LintSpec { program: "cargo", args: &["clippy", "--message-format=short"] }),
        "js" | "ts" | "jsx" | "tsx" => Some(LintSpec { program: "npx", args: &["eslint", "."] }),
        "py" => Some(LintSpec { program: "ruff", args: &["check", "."] }),
        "go" => Some(LintSpec { program: "go", args: &["vet", "./..."] }),
        _ => None,
    }
}

struct BuildSpec {
    program: &'static str,
    args: &'static [&'static str],
}

fn build_for(ext: &str) -> Option<BuildSpec> {
    match ext {
        "rs" => Some(BuildSpec { program: "cargo", args: &["build", "--message-format=short"] }),
        "go" => Some(BuildSpec { program: "go", args: &["build", "./..."] }),
        "ts" | "tsx" => Some(BuildSpec { program: "npx", args: &["tsc", "--noEmit"] }),
        _ => None,
    }
}

/// Holds one reusable shadow directory per canonicalized project root,
/// created on first use and reused across runs.
#[derive(Default)]
pub struct Validator {
    shadows: Mutex<HashMap<PathBuf, TempDir>>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lints (and, if cheap, builds) `file` inside a shadow copy of `workspace`.
    pub async fn validate(&self, file: &Path, workspace: &Path) -> ValidationResult {
        let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("").to_string();
        let rel = match file.strip_prefix(workspace) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => return ValidationResult::Skipped,
        };

        match self.prepare_shadow(workspace, &rel, &ext).await {
            Ok(shadow_root) => self.run(&shadow_root, &rel, &ext).await,
            Err(_) => self.run_read_only(workspace, &rel, &ext).await,
        }
    }

    async fn prepare_shadow(
        &self,
        workspace: &Path,
        rel: &Path,
        ext: &str,
    ) -> std::io::Result<PathBuf> {
        let canonical = workspace.canonicalize().unwrap_or_else(|_| workspace.to_path_buf());
        let mut shadows = self.shadows.lock().await;

        if !shadows.contains_key(&canonical) {
            let dir = tempfile::Builder::new().prefix("lingcode-shadow-").tempdir()?;
            shadows.insert(canonical.clone(), dir);
        }
        let shadow_dir = shadows.get(&canonical).unwrap().path().to_path_buf();

        for manifest in manifests_for(ext) {
            let src = workspace.join(manifest);
            if src.exists() {
                let dst = shadow_dir.join(manifest);
                tokio::fs::copy(&src, &dst).await?;
            }
        }

        let src_file = workspace.join(rel);
        let dst_file = shadow_dir.join(rel);
        if let Some(parent) = dst_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src_file, &dst_file).await?;

        Ok(shadow_dir)
    }

    async fn run(&self, root: &Path, rel: &Path, ext: &str) -> ValidationResult {
        self.run_inner(root, rel, ext).await
    }

    /// Fallback used when shadow preparation fails: validate against
    /// the real workspace, never writing to it.
    async fn run_read_only(&self, workspace: &Path, rel: &Path, ext: &str) -> ValidationResult {
        self.run_inner(workspace, rel, ext).await
    }

    async fn run_inner(&self, root: &Path, rel: &Path, ext: &str) -> ValidationResult {
        let Some(lint) = lint_for(ext) else {
            return ValidationResult::Skipped;
        };

        let lint_messages = match run_command(root, lint.program, lint.args).await {
            Some(output) => output,
            None => return ValidationResult::Skipped,
        };

        let (errors, warnings) = partition_by_severity(&lint_messages);
        if !errors.is_empty() {
            return ValidationResult::Errors(errors);
        }
        if !warnings.is_empty() {
            return ValidationResult::Warnings(warnings);
        }

        if let Some(build) = build_for(ext) {
            if manifests_for(ext).iter().any(|m| root.join(m).exists()) {
                let exit_ok = run_command_status(root, build.program, build.args).await;
                return match exit_ok {
                    Some(true) => ValidationResult::Success,
                    Some(false) => {
                        ValidationResult::Errors(vec![format!("{} build failed", rel.display())])
                    }
                    None => ValidationResult::Success,
                };
            }
        }

        ValidationResult::Success
    }
}

/// Case-insensitive "error" keyword partition.
fn partition_by_severity(messages: &str) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for line in messages.lines().filter(|l| !l.trim().is_empty()) {
        if line.to_lowercase().contains("error") {
            errors.push(line.to_string());
        } else {
            warnings.push(line.to_string());
        }
    }
    (errors, warnings)
}

/// Spawns `program args` in `cwd`, returning combined stdout+stderr, or
/// `None` if the program isn't installed or the run times out.
async fn run_command(cwd: &Path, program: &str, args: &[&str]) -> Option<String> {
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let Ok(child) = child else { return None };
    let output = tokio::time::timeout(
        Duration::from_secs(VALIDATION_TIMEOUT_SECS),
        child.wait_with_output(),
    )
    .await
    .ok()?
    .ok()?;

    Some(format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    ))
}

async fn run_command_status(cwd: &Path, program: &str, args: &[&str]) -> Option<bool> {
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    let mut child = child.ok()?;
    let status = tokio::time::timeout(
        Duration::from_secs(VALIDATION_TIMEOUT_SECS),
        child.wait(),
    )
    .await
    .ok()?
    .ok()?;

    Some(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_error_and_warning_lines_case_insensitively() {
        let messages = "src/a.rs:1: ERROR: mismatched types\nsrc/a.rs:2: warning: unused variable\n";
        let (errors, warnings) = partition_by_severity(messages);
        assert_eq!(errors.len(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn unknown_extension_has_no_lint_spec() {
        assert!(lint_for("xyz").is_none());
    }

    #[tokio::test]
    async fn unrecognized_extension_skips_without_spawning_a_process() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "hello").unwrap();
        let validator = Validator::new();
        let result = validator.validate(&file, dir.path()).await;
        assert_eq!(result, ValidationResult::Skipped);
    }

    #[tokio::test]
    async fn shadow_is_created_once_and_reused_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname=\"x\"\n").unwrap();
        let file = dir.path().join("src/lib.rs");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "pub fn a() {}\n").unwrap();

        let validator = Validator::new();
        let rel = PathBuf::from("src/lib.rs");
        let shadow_a = validator.prepare_shadow(dir.path(), &rel, "rs").await.unwrap();
        let shadow_b = validator.prepare_shadow(dir.path(), &rel, "rs").await.unwrap();
        assert_eq!(shadow_a, shadow_b);
    }
}
