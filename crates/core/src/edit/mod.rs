//! Edit Engine (C2, §4.2). Validates, anchors, and applies structured edits
//! to workspace files. Writes are atomic (write-temp, rename) per §5's
//! single-writer-per-path guarantee.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::events::{AgentEvent, EventSender};
use crate::model::{Anchor, AnchorKind, Edit, EditOperation, LineRange};
use crate::support::change_tracker::{ChangeTracker, FileChange};
use crate::support::diff::{truncate_diff, unified_diff};
use crate::symbol_index::SymbolIndex;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("anchor or range did not resolve to a valid position")]
    InvalidRange,
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("edit content exceeds {} lines", Edit::MAX_CONTENT_LINES)]
    TooLarge,
    #[error("path resolves outside the workspace: {0}")]
    OutsideWorkspace(String),
    #[error("edit overlaps another edit in the same batch")]
    OverlapsGenerated,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
}

pub struct EditEngine<'a> {
    pub symbol_index: &'a SymbolIndex,
}

impl<'a> EditEngine<'a> {
    pub fn new(symbol_index: &'a SymbolIndex) -> Self {
        Self { symbol_index }
    }

    /// Applies one edit to a file inside `workspace`. `change_tracker` and
    /// `events` receive the before/after record and `FileCreated`/
    /// `FileUpdated` notification respectively on success.
    pub async fn apply(
        &self,
        edit: &Edit,
        workspace: &Path,
        change_tracker: &tokio::sync::Mutex<ChangeTracker>,
        events: &EventSender,
    ) -> Result<ApplyOutcome, EditError> {
        if edit.content.len() > Edit::MAX_CONTENT_LINES {
            return Err(EditError::TooLarge);
        }

        let abs_path = resolve_in_workspace(workspace, &edit.file)?;

        let existed = abs_path.exists();
        let original = if existed {
            Some(
                tokio::fs::read_to_string(&abs_path)
                    .await
                    .map_err(|_| EditError::FileNotFound(edit.file.clone()))?,
            )
        } else {
            None
        };

        if edit.is_whole_file_replace() {
            let new_content = edit.content.join("\n");
            return self
                .write_result(&abs_path, &edit.file, original, new_content, change_tracker, events)
                .await;
        }

        let Some(existing) = original.clone() else {
            return Err(EditError::FileNotFound(edit.file.clone()));
        };
        let lines: Vec<&str> = existing.lines().collect();

        let range = self.resolve_range(edit, &lines)?;
        if !range.is_valid() {
            return Err(EditError::InvalidRange);
        }

        let new_content = match edit.operation {
            EditOperation::Insert => apply_insert(&lines, range.start, &edit.content),
            EditOperation::Replace => apply_replace(&lines, range, &edit.content),
            EditOperation::Delete => apply_replace(&lines, range, &[]),
        };

        self.write_result(&abs_path, &edit.file, original, new_content, change_tracker, events)
            .await
    }

    /// Entry point for the `write_file` tool decision (§4.3 S4), as opposed
    /// to a structured edit from `parse_edit_batch`. `content` absent means
    /// the model's tool call omitted the field entirely, which is a validation
    /// failure distinct from writing an empty file.
    pub async fn apply_write(
        &self,
        path: &str,
        content: Option<&str>,
        workspace: &Path,
        change_tracker: &tokio::sync::Mutex<ChangeTracker>,
        events: &EventSender,
    ) -> Result<ApplyOutcome, EditError> {
        let Some(content) = content else {
            return Err(EditError::InvalidOperation(format!(
                "write_file `{path}` missing required `content`"
            )));
        };

        let edit = Edit {
            file: path.to_string(),
            operation: EditOperation::Replace,
            range: None,
            anchor: None,
            content: content.lines().map(str::to_string).collect(),
        };
        self.apply(&edit, workspace, change_tracker, events).await
    }

    /// Applies a batch of edits in order. Edits in the same batch that touch
    /// the same file with overlapping ranges are rejected before any of
    /// them are applied (`OverlapsGenerated`).
    pub async fn apply_batch(
        &self,
        edits: &[Edit],
        workspace: &Path,
        change_tracker: &tokio::sync::Mutex<ChangeTracker>,
        events: &EventSender,
    ) -> Vec<Result<ApplyOutcome, EditError>> {
        if let Err(e) = check_batch_overlaps(edits) {
            return edits.iter().map(|_| Err(e.clone())).collect();
        }
        let mut results = Vec::with_capacity(edits.len());
        for edit in edits {
            results.push(self.apply(edit, workspace, change_tracker, events).await);
        }
        results
    }

    /// Anchor resolution priority (§4.2): (name,kind) lookup, then
    /// (parent,child_index) lookup, then explicit range, else InvalidRange.
    fn resolve_range(&self, edit: &Edit, lines: &[&str]) -> Result<LineRange, EditError> {
        let file_path = PathBuf::from(&edit.file);

        if let Some(anchor) = &edit.anchor {
            if let Some(range) = self.resolve_by_name_kind(&file_path, anchor) {
                return Ok(clamp_range(range, lines.len()));
            }
            if let Some(range) = self.resolve_by_parent_child(&file_path, anchor) {
                return Ok(clamp_range(range, lines.len()));
            }
        }

        if let Some(range) = edit.range {
            return Ok(clamp_range(range, lines.len()));
        }

        Err(EditError::InvalidRange)
    }

    fn resolve_by_name_kind(&self, file: &Path, anchor: &Anchor) -> Option<LineRange> {
        let symbols = self.symbol_index.symbols(file);
        symbols
            .iter()
            .find(|s| s.name == anchor.name && anchor_kind_matches(anchor.kind, s.kind))
            .map(|s| LineRange {
                start: s.start_line,
                end: s.end_line,
            })
    }

    fn resolve_by_parent_child(&self, file: &Path, anchor: &Anchor) -> Option<LineRange> {
        let parent = anchor.parent.as_ref()?;
        let child_index = anchor.child_index?;
        let symbols = self.symbol_index.symbols(file);
        symbols
            .iter()
            .filter(|s| s.parent.as_deref() == Some(parent.as_str()))
            .nth(child_index)
            .map(|s| LineRange {
                start: s.start_line,
                end: s.end_line,
            })
    }

    async fn write_result(
        &self,
        abs_path: &Path,
        rel_path: &str,
        original: Option<String>,
        new_content: String,
        change_tracker: &tokio::sync::Mutex<ChangeTracker>,
        events: &EventSender,
    ) -> Result<ApplyOutcome, EditError> {
        if let Some(existing) = &original {
            if existing.trim() == new_content.trim() {
                return Ok(ApplyOutcome::Unchanged);
            }
        }

        if let Some(parent) = abs_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        atomic_write(abs_path, &new_content)
            .await
            .map_err(|_| EditError::FileNotFound(rel_path.to_string()))?;

        self.symbol_index.invalidate(abs_path);

        {
            let mut tracker = change_tracker.lock().await;
            tracker.record(FileChange {
                path: abs_path.to_path_buf(),
                original: original.clone(),
                new_content: new_content.clone(),
                tool_name: "edit_engine".to_string(),
                timestamp: chrono::Utc::now(),
            });
        }

        let event = match &original {
            Some(old) => AgentEvent::FileUpdated {
                path: rel_path.to_string(),
                content: new_content,
                original: old.clone(),
            },
            None => AgentEvent::FileCreated {
                path: rel_path.to_string(),
                content: new_content,
            },
        };
        let _ = events.send(event);

        Ok(ApplyOutcome::Applied)
    }
}

fn anchor_kind_matches(anchor_kind: AnchorKind, symbol_kind: crate::model::SymbolKind) -> bool {
    use crate::model::SymbolKind as SK;
    matches!(
        (anchor_kind, symbol_kind),
        (AnchorKind::Function, SK::Function)
            | (AnchorKind::Class, SK::Class)
            | (AnchorKind::Method, SK::Method)
            | (AnchorKind::Struct, SK::Struct)
            | (AnchorKind::Enum, SK::Enum)
            | (AnchorKind::Protocol, SK::Protocol)
            | (AnchorKind::Property, SK::Property)
            | (AnchorKind::Variable, SK::Variable)
    )
}

fn clamp_range(range: LineRange, file_len: usize) -> LineRange {
    LineRange {
        start: range.start.max(1),
        end: range.end.min(file_len.max(range.start)),
    }
}

fn apply_insert(lines: &[&str], start: usize, content: &[String]) -> String {
    let idx = start.saturating_sub(1).min(lines.len());
    let mut out: Vec<String> = lines[..idx].iter().map(|s| s.to_string()).collect();
    out.extend(content.iter().cloned());
    out.extend(lines[idx..].iter().map(|s| s.to_string()));
    out.join("\n")
}

fn apply_replace(lines: &[&str], range: LineRange, content: &[String]) -> String {
    let start_idx = range.start.saturating_sub(1).min(lines.len());
    let end_idx = range.end.min(lines.len());
    let mut out: Vec<String> = lines[..start_idx].iter().map(|s| s.to_string()).collect();
    out.extend(content.iter().cloned());
    if end_idx < lines.len() {
        out.extend(lines[end_idx..].iter().map(|s| s.to_string()));
    }
    out.join("\n")
}

fn check_batch_overlaps(edits: &[Edit]) -> Result<(), EditError> {
    for i in 0..edits.len() {
        for j in (i + 1)..edits.len() {
            if edits[i].file != edits[j].file {
                continue;
            }
            let (Some(a), Some(b)) = (edits[i].range, edits[j].range) else {
                continue;
            };
            if a.start <= b.end && b.start <= a.end {
                return Err(EditError::OverlapsGenerated);
            }
        }
    }
    Ok(())
}

/// Canonicalizes `rel_path` against `workspace` and rejects any resolution
/// (including via symlink) that escapes it.
fn resolve_in_workspace(workspace: &Path, rel_path: &str) -> Result<PathBuf, EditError> {
    let candidate = if Path::new(rel_path).is_absolute() {
        PathBuf::from(rel_path)
    } else {
        workspace.join(rel_path)
    };

    let workspace_canon = workspace
        .canonicalize()
        .map_err(|_| EditError::OutsideWorkspace(rel_path.to_string()))?;

    // The file may not exist yet (create case): canonicalize the deepest
    // existing ancestor and rejoin the remainder.
    let mut existing_ancestor = candidate.clone();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    while !existing_ancestor.exists() {
        match existing_ancestor.file_name() {
            Some(name) => remainder.push(name.to_os_string()),
            None => break,
        }
        if !existing_ancestor.pop() {
            break;
        }
    }
    let mut resolved = existing_ancestor
        .canonicalize()
        .map_err(|_| EditError::OutsideWorkspace(rel_path.to_string()))?;
    for part in remainder.into_iter().rev() {
        resolved.push(part);
    }

    if !resolved.starts_with(&workspace_canon) {
        return Err(EditError::OutsideWorkspace(rel_path.to_string()));
    }

    Ok(resolved)
}

async fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("edit"),
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&tmp_path, content).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Builds a diff-friendly preview, used both for approval previews and for
/// populating event payloads beyond the raw before/after buffers.
pub fn preview_diff(path: &str, original: Option<&str>, new_content: &str) -> String {
    match original {
        Some(old) => truncate_diff(&unified_diff(path, old, new_content, 3), 50),
        None => new_content.lines().take(20).collect::<Vec<_>>().join("\n"),
    }
}

/// Structured edit block format (§6): extracts the first ```json fence in
/// model output and decodes it against the `{"edits": [...]}` schema.
pub fn parse_edit_batch(text: &str) -> Vec<Edit> {
    let Some(json_text) = extract_json_fence(text) else {
        return Vec::new();
    };
    #[derive(Deserialize)]
    struct RawAnchor {
        #[serde(rename = "type")]
        kind: String,
        name: String,
        parent: Option<String>,
        #[serde(rename = "childIndex")]
        child_index: Option<usize>,
    }
    #[derive(Deserialize)]
    struct RawRange {
        #[serde(rename = "startLine")]
        start_line: usize,
        #[serde(rename = "endLine")]
        end_line: usize,
    }
    #[derive(Deserialize)]
    struct RawEdit {
        file: String,
        operation: String,
        range: Option<RawRange>,
        anchor: Option<RawAnchor>,
        #[serde(default)]
        content: Vec<String>,
    }
    #[derive(Deserialize)]
    struct RawBatch {
        edits: Vec<RawEdit>,
    }

    let Ok(batch) = serde_json::from_str::<RawBatch>(&json_text) else {
        return Vec::new();
    };

    batch
        .edits
        .into_iter()
        .filter_map(|e| {
            let operation = match e.operation.as_str() {
                "insert" => EditOperation::Insert,
                "replace" => EditOperation::Replace,
                "delete" => EditOperation::Delete,
                _ => return None,
            };
            Some(Edit {
                file: e.file,
                operation,
                range: e.range.map(|r| LineRange {
                    start: r.start_line,
                    end: r.end_line,
                }),
                anchor: e.anchor.and_then(|a| {
                    Some(Anchor {
                        name: a.name,
                        kind: parse_anchor_kind(&a.kind)?,
                        parent: a.parent,
                        child_index: a.child_index,
                    })
                }),
                content: e.content,
            })
        })
        .collect()
}

fn parse_anchor_kind(raw: &str) -> Option<AnchorKind> {
    match raw {
        "function" => Some(AnchorKind::Function),
        "class" => Some(AnchorKind::Class),
        "method" => Some(AnchorKind::Method),
        "struct" => Some(AnchorKind::Struct),
        "enum" => Some(AnchorKind::Enum),
        "protocol" => Some(AnchorKind::Protocol),
        "property" => Some(AnchorKind::Property),
        "variable" => Some(AnchorKind::Variable),
        _ => None,
    }
}

fn extract_json_fence(text: &str) -> Option<String> {
    let start = text.find("```json")?;
    let after = &text[start + "```json".len()..];
    let end = after.find("```")?;
    Some(after[..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol_index::SymbolIndex;
    use tokio::sync::{broadcast, Mutex};

    fn harness() -> (SymbolIndex, Mutex<ChangeTracker>, broadcast::Sender<AgentEvent>) {
        let (tx, _rx) = broadcast::channel(16);
        (SymbolIndex::new(), Mutex::new(ChangeTracker::new()), tx)
    }

    #[tokio::test]
    async fn insert_on_empty_file_prepends() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, "").await.unwrap();

        let (index, tracker, events) = harness();
        let engine = EditEngine::new(&index);
        let edit = Edit {
            file: "a.txt".to_string(),
            operation: EditOperation::Insert,
            range: Some(LineRange { start: 1, end: 1 }),
            anchor: None,
            content: vec!["hello".to_string()],
        };
        let result = engine.apply(&edit, dir.path(), &tracker, &events).await;
        assert_eq!(result, Ok(ApplyOutcome::Applied));
        let content = tokio::fs::read_to_string(&file).await.unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn content_over_500_lines_is_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let (index, tracker, events) = harness();
        let engine = EditEngine::new(&index);
        let edit = Edit {
            file: "a.txt".to_string(),
            operation: EditOperation::Replace,
            range: None,
            anchor: None,
            content: (0..501).map(|i| i.to_string()).collect(),
        };
        let result = engine.apply(&edit, dir.path(), &tracker, &events).await;
        assert_eq!(result, Err(EditError::TooLarge));
    }

    #[tokio::test]
    async fn idempotent_apply_is_unchanged_on_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, "line one\nline two\n").await.unwrap();

        let (index, tracker, events) = harness();
        let engine = EditEngine::new(&index);
        let edit = Edit {
            file: "a.txt".to_string(),
            operation: EditOperation::Replace,
            range: Some(LineRange { start: 1, end: 2 }),
            anchor: None,
            content: vec!["line one".to_string(), "line two".to_string()],
        };
        let first = engine.apply(&edit, dir.path(), &tracker, &events).await;
        assert_eq!(first, Ok(ApplyOutcome::Applied));
        let second = engine.apply(&edit, dir.path(), &tracker, &events).await;
        assert_eq!(second, Ok(ApplyOutcome::Unchanged));
    }

    #[tokio::test]
    async fn missing_file_without_whole_file_replace_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (index, tracker, events) = harness();
        let engine = EditEngine::new(&index);
        let edit = Edit {
            file: "missing.txt".to_string(),
            operation: EditOperation::Insert,
            range: Some(LineRange { start: 1, end: 1 }),
            anchor: None,
            content: vec!["x".to_string()],
        };
        let result = engine.apply(&edit, dir.path(), &tracker, &events).await;
        assert_eq!(result, Err(EditError::FileNotFound("missing.txt".to_string())));
    }

    #[tokio::test]
    async fn write_file_without_content_is_invalid_operation() {
        let dir = tempfile::tempdir().unwrap();
        let (index, tracker, events) = harness();
        let engine = EditEngine::new(&index);
        let result = engine.apply_write("a.txt", None, dir.path(), &tracker, &events).await;
        assert_eq!(
            result,
            Err(EditError::InvalidOperation(
                "write_file `a.txt` missing required `content`".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn write_file_with_content_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let (index, tracker, events) = harness();
        let engine = EditEngine::new(&index);
        let result = engine
            .apply_write("a.txt", Some("hello"), dir.path(), &tracker, &events)
            .await;
        assert_eq!(result, Ok(ApplyOutcome::Applied));
        let content = tokio::fs::read_to_string(dir.path().join("a.txt")).await.unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn parse_edit_batch_round_trips_through_json_fence() {
        let text = r#"Here is the edit:
```json
{"edits":[{"file":"a.rs","operation":"replace","range":{"startLine":1,"endLine":2},"content":["fn x() {}"]}]}
```
"#;
        let edits = parse_edit_batch(text);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].file, "a.rs");
        assert_eq!(edits[0].operation, EditOperation::Replace);
    }

    #[test]
    fn batch_with_overlapping_ranges_on_same_file_is_rejected() {
        let edits = vec![
            Edit {
                file: "a.rs".into(),
                operation: EditOperation::Replace,
                range: Some(LineRange { start: 1, end: 5 }),
                anchor: None,
                content: vec![],
            },
            Edit {
                file: "a.rs".into(),
                operation: EditOperation::Replace,
                range: Some(LineRange { start: 3, end: 8 }),
                anchor: None,
                content: vec![],
            },
        ];
        assert_eq!(check_batch_overlaps(&edits), Err(EditError::OverlapsGenerated));
    }
}
