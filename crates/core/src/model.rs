//! Shared data model (§3): Task, Step, Decision, Edit, Anchor, Symbol,
//! ActionHash, ValidationResult. These types are produced and consumed
//! across every component (C1-C7) and carry no behavior of their own
//! beyond small, pure helpers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default `MaxIterations` (§3) when not overridden by configuration.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// A single agent invocation. Immutable for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub project_root: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>, project_root: Option<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            project_root,
            started_at: Utc::now(),
        }
    }

    /// Deterministic keyword-based task-intent classification (§4.7 step 3).
    pub fn requires_modification(&self) -> bool {
        const KEYWORDS: &[&str] = &[
            "upgrade", "modify", "improve", "update", "change", "refactor", "fix", "add",
            "implement",
        ];
        let lower = self.description.to_lowercase();
        KEYWORDS.iter().any(|kw| lower.contains(kw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    Thinking,
    Terminal,
    CodeWrite,
    FileRead,
    DirRead,
    Search,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One observable unit of agent activity (§3). Status moves monotonically
/// away from `Pending`; `Cancelled` is terminal.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    pub description: String,
    pub status: StepStatus,
    pub output: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub streaming_code: Option<String>,
    pub target_path: Option<String>,
}

impl Step {
    pub fn new(kind: StepKind, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            description: description.into(),
            status: StepStatus::Pending,
            output: String::new(),
            error: None,
            created_at: Utc::now(),
            streaming_code: None,
            target_path: None,
        }
    }

    /// Enforces the monotonic-status invariant; panics are never appropriate
    /// here since this is an internal bookkeeping helper called only by the
    /// loop itself, but callers should treat a no-op transition as a bug.
    pub fn transition(&mut self, status: StepStatus) {
        debug_assert!(
            self.status == StepStatus::Pending || self.status != StepStatus::Cancelled,
            "attempted to transition a Cancelled step"
        );
        self.status = status;
    }
}

/// An interpreted tool invocation (§3).
#[derive(Debug, Clone)]
pub enum Decision {
    Done { summary: String },
    Terminal { command: String },
    /// `content` is `None` when the model's tool call omitted the required
    /// field (§4.3 S4) — the Edit Engine rejects this with `InvalidOperation`
    /// rather than silently writing an empty file.
    WriteFile { path: String, content: Option<String> },
    ReadFile { path: String },
    ReadDir { path: String, recursive: bool },
    /// `web = false` is `codebase_search` (§6); `web = true` is `search_web`.
    Search { query: String, web: bool },
}

impl Decision {
    /// The filesystem path this decision targets, if any (used by both the
    /// loop detector's pending-verification set and the safety guard).
    pub fn target_path(&self) -> Option<&str> {
        match self {
            Decision::WriteFile { path, .. } | Decision::ReadFile { path } => Some(path),
            Decision::ReadDir { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOperation {
    Insert,
    Replace,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn is_valid(&self) -> bool {
        self.start >= 1 && self.start <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorKind {
    Function,
    Class,
    Method,
    Struct,
    Enum,
    Protocol,
    Property,
    Variable,
}

/// A symbolic reference resolved to a line range against the Symbol Index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub name: String,
    pub kind: AnchorKind,
    pub parent: Option<String>,
    pub child_index: Option<usize>,
}

/// A structured file mutation (§3, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edit {
    pub file: String,
    pub operation: EditOperation,
    pub range: Option<LineRange>,
    pub anchor: Option<Anchor>,
    pub content: Vec<String>,
}

impl Edit {
    pub const MAX_CONTENT_LINES: usize = 500;

    /// Whole-file replace: no range, no anchor, operation is Replace.
    pub fn is_whole_file_replace(&self) -> bool {
        self.operation == EditOperation::Replace && self.range.is_none() && self.anchor.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Method,
    Struct,
    Enum,
    Protocol,
    Property,
    Variable,
    Module,
}

/// `{name, kind, parent?, start_line, end_line, signature?}` per file (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub parent: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    Inheritance,
    Instantiation,
    MethodCall,
    TypeReference,
}

#[derive(Debug, Clone)]
pub struct Relationship {
    pub source_file: PathBuf,
    pub relationship_kind: RelationshipKind,
}

/// A string `"<action>:<command>:<path>:<normalized_code_hash>"` (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionHash(pub String);

impl std::fmt::Display for ActionHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Success,
    Warnings(Vec<String>),
    Errors(Vec<String>),
    Skipped,
}

impl ValidationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ValidationResult::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_intent_matches_spec_keywords() {
        let t = Task::new("refactor UserService", None);
        assert!(t.requires_modification());
        let t = Task::new("explain how auth works", None);
        assert!(!t.requires_modification());
    }

    #[test]
    fn whole_file_replace_has_no_range_or_anchor() {
        let edit = Edit {
            file: "a.rs".into(),
            operation: EditOperation::Replace,
            range: None,
            anchor: None,
            content: vec!["fn main() {}".into()],
        };
        assert!(edit.is_whole_file_replace());
    }
}
