//! The spec's 7-tool surface (§6) plus the registry/permission plumbing
//! the agent loop (C7) uses to advertise tool schemas to the model and to
//! execute read-only/terminal/search decisions. `write_file` and `done`
//! decisions are intercepted directly by the agent loop (whole-file writes
//! go through the Edit Engine; `done` drives the acceptance gate) rather
//! than dispatching through `ToolRegistry::execute`, but both still have a
//! `Tool` impl here so their schema is advertised consistently with the
//! other five.

pub mod bash;
pub mod codebase_search;
pub mod done;
pub mod permission;
pub mod read;
pub mod read_dir;
pub mod search_web;
pub mod write;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use permission::ToolPermission;
use serde_json::Value;

use crate::events::EventSender;
use crate::model::Decision;
use crate::support::change_tracker::ChangeTracker;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    fn permission(&self) -> ToolPermission {
        ToolPermission::ReadOnly
    }
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult>;
}

#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub cwd: PathBuf,
    pub project_root: PathBuf,
    pub event_tx: Option<EventSender>,
    pub change_tracker: Arc<tokio::sync::Mutex<ChangeTracker>>,
}

pub struct ToolResult {
    pub output: String,
    pub title: String,
    pub metadata: Value,
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Tool schemas advertised to the model (§6). `exclude` implements the
    /// loop detector's dynamic filtering (§4.4: read/search tools dropped
    /// past iteration 3 with no writes, everything but `write_file` dropped
    /// once a write is forced at iteration 8).
    pub fn definitions(&self, exclude: &[&str]) -> Vec<lingcode_provider::ToolDefinition> {
        let mut defs: Vec<_> = self
            .tools
            .values()
            .filter(|t| !exclude.contains(&t.name()))
            .map(|t| lingcode_provider::ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {name}"))?;
        tool.execute(args, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(bash::BashTool));
    registry.register(Box::new(read::ReadTool));
    registry.register(Box::new(write::WriteTool));
    registry.register(Box::new(read_dir::ReadDirTool));
    registry.register(Box::new(codebase_search::CodebaseSearchTool));
    registry.register(Box::new(search_web::SearchWebTool));
    registry.register(Box::new(done::DoneTool));
    registry
}

/// A decoded-but-not-yet-interpreted model tool invocation, as produced by
/// the decoder (C3).
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("missing required field `{field}` for tool `{tool}`")]
    MissingField { tool: String, field: String },
}

/// The "sum type with a single deterministic converter" from §9, replacing
/// dynamic keyword dispatch. Accepts the misnamed-key aliases §6 requires
/// (`path` for `file_path`, `path`/`folder` for `directory_path`).
pub fn decision_from_tool_call(call: &ToolCall) -> std::result::Result<Decision, ConvertError> {
    match call.name.as_str() {
        "run_terminal_command" => Ok(Decision::Terminal {
            command: string_field(call, &["command"])?,
        }),
        // `content` is optional here even though the schema marks it
        // required: a model that omits it anyway should still reach the
        // Edit Engine, which rejects it with `InvalidOperation` (§4.3 S4)
        // rather than this layer swallowing it as `MissingField`.
        "write_file" => Ok(Decision::WriteFile {
            path: string_field(call, &["file_path", "path"])?,
            content: call.input.get("content").and_then(|v| v.as_str()).map(str::to_string),
        }),
        "read_file" => Ok(Decision::ReadFile {
            path: string_field(call, &["file_path", "path"])?,
        }),
        "read_directory" => Ok(Decision::ReadDir {
            path: string_field(call, &["directory_path", "path", "folder"])?,
            recursive: call.input.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false),
        }),
        "codebase_search" => Ok(Decision::Search {
            query: string_field(call, &["query"])?,
            web: false,
        }),
        "search_web" => Ok(Decision::Search {
            query: string_field(call, &["query"])?,
            web: true,
        }),
        "done" => Ok(Decision::Done {
            summary: string_field(call, &["summary"]).unwrap_or_default(),
        }),
        other => Err(ConvertError::UnknownTool(other.to_string())),
    }
}

fn string_field(call: &ToolCall, keys: &[&str]) -> std::result::Result<String, ConvertError> {
    for key in keys {
        if let Some(v) = call.input.get(*key).and_then(|v| v.as_str()) {
            return Ok(v.to_string());
        }
    }
    Err(ConvertError::MissingField {
        tool: call.name.clone(),
        field: keys[0].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aliases_path_to_file_path_for_read() {
        let call = ToolCall {
            id: "1".into(),
            name: "read_file".into(),
            input: json!({ "path": "a.rs" }),
        };
        match decision_from_tool_call(&call).unwrap() {
            Decision::ReadFile { path } => assert_eq!(path, "a.rs"),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn aliases_folder_to_directory_path() {
        let call = ToolCall {
            id: "1".into(),
            name: "read_directory".into(),
            input: json!({ "folder": "src", "recursive": true }),
        };
        match decision_from_tool_call(&call).unwrap() {
            Decision::ReadDir { path, recursive } => {
                assert_eq!(path, "src");
                assert!(recursive);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn distinguishes_codebase_and_web_search() {
        let call = ToolCall {
            id: "1".into(),
            name: "search_web".into(),
            input: json!({ "query": "rust async" }),
        };
        match decision_from_tool_call(&call).unwrap() {
            Decision::Search { web, .. } => assert!(web),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn unknown_tool_name_errors() {
        let call = ToolCall {
            id: "1".into(),
            name: "delete_universe".into(),
            input: json!({}),
        };
        assert!(matches!(
            decision_from_tool_call(&call),
            Err(ConvertError::UnknownTool(_))
        ));
    }

    #[test]
    fn missing_required_field_errors() {
        let call = ToolCall {
            id: "1".into(),
            name: "read_file".into(),
            input: json!({}),
        };
        assert!(matches!(
            decision_from_tool_call(&call),
            Err(ConvertError::MissingField { .. })
        ));
    }

    #[test]
    fn write_file_without_content_yields_none_not_an_error() {
        let call = ToolCall {
            id: "1".into(),
            name: "write_file".into(),
            input: json!({ "file_path": "a.rs" }),
        };
        match decision_from_tool_call(&call).unwrap() {
            Decision::WriteFile { path, content } => {
                assert_eq!(path, "a.rs");
                assert_eq!(content, None);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }
}
