use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolResult};

/// `done` (§6). Execution never actually runs through the registry — the
/// agent loop intercepts `Decision::Done` directly so it can apply the
/// task-intent acceptance gate (§4.7 step 8). This impl exists only so the
/// schema is advertised alongside the other six tools.
pub struct DoneTool;

#[async_trait]
impl Tool for DoneTool {
    fn name(&self) -> &str {
        "done"
    }

    fn description(&self) -> &str {
        "Signal that the task is complete. Provide a short summary of what \
         was changed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "A short summary of the work performed"
                }
            },
            "required": ["summary"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let summary = args.get("summary").and_then(|v| v.as_str()).unwrap_or("");
        Ok(ToolResult {
            output: summary.to_string(),
            title: "done".to_string(),
            metadata: json!({}),
        })
    }
}
