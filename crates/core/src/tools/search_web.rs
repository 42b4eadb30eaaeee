use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::permission::ToolPermission;
use super::{Tool, ToolContext, ToolResult};

/// `search_web` (§6). The teacher's `tools/web.rs` wires a hosted search
/// endpoint that doesn't exist in this deployment (see DESIGN.md's Open
/// Questions). Rather than fabricate a third-party search API, this returns
/// a clear "not configured" result so the tool schema stays complete.
pub struct SearchWebTool;

#[async_trait]
impl Tool for SearchWebTool {
    fn name(&self) -> &str {
        "search_web"
    }

    fn description(&self) -> &str {
        "Search the public web for a query and return a summary of results."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    fn permission(&self) -> ToolPermission {
        ToolPermission::ReadOnly
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: query"))?;

        Ok(ToolResult {
            output: "Web search is not configured in this deployment.".to_string(),
            title: format!("search_web: {query}"),
            metadata: json!({ "available": false }),
        })
    }
}
