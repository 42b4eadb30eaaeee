//! The UI-facing event bus. The core publishes events over a broadcast
//! channel; it never holds a back-pointer to a subscriber.

use lingcode_provider::Usage;

#[derive(Clone, Debug, Default)]
pub struct SessionUsage {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_cache_creation_tokens: u64,
    pub total_cost_usd: f64,
    pub turn_input_tokens: u32,
    pub turn_output_tokens: u32,
    pub turn_cache_read_tokens: u32,
    pub turn_cache_creation_tokens: u32,
    pub turn_cost_usd: f64,
}

impl SessionUsage {
    pub fn record_turn(&mut self, usage: &Usage, cost_usd: f64) {
        self.turn_input_tokens = usage.input_tokens;
        self.turn_output_tokens = usage.output_tokens;
        self.turn_cache_read_tokens = usage.cache_read_tokens;
        self.turn_cache_creation_tokens = usage.cache_creation_tokens;
        self.turn_cost_usd = cost_usd;

        self.total_input_tokens += usage.input_tokens as u64;
        self.total_output_tokens += usage.output_tokens as u64;
        self.total_cache_read_tokens += usage.cache_read_tokens as u64;
        self.total_cache_creation_tokens += usage.cache_creation_tokens as u64;
        self.total_cost_usd += cost_usd;
    }
}

/// Events emitted to the UI collaborator: step lifecycle, file changes,
/// approval requests, task completion, plus ambient streaming/telemetry
/// events (text deltas, retries, usage).
#[derive(Clone)]
pub enum AgentEvent {
    StepAdded {
        id: String,
        kind: crate::model::StepKind,
        description: String,
    },
    StepUpdated {
        id: String,
        status: crate::model::StepStatus,
        output: Option<String>,
    },
    StepRemoved {
        id: String,
    },
    TextDelta(String),
    ToolStarting {
        name: String,
    },
    ToolOutputDelta {
        tool_name: String,
        delta: String,
    },
    FileCreated {
        path: String,
        content: String,
    },
    FileUpdated {
        path: String,
        content: String,
        original: String,
    },
    ApprovalRequested {
        reason: String,
        respond: std::sync::Arc<tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<bool>>>>,
    },
    Retrying {
        attempt: u32,
        max_retries: u32,
        wait_ms: u64,
        reason: String,
    },
    Usage(SessionUsage),
    SystemMessage(String),
    TaskCompleted {
        summary: String,
    },
    Error(String),
}

impl std::fmt::Debug for AgentEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentEvent::StepAdded { id, kind, .. } => {
                f.debug_struct("StepAdded").field("id", id).field("kind", kind).finish()
            }
            AgentEvent::StepUpdated { id, status, .. } => f
                .debug_struct("StepUpdated")
                .field("id", id)
                .field("status", status)
                .finish(),
            AgentEvent::StepRemoved { id } => f.debug_struct("StepRemoved").field("id", id).finish(),
            AgentEvent::TextDelta(_) => write!(f, "TextDelta"),
            AgentEvent::ToolStarting { name } => {
                f.debug_struct("ToolStarting").field("name", name).finish()
            }
            AgentEvent::ToolOutputDelta { tool_name, .. } => {
                f.debug_struct("ToolOutputDelta").field("tool_name", tool_name).finish()
            }
            AgentEvent::FileCreated { path, .. } => {
                f.debug_struct("FileCreated").field("path", path).finish()
            }
            AgentEvent::FileUpdated { path, .. } => {
                f.debug_struct("FileUpdated").field("path", path).finish()
            }
            AgentEvent::ApprovalRequested { reason, .. } => f
                .debug_struct("ApprovalRequested")
                .field("reason", reason)
                .finish(),
            AgentEvent::Retrying { attempt, .. } => {
                f.debug_struct("Retrying").field("attempt", attempt).finish()
            }
            AgentEvent::Usage(_) => write!(f, "Usage"),
            AgentEvent::SystemMessage(m) => f.debug_struct("SystemMessage").field("msg", m).finish(),
            AgentEvent::TaskCompleted { summary } => f
                .debug_struct("TaskCompleted")
                .field("summary", summary)
                .finish(),
            AgentEvent::Error(e) => f.debug_struct("Error").field("msg", e).finish(),
        }
    }
}

pub type EventSender = tokio::sync::broadcast::Sender<AgentEvent>;
