//! Drives a `Task` to completion: composes a prompt, streams a model turn
//! through the decoder, admits the resulting decision through the loop
//! detector and safety guard, executes it (routing writes through the Edit
//! Engine, everything else through the tool registry), validates and
//! enriches on error, and records the outcome before looping.
//!
//! One `run` per task; events publish over a broadcast channel rather than
//! being held as back-references. The loop moves through an implicit
//! Idle -> Planning -> AwaitingDecision -> [AwaitingApproval] -> Executing
//! cycle each iteration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use lingcode_config::Config;
use lingcode_provider::{ChatRequest, ContentPart, Message, MessageContent, Provider, ProviderError, Role};

use crate::conversation::Thread;
use crate::decoder::{DecodedEvent, Decoder, DecoderError, INITIAL_TIMEOUT_LARGE, INITIAL_TIMEOUT_SIMPLE};
use crate::edit::{EditEngine, EditError};
use crate::enricher::enrich;
use crate::events::{AgentEvent, EventSender, SessionUsage};
use crate::loop_detector::{LoopDetector, Verdict};
use crate::model::{Decision, Edit, Step, StepKind, StepStatus, Task, ValidationResult};
use crate::prompt::{build_prompt, PromptContext};
use crate::support::change_tracker::ChangeTracker;
use crate::symbol_index::SymbolIndex;
use crate::tools::permission::{
    check_auto_approve, check_deny, is_blocked_command, is_protected_write, needs_command_approval,
    ApprovalMemory, ToolPermission,
};
use crate::tools::{decision_from_tool_call, default_registry, ToolContext, ToolRegistry};
use crate::validator::Validator;
use crate::workspace::{self, WorkspaceContext};

/// Long-lived services the agent loop borrows rather than owns (§9: no
/// process-wide singletons reached into from the middle of a run).
pub struct Services {
    pub provider: Arc<dyn Provider>,
    pub symbol_index: SymbolIndex,
    pub tools: ToolRegistry,
    pub validator: Validator,
}

impl Services {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            symbol_index: SymbolIndex::new(),
            tools: default_registry(),
            validator: Validator::new(),
        }
    }
}

pub struct AgentConfig {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub max_iterations: u32,
    pub custom_instructions: Option<String>,
    pub trust: lingcode_config::TrustConfig,
    pub retry: lingcode_config::RetrySettings,
    pub safety: lingcode_config::SafetyConfig,
}

impl AgentConfig {
    pub fn from_config(config: &Config, model: String) -> Self {
        Self {
            model,
            max_tokens: config.agent.max_tokens,
            temperature: config.provider.anthropic.temperature,
            max_iterations: config.agent.max_iterations,
            custom_instructions: config.agent.custom_instructions.clone(),
            trust: config.agent.trust.clone(),
            retry: config.agent.retry.clone(),
            safety: config.agent.safety.clone(),
        }
    }
}

/// Why a run stopped producing iterations.
#[derive(Debug, Clone)]
pub enum StopReason {
    Done,
    DoneRejectedTwice,
    MaxIterations,
    Cancelled,
    StuckInLoop,
}

pub struct RunOutcome {
    pub summary: String,
    pub reason: StopReason,
    pub usage: SessionUsage,
}

/// Runs one task to completion. Returns once the model calls `done` and the
/// acceptance gate admits it, the run is cancelled, or `max_iterations` is
/// exhausted.
pub async fn run(
    task: Task,
    services: &Services,
    config: &AgentConfig,
    events: EventSender,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let project_root = task
        .project_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let workspace_ctx = workspace::detect_workspace(&project_root);
    let project_memory = workspace::read_project_memory(&workspace_ctx.project_root);
    let modification_required = task.requires_modification();

    let mut history: Vec<Step> = Vec::new();
    let mut loop_detector = LoopDetector::new();
    let change_tracker = Arc::new(Mutex::new(ChangeTracker::new()));
    let mut thread = Thread::new();
    let mut known_bad_actions: Vec<String> = Vec::new();
    let mut already_read_files: Vec<String> = Vec::new();
    let mut done_rejected_once = false;
    let session_usage = SessionUsage::default();
    let mut files_touched: Vec<String> = Vec::new();
    let mut consecutive_blocks: u32 = 0;
    let mut approval_memory = ApprovalMemory::default();

    thread.push_message(Message {
        role: Role::User,
        content: MessageContent::Text(task.description.clone()),
    });

    let tool_ctx = ToolContext {
        session_id: task.id.clone(),
        cwd: workspace_ctx.project_root.clone(),
        project_root: workspace_ctx.project_root.clone(),
        event_tx: Some(events.clone()),
        change_tracker: change_tracker.clone(),
    };

    let mut iteration: u32 = 0;
    let stop_reason = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        iteration += 1;
        if iteration > config.max_iterations {
            break StopReason::MaxIterations;
        }

        let must_force_write = loop_detector.must_force_write(iteration);
        let tool_filter = loop_detector.tool_filter(iteration, modification_required);

        let prompt_ctx = PromptContext {
            task: &task,
            workspace: &workspace_ctx,
            history: &history,
            known_bad_actions: &known_bad_actions,
            already_read_files: &already_read_files,
            modification_required,
            must_force_write,
            done_rejected_once,
            project_memory: project_memory.as_deref(),
        };
        let mut system_prompt = build_prompt(&prompt_ctx);
        if let Some(custom) = &config.custom_instructions {
            system_prompt.push_str("\n\n# Custom instructions\n");
            system_prompt.push_str(custom);
        }

        let thinking_id = new_step(&mut history, &events, StepKind::Thinking, "thinking".to_string());

        let request = ChatRequest {
            model: config.model.clone(),
            messages: thread.messages().to_vec(),
            tools: services.tools.definitions(&tool_filter),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system: Some(system_prompt.clone()),
            stream: true,
        };

        let decoded = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                fail_step(&mut history, &events, &thinking_id, "cancelled".to_string());
                break StopReason::Cancelled;
            }
            decoded = decode_turn(services, config, &request, &events) => decoded,
        };

        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                fail_step(&mut history, &events, &thinking_id, e.to_string());
                let _ = events.send(AgentEvent::Error(e.to_string()));
                continue;
            }
        };

        let mut text_buf = String::new();
        let mut tool_call = None;
        let mut truncated = false;
        for event in &decoded {
            match event {
                DecodedEvent::Text(t) => {
                    text_buf.push_str(t);
                    let _ = events.send(AgentEvent::TextDelta(t.clone()));
                }
                DecodedEvent::ToolStarting(name) => {
                    let _ = events.send(AgentEvent::ToolStarting { name: name.clone() });
                }
                DecodedEvent::ToolCall(call) => {
                    if tool_call.is_none() {
                        tool_call = Some(call.clone());
                    }
                }
                DecodedEvent::Truncated => truncated = true,
                DecodedEvent::Error(msg) => {
                    let _ = events.send(AgentEvent::Error(msg.clone()));
                }
            }
        }

        if !text_buf.is_empty() {
            thread.push_message(Message {
                role: Role::Assistant,
                content: MessageContent::Text(text_buf.clone()),
            });
        }

        // Structured edit blocks (§6) are a second, text-borne channel for
        // writes, independent of the tool-call schema. Only consulted when
        // no tool call arrived this turn.
        if tool_call.is_none() && !truncated {
            let edits = crate::edit::parse_edit_batch(&text_buf);
            if !edits.is_empty() {
                remove_step(&mut history, &events, &thinking_id);
                let outcome = apply_edit_batch(
                    &edits,
                    services,
                    &workspace_ctx,
                    &change_tracker,
                    &events,
                    &mut loop_detector,
                    &mut history,
                    &mut files_touched,
                )
                .await;
                thread.push_message(Message {
                    role: Role::User,
                    content: MessageContent::Text(outcome),
                });
                continue;
            }
        }

        let Some(call) = tool_call else {
            if truncated {
                fail_step(&mut history, &events, &thinking_id, crate::decoder::TRUNCATED_DIAGNOSTIC.to_string());
            } else {
                remove_step(&mut history, &events, &thinking_id);
            }
            thread.push_message(Message {
                role: Role::User,
                content: MessageContent::Text(
                    "You must invoke exactly one tool this turn.".to_string(),
                ),
            });
            continue;
        };

        let decision = match decision_from_tool_call(&call) {
            Ok(d) => d,
            Err(e) => {
                fail_step(&mut history, &events, &thinking_id, e.to_string());
                thread.push_message(Message {
                    role: Role::User,
                    content: MessageContent::Parts(vec![ContentPart::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: format!("error: {e}"),
                    }]),
                });
                continue;
            }
        };

        thread.push_message(Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![ContentPart::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            }]),
        });

        let step_id = retarget_step(&mut history, &events, &thinking_id, &decision);

        // Loop detector admission (§4.4).
        match loop_detector.admit(&decision) {
            Verdict::Block(reason) => {
                fail_step(&mut history, &events, &step_id, reason.clone());
                known_bad_actions.push(describe_decision(&decision, &reason));
                thread.push_message(tool_result_message(&call.id, &format!("blocked: {reason}")));
                consecutive_blocks += 1;
                if consecutive_blocks >= 3 {
                    break StopReason::StuckInLoop;
                }
                continue;
            }
            Verdict::Warn => {
                consecutive_blocks = 0;
                let _ = events.send(AgentEvent::SystemMessage(format!(
                    "repeating action with limited progress: {}",
                    describe_decision(&decision, "")
                )));
            }
            Verdict::Admit => {
                consecutive_blocks = 0;
            }
        }

        // Acceptance gate for `done` (§4.7 step 9).
        if let Decision::Done { summary } = &decision {
            if modification_required && loop_detector.files_written() == 0 {
                loop_detector.record_outcome(&decision, false);
                fail_step(
                    &mut history,
                    &events,
                    &step_id,
                    "task requires modifications but no files were written".to_string(),
                );
                thread.push_message(tool_result_message(
                    &call.id,
                    "rejected: this task requires file modifications before done is accepted",
                ));
                if done_rejected_once {
                    break StopReason::DoneRejectedTwice;
                }
                done_rejected_once = true;
                continue;
            }
            loop_detector.record_outcome(&decision, true);
            complete_step(&mut history, &events, &step_id, summary.clone());
            if !files_touched.is_empty() {
                let _ = workspace::append_project_memory(
                    &workspace_ctx.project_root,
                    &finalization_learnings(&task, &files_touched),
                );
            }
            let _ = events.send(AgentEvent::TaskCompleted { summary: summary.clone() });
            break StopReason::Done;
        }

        // Safety interception + approval suspension (§4.7 step 6/7).
        let permission = match &decision {
            Decision::Terminal { .. } | Decision::WriteFile { .. } => ToolPermission::NeedsApproval,
            _ => ToolPermission::ReadOnly,
        };

        if check_deny(&call.name, decision.target_path(), &config.trust) {
            loop_detector.record_outcome(&decision, false);
            fail_step(&mut history, &events, &step_id, "denied by configuration".to_string());
            thread.push_message(tool_result_message(&call.id, "denied by configuration"));
            continue;
        }

        if let Decision::Terminal { command } = &decision {
            if is_blocked_command(command, &config.safety) {
                loop_detector.record_outcome(&decision, false);
                fail_step(&mut history, &events, &step_id, "blocked: unsafe command".to_string());
                known_bad_actions.push(describe_decision(&decision, "blocked: unsafe command"));
                thread.push_message(tool_result_message(&call.id, "blocked: this command is never permitted"));
                continue;
            }
        }

        let force_approval = match &decision {
            Decision::Terminal { command } => needs_command_approval(command, &config.safety),
            Decision::WriteFile { path, .. } => is_protected_write(path, &config.safety),
            _ => false,
        };
        let approval_pattern = approval_pattern(&decision);
        let remembered = !force_approval && approval_memory.was_approved(&call.name, approval_pattern);
        let auto_approved = remembered
            || (!force_approval && check_auto_approve(&call.name, permission, &config.trust) == Some(true));

        if !auto_approved {
            let reason = format!("approve {}", describe_decision(&decision, ""));
            match request_approval(&events, reason).await {
                Ok(true) => {
                    if !force_approval && config.trust.remember_approvals {
                        approval_memory.remember(&call.name, approval_pattern);
                    }
                }
                Ok(false) => {
                    loop_detector.record_outcome(&decision, false);
                    fail_step(&mut history, &events, &step_id, "denied by user".to_string());
                    thread.push_message(tool_result_message(&call.id, "denied by user"));
                    continue;
                }
                Err(_) => {
                    loop_detector.record_outcome(&decision, false);
                    fail_step(&mut history, &events, &step_id, "approval channel closed".to_string());
                    break StopReason::Cancelled;
                }
            }
        }

        // Execution (§4.7 step 8).
        let (succeeded, output, error) = execute_decision(
            &decision,
            &call,
            services,
            &workspace_ctx,
            &tool_ctx,
            &change_tracker,
            &events,
        )
        .await;

        loop_detector.record_outcome(&decision, succeeded);

        if let Decision::ReadFile { path } = &decision {
            if succeeded && !already_read_files.contains(path) {
                already_read_files.push(path.clone());
            }
        }
        if let Decision::WriteFile { path, .. } = &decision {
            if succeeded && !files_touched.contains(path) {
                files_touched.push(path.clone());
            }
        }

        if succeeded {
            complete_step(&mut history, &events, &step_id, output.clone());
        } else {
            known_bad_actions.push(describe_decision(&decision, &error));
            fail_step(&mut history, &events, &step_id, error.clone());
        }

        thread.push_message(tool_result_message(
            &call.id,
            if succeeded { &output } else { &error },
        ));
    };

    let summary = match &stop_reason {
        StopReason::Done => history
            .last()
            .map(|s| s.output.clone())
            .unwrap_or_else(|| "task completed".to_string()),
        StopReason::DoneRejectedTwice => {
            "stopped: task required file modifications that were never made".to_string()
        }
        StopReason::MaxIterations => format!(
            "stopped after {} iterations without completion ({} files written, {} files read)",
            config.max_iterations,
            loop_detector.files_written(),
            already_read_files.len()
        ),
        StopReason::Cancelled => "cancelled".to_string(),
        StopReason::StuckInLoop => "Agent stuck in loop".to_string(),
    };

    Ok(RunOutcome {
        summary,
        reason: stop_reason,
        usage: session_usage,
    })
}

async fn decode_turn(
    services: &Services,
    config: &AgentConfig,
    request: &ChatRequest,
    events: &EventSender,
) -> Result<Vec<DecodedEvent>> {
    let mut attempt = 0u32;
    let stream = loop {
        match services.provider.chat_stream(request).await {
            Ok(stream) => break stream,
            Err(e) => {
                let retryable = e
                    .downcast_ref::<ProviderError>()
                    .map(|pe| pe.is_retryable())
                    .unwrap_or(false);
                if retryable && attempt < config.retry.max_retries {
                    attempt += 1;
                    let wait_ms = backoff_ms(attempt, &config.retry);
                    tracing::warn!(attempt, wait_ms, error = %e, "retrying model stream");
                    let _ = events.send(AgentEvent::Retrying {
                        attempt,
                        max_retries: config.retry.max_retries,
                        wait_ms,
                        reason: e.to_string(),
                    });
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    continue;
                }
                tracing::error!(error = %e, "model stream failed, giving up");
                return Err(e);
            }
        }
    };

    let initial_timeout = if request.system.as_deref().map(|s| s.len()).unwrap_or(0) > 20_000 {
        INITIAL_TIMEOUT_LARGE
    } else {
        INITIAL_TIMEOUT_SIMPLE
    };

    let mut decoder = Decoder::new();
    match decoder.decode(stream, initial_timeout).await {
        Ok(events) => Ok(events),
        Err(DecoderError::Timeout(d)) => Err(anyhow::anyhow!("no token received within {d:?}")),
        Err(DecoderError::Upstream(e)) => Err(e),
    }
}

fn backoff_ms(attempt: u32, retry: &lingcode_config::RetrySettings) -> u64 {
    let scaled = retry.initial_backoff_ms.saturating_mul(1u64 << attempt.min(16));
    scaled.min(retry.max_backoff_ms)
}

async fn request_approval(events: &EventSender, reason: String) -> Result<bool, ()> {
    let (tx, rx) = oneshot::channel();
    let respond = Arc::new(Mutex::new(Some(tx)));
    let _ = events.send(AgentEvent::ApprovalRequested { reason, respond });
    rx.await.map_err(|_| ())
}

fn tool_result_message(tool_use_id: &str, content: &str) -> Message {
    Message {
        role: Role::User,
        content: MessageContent::Parts(vec![ContentPart::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: content.to_string(),
        }]),
    }
}

fn new_step(history: &mut Vec<Step>, events: &EventSender, kind: StepKind, description: String) -> String {
    let mut step = Step::new(kind, description.clone());
    step.transition(StepStatus::Running);
    let id = step.id.clone();
    let _ = events.send(AgentEvent::StepAdded { id: id.clone(), kind, description });
    history.push(step);
    id
}

fn remove_step(history: &mut Vec<Step>, events: &EventSender, id: &str) {
    history.retain(|s| s.id != id);
    let _ = events.send(AgentEvent::StepRemoved { id: id.to_string() });
}

/// Replaces the Thinking placeholder with an Action step once the decoded
/// tool call reveals what kind of action this iteration actually is (§4.3's
/// "TOOL_STARTING" contract: at most one Thinking step exists at a time).
fn retarget_step(history: &mut Vec<Step>, events: &EventSender, thinking_id: &str, decision: &Decision) -> String {
    remove_step(history, events, thinking_id);
    let (kind, description) = match decision {
        Decision::Terminal { command } => (StepKind::Terminal, format!("run: {command}")),
        Decision::WriteFile { path, .. } => (StepKind::CodeWrite, format!("write: {path}")),
        Decision::ReadFile { path } => (StepKind::FileRead, format!("read: {path}")),
        Decision::ReadDir { path, .. } => (StepKind::DirRead, format!("list: {path}")),
        Decision::Search { query, .. } => (StepKind::Search, format!("search: {query}")),
        Decision::Done { .. } => (StepKind::Complete, "done".to_string()),
    };
    let mut step = Step::new(kind, description.clone());
    step.transition(StepStatus::Running);
    step.target_path = decision.target_path().map(|p| p.to_string());
    let id = step.id.clone();
    let _ = events.send(AgentEvent::StepAdded { id: id.clone(), kind, description });
    history.push(step);
    id
}

fn complete_step(history: &mut Vec<Step>, events: &EventSender, id: &str, output: String) {
    if let Some(step) = history.iter_mut().find(|s| s.id == id) {
        step.transition(StepStatus::Completed);
        step.output = output.clone();
    }
    let _ = events.send(AgentEvent::StepUpdated {
        id: id.to_string(),
        status: StepStatus::Completed,
        output: Some(output),
    });
}

fn fail_step(history: &mut Vec<Step>, events: &EventSender, id: &str, error: String) {
    if let Some(step) = history.iter_mut().find(|s| s.id == id) {
        step.transition(StepStatus::Failed);
        step.error = Some(error.clone());
    }
    let _ = events.send(AgentEvent::StepUpdated {
        id: id.to_string(),
        status: StepStatus::Failed,
        output: Some(error),
    });
}

/// The `ApprovalMemory` key for a decision: the command for a terminal
/// call, the target path for a write, empty for anything else (only these
/// two decision kinds ever reach the approval gate).
fn approval_pattern(decision: &Decision) -> &str {
    match decision {
        Decision::Terminal { command } => command.as_str(),
        Decision::WriteFile { path, .. } => path.as_str(),
        _ => "",
    }
}

fn describe_decision(decision: &Decision, reason: &str) -> String {
    let base = match decision {
        Decision::Terminal { command } => format!("run_terminal_command({command})"),
        Decision::WriteFile { path, .. } => format!("write_file({path})"),
        Decision::ReadFile { path } => format!("read_file({path})"),
        Decision::ReadDir { path, .. } => format!("read_directory({path})"),
        Decision::Search { query, web } => {
            if *web {
                format!("search_web({query})")
            } else {
                format!("codebase_search({query})")
            }
        }
        Decision::Done { .. } => "done".to_string(),
    };
    if reason.is_empty() {
        base
    } else {
        format!("{base}: {reason}")
    }
}

/// Runs a tool-call-derived decision. Writes go through the Edit Engine
/// (whole-file replace); everything else dispatches through the registry.
/// `done` never reaches here — it is intercepted earlier.
async fn execute_decision(
    decision: &Decision,
    call: &crate::tools::ToolCall,
    services: &Services,
    workspace_ctx: &WorkspaceContext,
    tool_ctx: &ToolContext,
    change_tracker: &tokio::sync::Mutex<ChangeTracker>,
    events: &EventSender,
) -> (bool, String, String) {
    match decision {
        Decision::WriteFile { path, content } => {
            write_and_validate(path, content.as_deref(), services, workspace_ctx, change_tracker, events).await
        }
        Decision::Terminal { .. } | Decision::ReadFile { .. } | Decision::ReadDir { .. } | Decision::Search { .. } => {
            match services.tools.execute(&call.name, call.input.clone(), tool_ctx).await {
                Ok(result) => (true, result.output, String::new()),
                Err(e) => (false, String::new(), e.to_string()),
            }
        }
        Decision::Done { .. } => (true, String::new(), String::new()),
    }
}

async fn write_and_validate(
    path: &str,
    content: Option<&str>,
    services: &Services,
    workspace_ctx: &WorkspaceContext,
    change_tracker: &tokio::sync::Mutex<ChangeTracker>,
    events: &EventSender,
) -> (bool, String, String) {
    let engine = EditEngine::new(&services.symbol_index);
    match engine.apply_write(path, content, &workspace_ctx.project_root, change_tracker, events).await {
        Ok(outcome) => {
            let abs_path = workspace_ctx.project_root.join(path);
            let validation = services.validator.validate(&abs_path, &workspace_ctx.project_root).await;
            match validation {
                ValidationResult::Success | ValidationResult::Skipped => {
                    (true, format!("{outcome:?}: {path}"), String::new())
                }
                ValidationResult::Warnings(warnings) => {
                    (true, format!("wrote {path} with warnings:\n{}", warnings.join("\n")), String::new())
                }
                ValidationResult::Errors(errors) => {
                    let enriched = enrich(&errors, &abs_path, &workspace_ctx.project_root);
                    (false, String::new(), enriched)
                }
            }
        }
        Err(e) => (false, String::new(), edit_error_message(e)),
    }
}

fn edit_error_message(e: EditError) -> String {
    e.to_string()
}

async fn apply_edit_batch(
    edits: &[Edit],
    services: &Services,
    workspace_ctx: &WorkspaceContext,
    change_tracker: &tokio::sync::Mutex<ChangeTracker>,
    events: &EventSender,
    loop_detector: &mut LoopDetector,
    history: &mut Vec<Step>,
    files_touched: &mut Vec<String>,
) -> String {
    let engine = EditEngine::new(&services.symbol_index);

    let mut admitted_edits: Vec<&Edit> = Vec::new();
    let mut summary = Vec::new();
    for edit in edits {
        let decision = Decision::WriteFile { path: edit.file.clone(), content: Some(edit.content.join("\n")) };
        if let Verdict::Block(reason) = loop_detector.admit(&decision) {
            loop_detector.record_outcome(&decision, false);
            let step_id = new_step(history, events, StepKind::CodeWrite, format!("edit: {}", edit.file));
            fail_step(history, events, &step_id, format!("blocked: {reason}"));
            summary.push(format!("{}: blocked: {reason}", edit.file));
            continue;
        }
        admitted_edits.push(edit);
    }
    let admitted_edits: Vec<Edit> = admitted_edits.into_iter().cloned().collect();

    let results = engine
        .apply_batch(&admitted_edits, &workspace_ctx.project_root, change_tracker, events)
        .await;

    for (edit, result) in admitted_edits.iter().zip(results.into_iter()) {
        let decision = Decision::WriteFile { path: edit.file.clone(), content: Some(edit.content.join("\n")) };
        let step_id = new_step(history, events, StepKind::CodeWrite, format!("edit: {}", edit.file));
        match result {
            Ok(outcome) => {
                loop_detector.record_outcome(&decision, true);
                if !files_touched.contains(&edit.file) {
                    files_touched.push(edit.file.clone());
                }
                let abs_path = workspace_ctx.project_root.join(&edit.file);
                let validation = services.validator.validate(&abs_path, &workspace_ctx.project_root).await;
                match validation {
                    ValidationResult::Errors(errors) => {
                        let enriched = enrich(&errors, &abs_path, &workspace_ctx.project_root);
                        fail_step(history, events, &step_id, enriched.clone());
                        summary.push(format!("{}: validation failed\n{enriched}", edit.file));
                    }
                    other => {
                        let msg = format!("{outcome:?}: {}", edit.file);
                        complete_step(history, events, &step_id, msg.clone());
                        summary.push(match other {
                            ValidationResult::Warnings(w) => format!("{msg} (warnings: {})", w.join("; ")),
                            _ => msg,
                        });
                    }
                }
            }
            Err(e) => {
                loop_detector.record_outcome(&decision, false);
                let msg = e.to_string();
                fail_step(history, events, &step_id, msg.clone());
                summary.push(format!("{}: {msg}", edit.file));
            }
        }
    }
    summary.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use lingcode_config::{SafetyConfig, TrustConfig, TrustMode};
    use lingcode_provider::{ModelInfo, StreamEvent};
    use serde_json::json;
    use tokio::sync::Mutex as TokioMutex;

    /// A scripted `Provider`: each `chat_stream` call pops the next queued
    /// turn (a full `StreamEvent` sequence) off the front of the script.
    struct ScriptedProvider {
        turns: TokioMutex<std::collections::VecDeque<Vec<StreamEvent>>>,
    }

    impl ScriptedProvider {
        fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
            Self { turns: TokioMutex::new(turns.into()) }
        }
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supported_models(&self) -> &[ModelInfo] {
            &[]
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<lingcode_provider::ChatResponse> {
            unimplemented!("agent loop only drives chat_stream")
        }

        async fn chat_stream(
            &self,
            _request: &ChatRequest,
        ) -> Result<futures::stream::BoxStream<'static, Result<StreamEvent>>> {
            let mut turns = self.turns.lock().await;
            let turn = turns.pop_front().unwrap_or_else(|| vec![StreamEvent::Done]);
            let events: Vec<Result<StreamEvent>> = turn.into_iter().map(Ok).collect();
            Ok(stream::iter(events).boxed())
        }
    }

    fn tool_call_turn(id: &str, name: &str, input: serde_json::Value) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ToolCallStart { index: 0, id: id.to_string(), name: name.to_string() },
            StreamEvent::ToolCallDelta { index: 0, arguments_delta: input.to_string() },
            StreamEvent::ToolCallDone { index: 0 },
            StreamEvent::Done,
        ]
    }

    fn text_only_turn(text: &str) -> Vec<StreamEvent> {
        vec![StreamEvent::TextDelta(text.to_string()), StreamEvent::Done]
    }

    fn test_config(max_iterations: u32) -> AgentConfig {
        AgentConfig {
            model: "test-model".to_string(),
            max_tokens: None,
            temperature: None,
            max_iterations,
            custom_instructions: None,
            trust: TrustConfig { mode: TrustMode::Full, ..Default::default() },
            retry: lingcode_config::RetrySettings::default(),
            safety: SafetyConfig::default(),
        }
    }

    fn services_with(provider: ScriptedProvider) -> Services {
        Services::new(Arc::new(provider))
    }

    #[tokio::test]
    async fn writes_a_file_then_accepts_done() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_with(ScriptedProvider::new(vec![
            tool_call_turn("t1", "write_file", json!({"file_path": "notes.txt", "content": "hello world"})),
            tool_call_turn("t2", "done", json!({"summary": "wrote notes.txt"})),
        ]));
        let task = Task::new("add a notes file", Some(dir.path().to_path_buf()));
        let config = test_config(20);
        let (events, _rx) = tokio::sync::broadcast::channel(64);
        let cancel = CancellationToken::new();

        let outcome = run(task, &services, &config, events, cancel).await.unwrap();

        assert!(matches!(outcome.reason, StopReason::Done));
        assert_eq!(outcome.summary, "wrote notes.txt");
        assert_eq!(std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn rejects_done_twice_when_modifications_required_but_nothing_written() {
        let services = services_with(ScriptedProvider::new(vec![
            tool_call_turn("t1", "done", json!({"summary": "nothing to do"})),
            tool_call_turn("t2", "done", json!({"summary": "still nothing"})),
        ]));
        let task = Task::new("refactor UserService", None);
        let config = test_config(20);
        let (events, _rx) = tokio::sync::broadcast::channel(64);
        let cancel = CancellationToken::new();

        let outcome = run(task, &services, &config, events, cancel).await.unwrap();

        assert!(matches!(outcome.reason, StopReason::DoneRejectedTwice));
    }

    #[tokio::test]
    async fn three_consecutive_loop_blocks_terminate_as_stuck() {
        let read_main = || tool_call_turn("r", "read_file", json!({"file_path": "main.py"}));
        let services = services_with(ScriptedProvider::new(vec![
            read_main(),
            read_main(),
            read_main(),
            read_main(),
        ]));
        let task = Task::new("improve main.py", None);
        let config = test_config(20);
        let (events, _rx) = tokio::sync::broadcast::channel(64);
        let cancel = CancellationToken::new();

        let outcome = run(task, &services, &config, events, cancel).await.unwrap();

        assert!(matches!(outcome.reason, StopReason::StuckInLoop));
        assert_eq!(outcome.summary, "Agent stuck in loop");
    }

    #[tokio::test]
    async fn exhausts_max_iterations_when_model_never_calls_a_tool() {
        let services = services_with(ScriptedProvider::new(vec![text_only_turn("thinking out loud")]));
        let task = Task::new("explain the auth flow", None);
        let config = test_config(1);
        let (events, _rx) = tokio::sync::broadcast::channel(64);
        let cancel = CancellationToken::new();

        let outcome = run(task, &services, &config, events, cancel).await.unwrap();

        assert!(matches!(outcome.reason, StopReason::MaxIterations));
    }

    #[tokio::test]
    async fn unsafe_command_is_blocked_and_never_executed() {
        let services = services_with(ScriptedProvider::new(vec![
            tool_call_turn("t1", "run_terminal_command", json!({"command": "sudo rm -rf / --no-preserve-root"})),
            tool_call_turn("t2", "done", json!({"summary": "done"})),
        ]));
        let task = Task::new("clean up disk space", None);
        let config = test_config(20);
        let (events, _rx) = tokio::sync::broadcast::channel(64);
        let cancel = CancellationToken::new();

        let outcome = run(task, &services, &config, events, cancel).await.unwrap();

        assert!(matches!(outcome.reason, StopReason::Done));
    }

    #[tokio::test]
    async fn write_file_missing_content_fails_validation_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_with(ScriptedProvider::new(vec![
            tool_call_turn("t1", "write_file", json!({"file_path": "notes.txt"})),
            tool_call_turn("t2", "write_file", json!({"file_path": "notes.txt", "content": "ok"})),
            tool_call_turn("t3", "done", json!({"summary": "wrote notes.txt"})),
        ]));
        let task = Task::new("add a notes file", Some(dir.path().to_path_buf()));
        let config = test_config(20);
        let (events, _rx) = tokio::sync::broadcast::channel(64);
        let cancel = CancellationToken::new();

        let outcome = run(task, &services, &config, events, cancel).await.unwrap();

        assert!(matches!(outcome.reason, StopReason::Done));
        assert_eq!(std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "ok");
    }

    #[tokio::test]
    async fn remembers_approval_after_first_grant_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_with(ScriptedProvider::new(vec![
            tool_call_turn("t1", "write_file", json!({"file_path": "notes.txt", "content": "one"})),
            tool_call_turn("t2", "write_file", json!({"file_path": "notes.txt", "content": "two"})),
            tool_call_turn("t3", "done", json!({"summary": "done"})),
        ]));
        let task = Task::new("add a notes file", Some(dir.path().to_path_buf()));
        let mut config = test_config(20);
        config.trust = TrustConfig {
            mode: TrustMode::Limited,
            remember_approvals: true,
            ..Default::default()
        };
        let (events, mut rx) = tokio::sync::broadcast::channel(64);
        let cancel = CancellationToken::new();

        let approvals = Arc::new(TokioMutex::new(0u32));
        let approvals_counter = approvals.clone();
        let listener = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(AgentEvent::ApprovalRequested { respond, .. }) => {
                        *approvals_counter.lock().await += 1;
                        if let Some(sender) = respond.lock().await.take() {
                            let _ = sender.send(true);
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let outcome = run(task, &services, &config, events, cancel).await.unwrap();
        listener.abort();

        assert!(matches!(outcome.reason, StopReason::Done));
        assert_eq!(*approvals.lock().await, 1);
    }

    /// §9 open question: `SessionUsage` is threaded through but never
    /// mutated since the decoder drops `StreamEvent::Usage` (DESIGN.md).
    #[tokio::test]
    async fn session_usage_stays_zero_without_decoder_plumbing() {
        let services = services_with(ScriptedProvider::new(vec![
            tool_call_turn("t1", "done", json!({"summary": "trivial task"})),
        ]));
        let task = Task::new("say hello", None);
        let config = test_config(20);
        let (events, _rx) = tokio::sync::broadcast::channel(64);
        let cancel = CancellationToken::new();

        let outcome = run(task, &services, &config, events, cancel).await.unwrap();

        assert_eq!(outcome.usage.total_cost_usd, 0.0);
    }
}

fn finalization_learnings(task: &Task, files_touched: &[String]) -> Vec<String> {
    let description: String = if task.description.chars().count() > 80 {
        format!("{}...", task.description.chars().take(80).collect::<String>())
    } else {
        task.description.clone()
    };
    vec![format!(
        "completed \"{description}\" by editing: {}",
        files_touched.join(", ")
    )]
}
