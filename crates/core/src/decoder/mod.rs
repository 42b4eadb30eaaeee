//! Tool-Call Decoder (C3, §4.3). Consumes the transport-level `StreamEvent`
//! sequence from `lingcode_provider` (Dialect A — already demultiplexed SSE
//! `content_block_*` framing, see `sse.rs`/`anthropic.rs` in that crate) and
//! reconstructs complete tool calls, buffering partial-JSON input deltas per
//! block index. Also scans accumulated text for Dialect B's inline
//! `TOOL_CALL:<id>:<name>:<base64-json>` protocol.
//!
//! Grounded on the teacher's `streaming/mod.rs` accumulator shape for the
//! per-index buffering; the repair heuristic and Dialect B scan have no
//! teacher analogue and are authored directly from §4.3's algorithm.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use futures::{Stream, StreamExt};
use lingcode_provider::StreamEvent;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::tools::ToolCall;

/// Diagnostic text token emitted when partial-JSON repair fails (§4.3).
pub const TRUNCATED_DIAGNOSTIC: &str = "API Response Truncated";

/// Adaptive initial-token deadlines (§4.3, §5).
pub const INITIAL_TIMEOUT_SIMPLE: Duration = Duration::from_secs(6);
pub const INITIAL_TIMEOUT_LARGE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub enum DecodedEvent {
    Text(String),
    /// Heartbeat: a tool-use block has begun streaming, before its input is
    /// complete (§4.3's "TOOL_STARTING" contract).
    ToolStarting(String),
    ToolCall(ToolCall),
    /// Emitted in place of a tool call when repair failed (§4.3 step 3).
    Truncated,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("no token received within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

struct PendingToolCall {
    id: String,
    name: String,
    json_buf: String,
}

/// One decoder per model turn; holds the partial-JSON accumulator state and
/// the Dialect B text scan buffer for the duration of a single stream.
#[derive(Default)]
pub struct Decoder {
    pending: HashMap<u32, PendingToolCall>,
    dialect_b_buf: String,
    dialect_b_consumed: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drives `stream` to completion (or the first error/`Done`), enforcing
    /// the initial-token deadline on the very first item only — once
    /// streaming begins there is no per-chunk timeout (§5: "No global task
    /// timeout").
    pub async fn decode<S>(
        &mut self,
        mut stream: S,
        initial_timeout: Duration,
    ) -> Result<Vec<DecodedEvent>, DecoderError>
    where
        S: Stream<Item = anyhow::Result<StreamEvent>> + Unpin,
    {
        let mut out = Vec::new();

        let first = tokio::time::timeout(initial_timeout, stream.next())
            .await
            .map_err(|_| DecoderError::Timeout(initial_timeout))?;

        let Some(first) = first else {
            return Ok(out);
        };
        if self.handle(first?, &mut out) {
            return Ok(out);
        }

        while let Some(item) = stream.next().await {
            let stop = match item {
                Ok(ev) => self.handle(ev, &mut out),
                Err(e) => {
                    out.push(DecodedEvent::Error(e.to_string()));
                    true
                }
            };
            if stop {
                break;
            }
        }

        Ok(out)
    }

    /// Returns `true` when the stream should stop (Done or Error).
    fn handle(&mut self, event: StreamEvent, out: &mut Vec<DecodedEvent>) -> bool {
        match event {
            StreamEvent::TextDelta(text) => {
                self.dialect_b_buf.push_str(&text);
                self.scan_dialect_b(out);
                out.push(DecodedEvent::Text(text));
                false
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                out.push(DecodedEvent::ToolStarting(name.clone()));
                self.pending.insert(index, PendingToolCall { id, name, json_buf: String::new() });
                false
            }
            StreamEvent::ToolCallDelta { index, arguments_delta } => {
                if let Some(p) = self.pending.get_mut(&index) {
                    p.json_buf.push_str(&arguments_delta);
                }
                false
            }
            StreamEvent::ToolCallDone { index } => {
                if let Some(p) = self.pending.remove(&index) {
                    match parse_or_repair(&p.json_buf) {
                        Some(input) => out.push(DecodedEvent::ToolCall(ToolCall {
                            id: p.id,
                            name: p.name,
                            input,
                        })),
                        None => out.push(DecodedEvent::Truncated),
                    }
                }
                false
            }
            StreamEvent::Usage(_) => false,
            StreamEvent::Done => true,
            StreamEvent::Error(msg) => {
                out.push(DecodedEvent::Error(msg));
                true
            }
        }
    }

    fn scan_dialect_b(&mut self, out: &mut Vec<DecodedEvent>) {
        let re = dialect_b_pattern();
        let unconsumed = &self.dialect_b_buf[self.dialect_b_consumed..];
        let mut advance = 0;
        for caps in re.captures_iter(unconsumed) {
            let whole = caps.get(0).unwrap();
            let id = caps.get(1).unwrap().as_str().to_string();
            let name = caps.get(2).unwrap().as_str().to_string();
            let b64 = caps.get(3).unwrap().as_str();
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(b64) {
                if let Ok(input) = serde_json::from_slice::<Value>(&bytes) {
                    out.push(DecodedEvent::ToolCall(ToolCall { id, name, input }));
                }
            }
            advance = whole.end();
        }
        self.dialect_b_consumed += advance;
    }
}

fn dialect_b_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"TOOL_CALL:([^:]+):([^:]+):([A-Za-z0-9+/=]+)").unwrap())
}

/// Partial-JSON repair (§4.3): append a missing closing quote, then a
/// missing closing brace, re-parsing after each step.
fn parse_or_repair(buf: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(buf) {
        return Some(v);
    }

    let mut attempt = buf.to_string();
    if ends_inside_unterminated_string(buf) {
        attempt.push('"');
        if let Ok(v) = serde_json::from_str(&attempt) {
            return Some(v);
        }
    }

    attempt.push('}');
    if let Ok(v) = serde_json::from_str(&attempt) {
        return Some(v);
    }

    None
}

fn ends_inside_unterminated_string(s: &str) -> bool {
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ => {}
        }
    }
    in_string
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn ev(e: anyhow::Result<StreamEvent>) -> anyhow::Result<StreamEvent> {
        e
    }

    #[tokio::test]
    async fn accumulates_tool_call_input_deltas_and_emits_on_stop() {
        let events = vec![
            ev(Ok(StreamEvent::ToolCallStart { index: 0, id: "t1".into(), name: "read_file".into() })),
            ev(Ok(StreamEvent::ToolCallDelta { index: 0, arguments_delta: "{\"file_path\":".into() })),
            ev(Ok(StreamEvent::ToolCallDelta { index: 0, arguments_delta: "\"a.rs\"}".into() })),
            ev(Ok(StreamEvent::ToolCallDone { index: 0 })),
            ev(Ok(StreamEvent::Done)),
        ];
        let mut decoder = Decoder::new();
        let decoded = decoder
            .decode(stream::iter(events), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(matches!(decoded[0], DecodedEvent::ToolStarting(ref n) if n == "read_file"));
        let call = decoded.iter().find_map(|e| match e {
            DecodedEvent::ToolCall(c) => Some(c),
            _ => None,
        }).expect("tool call emitted");
        assert_eq!(call.input.get("file_path").and_then(|v| v.as_str()), Some("a.rs"));
    }

    #[tokio::test]
    async fn repairs_truncated_json_missing_quote_and_brace() {
        let events = vec![
            ev(Ok(StreamEvent::ToolCallStart { index: 0, id: "t1".into(), name: "write_file".into() })),
            ev(Ok(StreamEvent::ToolCallDelta { index: 0, arguments_delta: "{\"file_path\":\"x.txt\"".into() })),
            ev(Ok(StreamEvent::ToolCallDone { index: 0 })),
            ev(Ok(StreamEvent::Done)),
        ];
        let mut decoder = Decoder::new();
        let decoded = decoder
            .decode(stream::iter(events), Duration::from_secs(1))
            .await
            .unwrap();
        let call = decoded.iter().find_map(|e| match e {
            DecodedEvent::ToolCall(c) => Some(c),
            _ => None,
        }).expect("repaired call emitted");
        assert_eq!(call.input.get("file_path").and_then(|v| v.as_str()), Some("x.txt"));
    }

    #[tokio::test]
    async fn unrepairable_json_emits_truncated_diagnostic() {
        let events = vec![
            ev(Ok(StreamEvent::ToolCallStart { index: 0, id: "t1".into(), name: "write_file".into() })),
            ev(Ok(StreamEvent::ToolCallDelta { index: 0, arguments_delta: "not json at all &^%".into() })),
            ev(Ok(StreamEvent::ToolCallDone { index: 0 })),
            ev(Ok(StreamEvent::Done)),
        ];
        let mut decoder = Decoder::new();
        let decoded = decoder
            .decode(stream::iter(events), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(decoded.iter().any(|e| matches!(e, DecodedEvent::Truncated)));
    }

    #[tokio::test]
    async fn recognizes_dialect_b_inline_tool_call() {
        let payload = serde_json::json!({ "command": "ls" });
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&payload).unwrap());
        let text = format!("Sure, I'll run that.\nTOOL_CALL:abc:run_terminal_command:{encoded}\n");
        let events = vec![ev(Ok(StreamEvent::TextDelta(text))), ev(Ok(StreamEvent::Done))];
        let mut decoder = Decoder::new();
        let decoded = decoder
            .decode(stream::iter(events), Duration::from_secs(1))
            .await
            .unwrap();
        let call = decoded.iter().find_map(|e| match e {
            DecodedEvent::ToolCall(c) => Some(c),
            _ => None,
        }).expect("dialect B call emitted");
        assert_eq!(call.name, "run_terminal_command");
        assert_eq!(call.input.get("command").and_then(|v| v.as_str()), Some("ls"));
    }

    #[tokio::test]
    async fn initial_token_timeout_errors() {
        let events: Vec<anyhow::Result<StreamEvent>> = vec![];
        let mut decoder = Decoder::new();
        let pending = futures::stream::pending::<anyhow::Result<StreamEvent>>();
        let _ = events;
        let result = decoder.decode(pending, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(DecoderError::Timeout(_))));
    }
}
