//! Normalizes and hashes proposed actions, then applies eight ordered rules
//! to decide whether the agent loop should admit, warn about, or block a
//! decision before it executes.
//!
//! Shares `tools/permission.rs`'s ordered-rule-table shape (first match
//! wins, each rule a short guard).

use std::collections::{HashSet, VecDeque};

use sha2::{Digest, Sha256};

use crate::model::{ActionHash, Decision};

/// Size of the recent-action ring used by rules 4-6.
const RING_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Warn,
    Block(String),
}

#[derive(Debug, Clone)]
struct LogEntry {
    hash: ActionHash,
    /// Set when this entry represents a write or a successful command —
    /// used by rule 5/6's "progress since last occurrence" test.
    is_progress: bool,
}

/// Per-task state. One instance lives for the duration of an agent run.
#[derive(Default)]
pub struct LoopDetector {
    log: Vec<LogEntry>,
    recent: VecDeque<ActionHash>,
    failed: HashSet<ActionHash>,
    /// Paths read to completion this task, not yet invalidated by a write.
    known_reads: HashSet<String>,
    /// Paths written this task, awaiting a verification read (rule 2).
    pending_verification: HashSet<String>,
    search_queries: Vec<String>,
    files_written: usize,
    commands_run: usize,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files_written(&self) -> usize {
        self.files_written
    }

    /// Runs the ordered rule chain. Does not mutate state — call
    /// `record_outcome` after the decision actually executes (or fails).
    pub fn admit(&self, decision: &Decision) -> Verdict {
        let hash = compute_action_hash(decision);

        // 1. Previously failed identical action.
        if self.failed.contains(&hash) {
            return Verdict::Block("action repeated after failure".into());
        }

        // 2. Verification exception: read of a just-written pending file.
        if let Decision::ReadFile { path } = decision {
            if self.pending_verification.contains(path) {
                return Verdict::Admit;
            }
        }

        // 3. Reading a known-in-context file.
        if let Decision::ReadFile { path } = decision {
            if self.known_reads.contains(path) {
                return Verdict::Block("content already in history".into());
            }
        }

        // 4. Consecutive repetition: the admitted action would be the third
        // identical hash in a row, counting the two immediately preceding it.
        if self.recent.len() >= 2 {
            let last_two: Vec<_> = self.recent.iter().rev().take(2).collect();
            if last_two.iter().all(|h| **h == hash) {
                return Verdict::Block("consecutive repetition".into());
            }
        }

        // 5/6. Threshold exceeded in the recent ring, with or without progress.
        // The ring holds past occurrences only; the action now being admitted
        // would be an additional occurrence, so a single prior hit already
        // meets the ">= 2 times" threshold.
        let occurrences = self.recent.iter().filter(|h| **h == hash).count() + 1;
        if occurrences >= 2 {
            if self.progress_since_last_occurrence(&hash) {
                return Verdict::Warn;
            }
            return Verdict::Block("repeated action without progress".into());
        }

        // 7. Repeated search: case-insensitive substring containment.
        if let Decision::Search { query, .. } = decision {
            let needle = query.to_lowercase();
            let repeats = self
                .search_queries
                .iter()
                .filter(|q| {
                    let q = q.to_lowercase();
                    q.contains(&needle) || needle.contains(&q)
                })
                .count();
            if repeats >= 2 {
                return Verdict::Block("repeated search query".into());
            }
        }

        // 8. Otherwise.
        Verdict::Admit
    }

    /// True if any write or successful command was logged after the most
    /// recent prior occurrence of `hash` in the full log.
    fn progress_since_last_occurrence(&self, hash: &ActionHash) -> bool {
        let last_index = self.log.iter().rposition(|e| e.hash == *hash);
        let search_from = last_index.map(|i| i + 1).unwrap_or(0);
        self.log[search_from..].iter().any(|e| e.is_progress)
    }

    /// Call once the decision has actually been executed, updating the
    /// bookkeeping every later rule depends on.
    pub fn record_outcome(&mut self, decision: &Decision, succeeded: bool) {
        let hash = compute_action_hash(decision);
        let is_progress = succeeded
            && matches!(decision, Decision::WriteFile { .. } | Decision::Terminal { .. });

        self.log.push(LogEntry { hash: hash.clone(), is_progress });
        self.recent.push_back(hash.clone());
        if self.recent.len() > RING_SIZE {
            self.recent.pop_front();
        }

        if !succeeded {
            self.failed.insert(hash);
            return;
        }

        match decision {
            Decision::ReadFile { path } => {
                self.known_reads.insert(path.clone());
                self.pending_verification.remove(path);
            }
            Decision::WriteFile { path, .. } => {
                self.files_written += 1;
                self.known_reads.remove(path);
                self.pending_verification.insert(path.clone());
            }
            Decision::Terminal { .. } => {
                self.commands_run += 1;
            }
            Decision::Search { query, .. } => {
                self.search_queries.push(query.clone());
            }
            _ => {}
        }
    }

    /// Dynamic tool filtering: names to exclude from the next prompt's tool
    /// list, given the current iteration and whether the task requires
    /// modifications.
    pub fn tool_filter(&self, iteration: u32, modification_required: bool) -> Vec<&'static str> {
        if !modification_required {
            return Vec::new();
        }
        if iteration >= 8 && self.files_written == 0 {
            return vec!["read_file", "read_directory", "codebase_search", "search_web", "run_terminal_command"];
        }
        if iteration > 3 && self.files_written == 0 && !self.known_reads.is_empty() {
            return vec!["read_file", "read_directory", "codebase_search", "search_web"];
        }
        Vec::new()
    }

    /// Whether the next prompt must force `write_file` (past iteration 8
    /// with nothing written yet).
    pub fn must_force_write(&self, iteration: u32) -> bool {
        iteration >= 8 && self.files_written == 0
    }
}

/// `"<action>:<command>:<path>:<normalized_code_hash>"`. Code content
/// (currently only relevant to `WriteFile`) is normalized before hashing so
/// reformatting alone does not register as a new action.
pub fn compute_action_hash(decision: &Decision) -> ActionHash {
    let (action, command, path, code) = match decision {
        Decision::Done { summary } => ("done", "", "", summary.as_str()),
        Decision::Terminal { command } => ("terminal", command.as_str(), "", ""),
        Decision::WriteFile { path, content } => {
            ("write_file", "", path.as_str(), content.as_deref().unwrap_or(""))
        }
        Decision::ReadFile { path } => ("read_file", "", path.as_str(), ""),
        Decision::ReadDir { path, .. } => ("read_directory", "", path.as_str(), ""),
        Decision::Search { query, web } => {
            if *web {
                ("search_web", query.as_str(), "", "")
            } else {
                ("codebase_search", query.as_str(), "", "")
            }
        }
    };

    let normalized_code = normalize_code(code);
    let mut hasher = Sha256::new();
    hasher.update(normalized_code.as_bytes());
    let digest = hasher.finalize();
    let code_hash = format!("{:x}", digest)[..16].to_string();

    ActionHash(format!("{action}:{command}:{path}:{code_hash}"))
}

/// Strips `//` and `#` line comments and collapses whitespace so
/// reformatted-but-otherwise-identical content hashes the same. Whitespace
/// is removed entirely, not just collapsed to a single space, so operator
/// spacing (`1 + 1` vs `1+1`) doesn't register as a different action.
fn normalize_code(code: &str) -> String {
    code.lines()
        .map(|line| {
            let stripped = match line.find("//") {
                Some(i) => &line[..i],
                None => match line.find('#') {
                    Some(i) => &line[..i],
                    None => line,
                },
            };
            stripped.chars().filter(|c| !c.is_whitespace()).collect::<String>()
        })
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &str) -> Decision {
        Decision::ReadFile { path: path.to_string() }
    }

    fn write(path: &str, content: &str) -> Decision {
        Decision::WriteFile { path: path.to_string(), content: Some(content.to_string()) }
    }

    #[test]
    fn blocks_previously_failed_action() {
        let mut d = LoopDetector::new();
        let action = Decision::Terminal { command: "cargo test".into() };
        d.record_outcome(&action, false);
        assert!(matches!(d.admit(&action), Verdict::Block(_)));
    }

    #[test]
    fn admits_read_of_just_written_file_once() {
        let mut d = LoopDetector::new();
        d.record_outcome(&write("a.rs", "fn a() {}"), true);
        assert_eq!(d.admit(&read("a.rs")), Verdict::Admit);
    }

    #[test]
    fn blocks_reading_known_in_context_file() {
        let mut d = LoopDetector::new();
        d.record_outcome(&read("a.rs"), true);
        assert!(matches!(d.admit(&read("a.rs")), Verdict::Block(_)));
    }

    #[test]
    fn writing_invalidates_known_read_status() {
        let mut d = LoopDetector::new();
        d.record_outcome(&read("a.rs"), true);
        d.record_outcome(&write("a.rs", "fn a() {}"), true);
        // after a write, reading again is the verification exception, not rule 3
        assert_eq!(d.admit(&read("a.rs")), Verdict::Admit);
    }

    #[test]
    fn blocks_three_consecutive_identical_actions() {
        let mut d = LoopDetector::new();
        let action = Decision::Terminal { command: "ls".into() };
        d.record_outcome(&action, true);
        d.record_outcome(&action, true);
        assert!(matches!(d.admit(&action), Verdict::Block(_)));
    }

    #[test]
    fn warns_when_threshold_exceeded_with_progress() {
        let mut d = LoopDetector::new();
        let search = Decision::Search { query: "foo".into(), web: false };
        let other = Decision::Terminal { command: "echo a".into() };
        d.record_outcome(&search, true);
        d.record_outcome(&other, true);
        d.record_outcome(&write("a.rs", "x"), true);
        assert_eq!(d.admit(&search), Verdict::Warn);
    }

    #[test]
    fn blocks_repeated_search_by_substring_containment() {
        let mut d = LoopDetector::new();
        d.record_outcome(&Decision::Search { query: "auth flow".into(), web: false }, true);
        d.record_outcome(&Decision::Terminal { command: "ls".into() }, true);
        d.record_outcome(&Decision::Search { query: "auth".into(), web: false }, true);
        d.record_outcome(&Decision::Terminal { command: "pwd".into() }, true);
        let verdict = d.admit(&Decision::Search { query: "the auth flow here".into(), web: false });
        assert!(matches!(verdict, Verdict::Block(_)));
    }

    #[test]
    fn forces_write_past_iteration_eight_with_no_writes() {
        let d = LoopDetector::new();
        assert!(d.must_force_write(8));
        assert!(!d.must_force_write(7));
    }

    #[test]
    fn reformatted_content_hashes_identically() {
        let a = compute_action_hash(&write("a.rs", "fn a()  {\n  1 + 1\n}"));
        let b = compute_action_hash(&write("a.rs", "fn a() {\n1+1\n}"));
        assert_eq!(a, b);
    }
}
