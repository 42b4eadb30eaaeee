//! Safety gating for the 7-tool surface (§4.7 step 6). Mirrors the trust/
//! deny-list shape of the wider corpus but reads its literal blocked/approval
//! substrings and protected file names from `SafetyConfig` rather than a
//! hardcoded list, so operators can extend them without a rebuild.

use lingcode_config::{SafetyConfig, TrustConfig, TrustMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPermission {
    ReadOnly,
    NeedsApproval,
}

/// True if the tool or target path is explicitly denied by the trust config.
pub fn check_deny(tool_name: &str, target_path: Option<&str>, trust: &TrustConfig) -> bool {
    if trust.deny_tools.iter().any(|d| d.eq_ignore_ascii_case(tool_name) || d == "*") {
        return true;
    }
    if let Some(path) = target_path {
        if trust
            .deny_paths
            .iter()
            .any(|d| path.starts_with(d.as_str()) || path.contains(d.as_str()))
        {
            return true;
        }
    }
    false
}

/// `Some(true)` auto-approve, `Some(false)` always ask, `None` defer to the
/// caller's default (ask once, then `remember_approvals` if granted).
pub fn check_auto_approve(tool_name: &str, permission: ToolPermission, trust: &TrustConfig) -> Option<bool> {
    match trust.mode {
        TrustMode::Full => Some(true),
        TrustMode::AutoEdit => match permission {
            ToolPermission::ReadOnly => Some(true),
            ToolPermission::NeedsApproval => {
                if tool_name == "write_file" {
                    Some(true)
                } else {
                    None
                }
            }
        },
        TrustMode::Limited => match permission {
            ToolPermission::ReadOnly => Some(true),
            ToolPermission::NeedsApproval => None,
        },
        TrustMode::Off => None,
    }
}

/// A command that must never run, even with approval (§4.7 step 6).
pub fn is_blocked_command(command: &str, safety: &SafetyConfig) -> bool {
    let lower = command.to_lowercase();
    safety.blocked_command_substrings.iter().any(|pat| lower.contains(&pat.to_lowercase()))
}

/// A command that is allowed but always needs interactive sign-off.
pub fn needs_command_approval(command: &str, safety: &SafetyConfig) -> bool {
    let lower = command.to_lowercase();
    safety.approval_command_substrings.iter().any(|pat| lower.contains(&pat.to_lowercase()))
}

/// A write target whose file name matches one of the protected names.
pub fn is_protected_write(path: &str, safety: &SafetyConfig) -> bool {
    let file_name = std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);
    safety
        .protected_write_names
        .iter()
        .any(|name| file_name == name || path.ends_with(name.as_str()))
}

/// Session-level "don't ask again for this exact tool+pattern" memory. The
/// agent loop consults `was_approved` before suspending for approval and
/// calls `remember` after a user grants one, gated on
/// `TrustConfig::remember_approvals` (§4.7 step 7).
#[derive(Default)]
pub struct ApprovalMemory {
    approved: std::collections::HashSet<String>,
}

impl ApprovalMemory {
    pub fn remember(&mut self, tool_name: &str, pattern: &str) {
        self.approved.insert(format!("{tool_name}:{pattern}"));
    }

    pub fn was_approved(&self, tool_name: &str, pattern: &str) -> bool {
        self.approved.contains(&format!("{tool_name}:{pattern}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_commands_match_literal_spec_list() {
        let safety = SafetyConfig::default();
        assert!(is_blocked_command("sudo rm -rf / --no-preserve-root", &safety));
        assert!(!is_blocked_command("ls -la", &safety));
    }

    #[test]
    fn protected_write_matches_by_file_name() {
        let safety = SafetyConfig::default();
        assert!(is_protected_write("/repo/.env", &safety));
        assert!(!is_protected_write("/repo/src/main.rs", &safety));
    }

    #[test]
    fn remembers_only_after_being_told_to() {
        let mut memory = ApprovalMemory::default();
        assert!(!memory.was_approved("run_terminal_command", "npm test"));
        memory.remember("run_terminal_command", "npm test");
        assert!(memory.was_approved("run_terminal_command", "npm test"));
        assert!(!memory.was_approved("run_terminal_command", "npm build"));
    }
}
