use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `~/.config/lingcode/config.toml` and
/// optionally overlaid with a project-local `.lingcode/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider")]
    pub default: String,
    #[serde(default)]
    pub anthropic: ProviderEntry,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default: default_provider(),
            anthropic: ProviderEntry::default(),
        }
    }
}

fn default_provider() -> String {
    "anthropic".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderEntry {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tokens: None,
            custom_instructions: None,
            trust: TrustConfig::default(),
            retry: RetrySettings::default(),
            safety: SafetyConfig::default(),
        }
    }
}

fn default_max_iterations() -> u32 {
    20
}

/// Command/path lists driving the agent loop's safety interception (step 6
/// of the per-iteration procedure). Ship with literal defaults but are
/// config-overridable; project config unions onto global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_blocked_commands")]
    pub blocked_command_substrings: Vec<String>,
    #[serde(default = "default_approval_commands")]
    pub approval_command_substrings: Vec<String>,
    #[serde(default = "default_protected_write_names")]
    pub protected_write_names: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blocked_command_substrings: default_blocked_commands(),
            approval_command_substrings: default_approval_commands(),
            protected_write_names: default_protected_write_names(),
        }
    }
}

fn default_blocked_commands() -> Vec<String> {
    vec![
        "rm -rf /".to_string(),
        "mkfs".to_string(),
        "dd if=/dev/zero".to_string(),
        "format c:".to_string(),
    ]
}

fn default_approval_commands() -> Vec<String> {
    vec![
        "rm".to_string(),
        "sudo".to_string(),
        "chmod".to_string(),
        "git reset --hard".to_string(),
        "git push --force".to_string(),
        "git clean -fd".to_string(),
    ]
}

fn default_protected_write_names() -> Vec<String> {
    vec![
        ".env".to_string(),
        "credentials".to_string(),
        "secrets".to_string(),
        "config.json".to_string(),
        "package-lock.json".to_string(),
        ".git/config".to_string(),
    ]
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default)]
    pub mode: TrustMode,
    #[serde(default)]
    pub allow_tools: Vec<String>,
    #[serde(default)]
    pub allow_paths: Vec<String>,
    #[serde(default)]
    pub deny_tools: Vec<String>,
    #[serde(default)]
    pub deny_paths: Vec<String>,
    #[serde(default)]
    pub remember_approvals: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustMode {
    #[default]
    Off,
    Limited,
    AutoEdit,
    Full,
}

impl std::fmt::Display for TrustMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustMode::Off => write!(f, "off"),
            TrustMode::Limited => write!(f, "limited"),
            TrustMode::AutoEdit => write!(f, "autoedit"),
            TrustMode::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for TrustMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(TrustMode::Off),
            "limited" => Ok(TrustMode::Limited),
            "autoedit" | "auto_edit" | "auto-edit" => Ok(TrustMode::AutoEdit),
            "full" => Ok(TrustMode::Full),
            other => Err(format!(
                "unknown trust mode: {other} (use off, limited, autoedit, or full)"
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub auto_memory: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            let content =
                std::fs::read_to_string(&path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lingcode")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lingcode")
    }

    pub fn ensure_dirs() -> Result<()> {
        std::fs::create_dir_all(Self::config_dir())?;
        std::fs::create_dir_all(Self::data_dir())?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        Self::ensure_dirs()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Reads `<project_root>/.lingcode/config.toml`, if present.
    pub fn load_project(project_root: &std::path::Path) -> Result<Option<Self>> {
        let path = project_root.join(".lingcode").join("config.toml");
        if path.exists() {
            let content =
                std::fs::read_to_string(&path).context("Failed to read project config")?;
            let config: Config =
                toml::from_str(&content).context("Failed to parse project config")?;
            Ok(Some(config))
        } else {
            Ok(None)
        }
    }

    /// Merges a project overlay onto the global config. Project settings win
    /// per-field when non-default; deny-lists union rather than replace.
    pub fn merge(global: &Config, project: &Config) -> Config {
        let mut deny_tools = global.agent.trust.deny_tools.clone();
        deny_tools.extend(project.agent.trust.deny_tools.clone());
        deny_tools.sort();
        deny_tools.dedup();

        let mut deny_paths = global.agent.trust.deny_paths.clone();
        deny_paths.extend(project.agent.trust.deny_paths.clone());
        deny_paths.sort();
        deny_paths.dedup();

        let trust = if project.agent.trust.mode != TrustMode::Off {
            TrustConfig {
                deny_tools,
                deny_paths,
                ..project.agent.trust.clone()
            }
        } else {
            TrustConfig {
                deny_tools,
                deny_paths,
                ..global.agent.trust.clone()
            }
        };

        let mut blocked = global.agent.safety.blocked_command_substrings.clone();
        blocked.extend(project.agent.safety.blocked_command_substrings.clone());
        blocked.sort();
        blocked.dedup();

        let mut approval = global.agent.safety.approval_command_substrings.clone();
        approval.extend(project.agent.safety.approval_command_substrings.clone());
        approval.sort();
        approval.dedup();

        let mut protected = global.agent.safety.protected_write_names.clone();
        protected.extend(project.agent.safety.protected_write_names.clone());
        protected.sort();
        protected.dedup();

        Config {
            provider: ProviderConfig {
                default: if project.provider.default != default_provider() {
                    project.provider.default.clone()
                } else {
                    global.provider.default.clone()
                },
                anthropic: merge_provider_entry(&global.provider.anthropic, &project.provider.anthropic),
            },
            agent: AgentSettings {
                max_iterations: if project.agent.max_iterations != default_max_iterations() {
                    project.agent.max_iterations
                } else {
                    global.agent.max_iterations
                },
                max_tokens: project.agent.max_tokens.or(global.agent.max_tokens),
                custom_instructions: project
                    .agent
                    .custom_instructions
                    .clone()
                    .or_else(|| global.agent.custom_instructions.clone()),
                trust,
                retry: RetrySettings {
                    max_retries: if project.agent.retry.max_retries != default_max_retries() {
                        project.agent.retry.max_retries
                    } else {
                        global.agent.retry.max_retries
                    },
                    initial_backoff_ms: if project.agent.retry.initial_backoff_ms
                        != default_initial_backoff_ms()
                    {
                        project.agent.retry.initial_backoff_ms
                    } else {
                        global.agent.retry.initial_backoff_ms
                    },
                    max_backoff_ms: if project.agent.retry.max_backoff_ms != default_max_backoff_ms()
                    {
                        project.agent.retry.max_backoff_ms
                    } else {
                        global.agent.retry.max_backoff_ms
                    },
                },
                safety: SafetyConfig {
                    blocked_command_substrings: blocked,
                    approval_command_substrings: approval,
                    protected_write_names: protected,
                },
            },
            shell: ShellConfig {
                path: project.shell.path.clone().or_else(|| global.shell.path.clone()),
                env: {
                    let mut env = global.shell.env.clone();
                    env.extend(project.shell.env.clone());
                    env
                },
            },
            memory: MemoryConfig {
                auto_memory: project.memory.auto_memory && global.memory.auto_memory,
            },
        }
    }
}

fn merge_provider_entry(global: &ProviderEntry, project: &ProviderEntry) -> ProviderEntry {
    ProviderEntry {
        api_key: project.api_key.clone().or_else(|| global.api_key.clone()),
        base_url: project.base_url.clone().or_else(|| global.base_url.clone()),
        model: project.model.clone().or_else(|| global.model.clone()),
        max_tokens: project.max_tokens.or(global.max_tokens),
        temperature: project.temperature.or(global.temperature),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_literal_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.agent.max_iterations, 20);
        assert_eq!(cfg.agent.retry.max_retries, 3);
        assert_eq!(cfg.agent.retry.initial_backoff_ms, 1000);
        assert_eq!(cfg.agent.retry.max_backoff_ms, 30000);
        assert!(cfg
            .agent
            .safety
            .blocked_command_substrings
            .contains(&"rm -rf /".to_string()));
    }

    #[test]
    fn trust_mode_round_trips_through_str() {
        for mode in ["off", "limited", "autoedit", "full"] {
            let parsed: TrustMode = mode.parse().unwrap();
            assert_eq!(parsed.to_string(), mode);
        }
    }

    #[test]
    fn merge_unions_deny_lists_instead_of_replacing() {
        let mut global = Config::default();
        global.agent.trust.deny_tools = vec!["run_terminal_command".to_string()];
        let mut project = Config::default();
        project.agent.trust.deny_tools = vec!["write_file".to_string()];

        let merged = Config::merge(&global, &project);
        assert_eq!(
            merged.agent.trust.deny_tools,
            vec!["run_terminal_command".to_string(), "write_file".to_string()]
        );
    }

    #[test]
    fn merge_prefers_project_max_iterations_when_non_default() {
        let global = Config::default();
        let mut project = Config::default();
        project.agent.max_iterations = 40;

        let merged = Config::merge(&global, &project);
        assert_eq!(merged.agent.max_iterations, 40);
    }
}
