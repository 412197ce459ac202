use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::types::DEFAULT_EDGE_TYPE;

/// Top-level agentflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub user: UserConfig,
    #[serde(default)]
    pub editor: EditorConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Remote workflow store / execution engine endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token forwarded on every request, if set.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Owner id used for workflow listing, creation and execution.
    #[serde(default = "default_user_id")]
    pub id: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            id: default_user_id(),
        }
    }
}

/// Edge policy of the graph editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorConfig {
    /// Allow an edge whose source and target are the same node.
    #[serde(default)]
    pub allow_self_loops: bool,
    /// Allow a second edge with the same source, target and type.
    #[serde(default)]
    pub allow_duplicate_edges: bool,
    #[serde(default = "default_edge_type")]
    pub default_edge_type: String,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            allow_self_loops: false,
            allow_duplicate_edges: false,
            default_edge_type: default_edge_type(),
        }
    }
}

/// Execution polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive failed polls before a poll loop gives up (0 = never).
    #[serde(default)]
    pub max_consecutive_failures: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_consecutive_failures: 0,
        }
    }
}

impl ExecutionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

fn default_base_url() -> String { "http://localhost:8000/api/v1".to_string() }
fn default_timeout_secs() -> u64 { 30 }
fn default_user_id() -> String { "local-user".to_string() }
fn default_edge_type() -> String { DEFAULT_EDGE_TYPE.to_string() }
fn default_poll_interval_secs() -> u64 { 3 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// `~/.agentflow/config.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs_home().map(|h| h.join(".agentflow").join("config.toml"))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_AGENTFLOW_VAR", "hello");
        let result = expand_env_vars("token = \"${TEST_AGENTFLOW_VAR}\"");
        assert_eq!(result, "token = \"hello\"");
        std::env::remove_var("TEST_AGENTFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("token = \"${NONEXISTENT_AGENTFLOW_VAR}\"");
        assert_eq!(result, "token = \"${NONEXISTENT_AGENTFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.api.base_url, "http://localhost:8000/api/v1");
        assert_eq!(config.api.timeout_secs, 30);
        assert!(config.api.token.is_none());
        assert!(!config.editor.allow_self_loops);
        assert!(!config.editor.allow_duplicate_edges);
        assert_eq!(config.editor.default_edge_type, "default");
        assert_eq!(config.execution.poll_interval_secs, 3);
        assert_eq!(config.execution.max_consecutive_failures, 0);
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[user]
id = "u-42"

[execution]
poll_interval_secs = 5
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.user.id, "u-42");
        assert_eq!(config.execution.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.api.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_poll_interval_clamped() {
        let config = ExecutionConfig {
            poll_interval_secs: 0,
            max_consecutive_failures: 0,
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
