// src/config/chime.rs
//! Engine configuration from `config/chime.toml`.
//!
//! ```toml
//! [agent]
//! id = "agent"
//! display_name = "Assistant"
//! mention_aliases = ["@ai", "@assistant"]
//!
//! [window]
//! max_messages = 50
//!
//! [rules]
//! overrides_path = "config/rules.json"
//! disabled = ["activity-summary"]
//! ```
//!
//! Resolution: `$CHIME_CONFIG_PATH` (must exist) → `config/chime.toml` →
//! built-in defaults. `CHIME_AGENT_ID` and `CHIME_WINDOW_SIZE` override the
//! file afterwards.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::rules::DEFAULT_RULES_PATH;
use crate::window::DEFAULT_WINDOW_SIZE;

pub const DEFAULT_CONFIG_PATH: &str = "config/chime.toml";
pub const ENV_CONFIG_PATH: &str = "CHIME_CONFIG_PATH";
pub const ENV_AGENT_ID: &str = "CHIME_AGENT_ID";
pub const ENV_WINDOW_SIZE: &str = "CHIME_WINDOW_SIZE";

fn default_agent_id() -> String {
    "agent".to_string()
}
fn default_display_name() -> String {
    "Assistant".to_string()
}
fn default_aliases() -> Vec<String> {
    vec!["@ai".to_string(), "@assistant".to_string()]
}
fn default_max_messages() -> usize {
    DEFAULT_WINDOW_SIZE
}
fn default_overrides_path() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_PATH)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Author id the agent posts under. Messages from it are never evaluated.
    #[serde(default = "default_agent_id")]
    pub id: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Tokens that address the agent directly (case-insensitive).
    #[serde(default = "default_aliases")]
    pub mention_aliases: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            display_name: default_display_name(),
            mention_aliases: default_aliases(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSection {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesSection {
    #[serde(default = "default_overrides_path")]
    pub overrides_path: PathBuf,
    /// Built-in rule ids to switch off.
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            overrides_path: default_overrides_path(),
            disabled: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChimeConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub window: WindowSection,
    #[serde(default)]
    pub rules: RulesSection,
}

impl ChimeConfig {
    /// Load using env var + fallbacks, then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from_file(&pb)?
        } else {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Self::load_from_file(&default)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading chime config from {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing chime config from {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: ChimeConfig = toml::from_str(s)?;
        cfg.sanitize();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var(ENV_AGENT_ID) {
            let id = id.trim();
            if !id.is_empty() {
                self.agent.id = id.to_string();
            }
        }
        if let Some(n) = std::env::var(ENV_WINDOW_SIZE)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.window.max_messages = n;
        }
        self.sanitize();
    }

    fn sanitize(&mut self) {
        if self.window.max_messages == 0 {
            self.window.max_messages = default_max_messages();
        }
        self.agent.mention_aliases = self
            .agent
            .mention_aliases
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if self.agent.id.trim().is_empty() {
            self.agent.id = default_agent_id();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = ChimeConfig::from_toml_str(
            r#"
[agent]
id = "bot-7"

[rules]
disabled = ["urgency-detector"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.agent.id, "bot-7");
        assert_eq!(cfg.agent.mention_aliases, default_aliases());
        assert_eq!(cfg.window.max_messages, DEFAULT_WINDOW_SIZE);
        assert_eq!(cfg.rules.disabled, vec!["urgency-detector".to_string()]);
        assert_eq!(cfg.rules.overrides_path, PathBuf::from(DEFAULT_RULES_PATH));
    }

    #[test]
    fn zero_window_and_blank_aliases_are_cleaned() {
        let cfg = ChimeConfig::from_toml_str(
            r#"
[agent]
mention_aliases = [" @bot ", ""]
[window]
max_messages = 0
"#,
        )
        .unwrap();
        assert_eq!(cfg.agent.mention_aliases, vec!["@bot".to_string()]);
        assert_eq!(cfg.window.max_messages, DEFAULT_WINDOW_SIZE);
    }

    #[serial_test::serial]
    #[test]
    fn env_path_then_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("chime.toml");
        fs::write(&p, "[window]\nmax_messages = 20\n").unwrap();

        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        env::set_var(ENV_WINDOW_SIZE, "35");
        env::set_var(ENV_AGENT_ID, "bot-x");
        let cfg = ChimeConfig::load().unwrap();
        assert_eq!(cfg.window.max_messages, 35);
        assert_eq!(cfg.agent.id, "bot-x");

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(ChimeConfig::load().is_err());

        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var(ENV_WINDOW_SIZE);
        env::remove_var(ENV_AGENT_ID);
    }
}
