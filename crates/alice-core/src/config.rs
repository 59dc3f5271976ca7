//! Configuration management for Alice.
//!
//! Loads configuration from ${ALICE_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::stream::{MarkerPair, MarkerTable};

/// What to do with a partially streamed reply when its turn is interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterruptPolicy {
    /// Drop the partial reply (default)
    #[default]
    Discard,
    /// Append the partial reply as an assistant message
    Retain,
}

/// Chat completions endpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

/// Turn orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub interrupt_sentinel: String,
    pub interrupt_policy: InterruptPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            interrupt_sentinel: "__INTERRUPT__".to_string(),
            interrupt_policy: InterruptPolicy::Discard,
        }
    }
}

/// Sandbox executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_secs: u64,
    pub python: Option<String>,
    pub extension_paths: Vec<String>,
    pub extra_denylist: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            python: None,
            extension_paths: vec!["skills".to_string()],
            extra_denylist: Vec::new(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// System prompt sources, relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub prompt_path: String,
    pub memory_paths: Vec<String>,
    pub skills_dir: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            prompt_path: "prompts/alice.md".to_string(),
            memory_paths: vec![
                "memory/alice_memory.md".to_string(),
                "memory/short_term_memory.md".to_string(),
            ],
            skills_dir: "skills".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,

    /// Max tokens per reply (unset lets the server decide)
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Request the auxiliary reasoning channel
    #[serde(default = "default_enable_thinking")]
    pub enable_thinking: bool,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub context: ContextConfig,

    /// Marker pairs; empty means the built-in table.
    #[serde(default)]
    pub markers: Vec<MarkerPair>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: None,
            enable_thinking: true,
            provider: ProviderConfig::default(),
            agent: AgentConfig::default(),
            sandbox: SandboxConfig::default(),
            context: ContextConfig::default(),
            markers: Vec::new(),
        }
    }
}

pub mod paths {
    //! Path resolution for Alice configuration.
    //!
    //! ALICE_HOME resolution order:
    //! 1. ALICE_HOME environment variable (if set)
    //! 2. ~/.config/alice (default)

    use std::path::PathBuf;

    /// Returns the Alice home directory.
    pub fn alice_home() -> PathBuf {
        if let Ok(home) = std::env::var("ALICE_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .map(|h| h.join(".config").join("alice"))
            .expect("Could not determine home directory")
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        alice_home().join("config.toml")
    }
}

fn default_model() -> String {
    Config::DEFAULT_MODEL.to_string()
}

fn default_enable_thinking() -> bool {
    true
}

fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

impl Config {
    const DEFAULT_MODEL: &str = "deepseek-ai/DeepSeek-V3.2";
    const MODEL_ENV: &str = "ALICE_MODEL";

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Writes the commented default template to `path`.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, default_config_template())
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }

    /// Resolves the model with precedence: CLI flag > `ALICE_MODEL` > config.
    pub fn resolve_model(&self, cli_model: Option<&str>) -> String {
        let env_model = std::env::var(Self::MODEL_ENV).ok();
        [cli_model, env_model.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|m| !m.is_empty())
            .map_or_else(|| self.model.clone(), str::to_string)
    }

    /// Builds the shared marker table, falling back to the built-in pairs.
    ///
    /// # Errors
    /// Returns an error if a configured marker is empty.
    pub fn marker_table(&self) -> Result<MarkerTable> {
        if self.markers.is_empty() {
            return Ok(MarkerTable::default());
        }
        MarkerTable::new(self.markers.clone()).context("Invalid [[markers]] configuration")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("nonexistent.toml");

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.model, "deepseek-ai/DeepSeek-V3.2");
        assert_eq!(config.max_tokens, None);
        assert!(config.enable_thinking);
        assert_eq!(config.agent.max_iterations, 20);
        assert_eq!(config.agent.interrupt_sentinel, "__INTERRUPT__");
        assert_eq!(config.sandbox.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(
            &config_path,
            "model = \"qwen\"\n[agent]\ninterrupt_policy = \"retain\"\n",
        )
        .unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.model, "qwen");
        assert_eq!(config.agent.interrupt_policy, InterruptPolicy::Retain);
        assert_eq!(config.agent.max_iterations, 20);
        assert_eq!(config.context.prompt_path, "prompts/alice.md");
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "model = [").unwrap();

        let err = Config::load_from(&config_path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_init_creates_config_with_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("subdir").join("config.toml");

        Config::init(&config_path).unwrap();

        assert!(config_path.exists());
        let contents = fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains("deepseek-ai/DeepSeek-V3.2"));
        assert!(contents.contains("# max_tokens ="));
    }

    #[test]
    fn test_init_fails_if_exists() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(&config_path, "").unwrap();

        let result = Config::init(&config_path);
        assert!(result.is_err());
    }

    #[test]
    fn test_template_parses_to_defaults() {
        let config: Config = toml::from_str(default_config_template()).unwrap();
        let defaults = Config::default();
        assert_eq!(config.model, defaults.model);
        assert_eq!(config.agent.max_iterations, defaults.agent.max_iterations);
        assert_eq!(config.sandbox.timeout_secs, defaults.sandbox.timeout_secs);
        assert_eq!(config.marker_table().unwrap(), MarkerTable::default());
    }

    #[test]
    fn test_cli_model_wins() {
        let config = Config::default();
        assert_eq!(config.resolve_model(Some("glm-4")), "glm-4");
    }

    #[test]
    fn test_empty_markers_use_builtin_table() {
        let config = Config::default();
        assert_eq!(config.marker_table().unwrap(), MarkerTable::default());
    }
}
