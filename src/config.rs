//! TOML configuration.
//!
//! A single file configures the database, the HTTP bind address, the LLM
//! backend used by the dispatcher, and pagination limits. See
//! `config/aictx.example.toml` for a complete example.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// LLM backend settings for the generation dispatcher.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for transport failures, 429 and 5xx. Off unless set.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn base_url(&self) -> &str {
        self.url.as_deref().unwrap_or("http://localhost:11434")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaginationConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_page_size() -> u32 {
    100
}
fn default_max_page_size() -> u32 {
    1000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    let pagination = &config.pagination;
    if pagination.default_page_size == 0 {
        anyhow::bail!("pagination.default_page_size must be >= 1");
    }
    if pagination.max_page_size < pagination.default_page_size {
        anyhow::bail!("pagination.max_page_size must be >= pagination.default_page_size");
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "ollama" => {
            if config.llm.model.is_none() {
                anyhow::bail!("llm.model must be specified when provider is 'ollama'");
            }
            url::Url::parse(config.llm.base_url())
                .with_context(|| format!("llm.url is not a valid URL: {}", config.llm.base_url()))?;
        }
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:8080");
        assert_eq!(cfg.llm.provider, "disabled");
        assert!(!cfg.llm.is_enabled());
        assert_eq!(cfg.pagination.default_page_size, 100);
        assert_eq!(cfg.db.max_connections, 5);
    }

    #[test]
    fn test_ollama_requires_model() {
        let err = parse("[db]\npath = \"x\"\n[llm]\nprovider = \"ollama\"\n").unwrap_err();
        assert!(err.to_string().contains("llm.model"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[db]\npath = \"x\"\n[llm]\nprovider = \"gpt\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown llm provider"));
    }

    #[test]
    fn test_ollama_bad_url_rejected() {
        let err = parse(
            "[db]\npath = \"x\"\n[llm]\nprovider = \"ollama\"\nmodel = \"llama3\"\nurl = \"::nope\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("llm.url"));
    }

    #[test]
    fn test_page_size_bounds() {
        let err = parse(
            "[db]\npath = \"x\"\n[pagination]\ndefault_page_size = 50\nmax_page_size = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_page_size"));
    }
}
