//! Configuration file handling for pushwire-cli

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pushwire_client::{ClientConfig, Credentials, Endpoint, RebindPolicy, SessionOptions};
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER: &str = "http://localhost:8080";
const DEFAULT_ADAPTER_SET: &str = "DEFAULT";

/// Configuration for the CLI tool
///
/// ```toml
/// server = "https://push.example.com"
/// adapter_set = "QUOTES"
/// user = "alice"
///
/// [session]
/// liveness_timeout_ms = 20000
///
/// [session.rebind]
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default server URL
    pub server: Option<String>,
    /// Default adapter set
    pub adapter_set: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Default output format
    pub output: Option<String>,
    /// Disable colored output
    pub no_color: Option<bool>,
    /// Session engine tuning
    #[serde(default)]
    pub session: SessionSection,
}

/// `[session]` table; unset keys keep the engine defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionSection {
    #[serde(default)]
    pub options: SessionOptions,
    pub autorebind: Option<bool>,
    pub rebind: Option<RebindPolicy>,
    pub liveness_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub control_timeout_ms: Option<u64>,
    pub max_line_length: Option<usize>,
}

/// Values given on the command line; they win over the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides<'a> {
    pub server: Option<&'a str>,
    pub adapter_set: Option<&'a str>,
    pub user: Option<&'a str>,
    pub password: Option<&'a str>,
    pub output: Option<&'a str>,
    pub no_color: bool,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("pushwire-cli");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(&self, args: &Overrides<'_>) -> Result<MergedConfig> {
        let server = args
            .server
            .map(String::from)
            .or_else(|| self.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        let endpoint: Endpoint = server.parse().context("Invalid server address")?;
        let adapter_set = args
            .adapter_set
            .map(String::from)
            .or_else(|| self.adapter_set.clone())
            .unwrap_or_else(|| DEFAULT_ADAPTER_SET.to_string());

        let mut client = ClientConfig::new(endpoint, adapter_set)
            .with_options(self.session.options.clone());
        if let Some(autorebind) = self.session.autorebind {
            client = client.with_autorebind(autorebind);
        }
        if let Some(policy) = &self.session.rebind {
            client = client.with_rebind_policy(policy.clone());
        }
        if let Some(ms) = self.session.liveness_timeout_ms {
            client.liveness_timeout_ms = ms;
        }
        if let Some(ms) = self.session.connect_timeout_ms {
            client.connect_timeout_ms = ms;
        }
        if let Some(ms) = self.session.control_timeout_ms {
            client.control_timeout_ms = ms;
        }
        if let Some(max) = self.session.max_line_length {
            client.max_line_length = max;
        }
        client.validate().context("Invalid session configuration")?;

        let user = args.user.map(String::from).or_else(|| self.user.clone());
        let password = args
            .password
            .map(String::from)
            .or_else(|| self.password.clone());

        Ok(MergedConfig {
            client,
            credentials: Credentials { user, password },
            output: args
                .output
                .map(String::from)
                .or_else(|| self.output.clone())
                .unwrap_or_else(|| "table".to_string()),
            no_color: args.no_color || self.no_color.unwrap_or(false),
        })
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub client: ClientConfig,
    pub credentials: Credentials,
    pub output: String,
    pub no_color: bool,
}
