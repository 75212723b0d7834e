//! Configuration: `$FSAGENT_HOME/config.toml` plus environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::mcp::{ChannelOptions, ServerCommand};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const DEFAULT_SERVER_COMMAND: &str = "npx";
const DEFAULT_SERVER_PACKAGE: &str = "@modelcontextprotocol/server-filesystem";

/// Top-level configuration, deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the tool server is restricted to.
    pub root: Option<String>,
    pub model: Option<String>,
    pub server: ServerSettings,
    pub gemini: GeminiSettings,
}

/// The `[server]` table: how the tool server is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub command: String,
    pub package: String,
    /// Pass `-y` so npx never prompts for installation.
    pub auto_confirm: bool,
    pub handshake_timeout_secs: u64,
    pub invoke_timeout_secs: u64,
    pub close_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_SERVER_COMMAND.to_string(),
            package: DEFAULT_SERVER_PACKAGE.to_string(),
            auto_confirm: true,
            handshake_timeout_secs: 20,
            invoke_timeout_secs: 60,
            close_grace_secs: 3,
        }
    }
}

/// The `[gemini]` table: credentials and endpoint overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Config {
    /// Loads `config.toml` from the home directory, or defaults when the
    /// file does not exist.
    ///
    /// # Errors
    /// Fails when the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = home_dir()?.join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn model(&self) -> String {
        self.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    /// Resolves the root restriction: CLI flag, then `FSAGENT_ROOT`, then
    /// the config file.
    ///
    /// # Errors
    /// Fails when no source provides a root.
    pub fn resolve_root(&self, flag: Option<String>) -> Result<String> {
        if let Some(root) = flag {
            return Ok(root);
        }
        if let Ok(root) = std::env::var("FSAGENT_ROOT")
            && !root.is_empty()
        {
            return Ok(root);
        }
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        bail!("FSAGENT_ROOT is not defined")
    }

    /// The full launch command for the tool server, root appended last.
    pub fn server_command(&self, root: &str) -> ServerCommand {
        let mut args = Vec::new();
        if self.server.auto_confirm {
            args.push("-y".to_string());
        }
        args.push(self.server.package.clone());
        args.push(root.to_string());
        ServerCommand {
            program: self.server.command.clone(),
            args,
        }
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            invoke_timeout: Duration::from_secs(self.server.invoke_timeout_secs),
            close_grace: Duration::from_secs(self.server.close_grace_secs),
        }
    }
}

/// `$FSAGENT_HOME`, or `~/.fsagent` when unset.
///
/// # Errors
/// Fails when neither `FSAGENT_HOME` nor `HOME` is set.
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("FSAGENT_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    let home = std::env::var("HOME").context("neither FSAGENT_HOME nor HOME is set")?;
    Ok(PathBuf::from(home).join(".fsagent"))
}

/// Resolves an API key: config value first, then the environment.
///
/// # Errors
/// Fails when neither source has a non-empty value.
pub fn resolve_api_key(
    config_value: Option<&str>,
    env_var: &str,
    provider: &str,
) -> Result<String> {
    if let Some(key) = config_value
        && !key.is_empty()
    {
        return Ok(key.to_string());
    }
    match std::env::var(env_var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => bail!("no API key for {provider}: set {env_var} or add it to config.toml"),
    }
}

/// Resolves a base URL: config value, then the environment, then the
/// default. The value must parse as a URL; a trailing slash is trimmed.
///
/// # Errors
/// Fails when the chosen value is not a valid URL.
pub fn resolve_base_url(
    config_value: Option<&str>,
    env_var: &str,
    default: &str,
    label: &str,
) -> Result<String> {
    let raw = match config_value {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => match std::env::var(env_var) {
            Ok(url) if !url.is_empty() => url,
            _ => default.to_string(),
        },
    };
    Url::parse(&raw).with_context(|| format!("invalid {label} base URL: {raw}"))?;
    Ok(raw.trim_end_matches('/').to_string())
}
