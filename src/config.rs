//! Server configuration (CLI flags, env vars and an optional config.toml)
//!
//! Precedence: command line / environment > config file > built-in defaults.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_ROOT: &str = "user";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),
    #[error("Failed to read config: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "codeyantra-core",
    version,
    about = "Shared workspace server: file API, live change feed and one shared shell"
)]
pub struct Cli {
    /// Path to a TOML config file (default: ~/.codeyantra/config.toml)
    #[arg(long, env = "CODEYANTRA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Interface to bind
    #[arg(long, env = "CODEYANTRA_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "CODEYANTRA_PORT")]
    pub port: Option<u16>,

    /// Workspace directory exposed to clients; created if missing
    #[arg(long, env = "CODEYANTRA_ROOT")]
    pub root: Option<PathBuf>,

    /// Shell program for the shared terminal
    #[arg(long, env = "CODEYANTRA_SHELL")]
    pub shell: Option<String>,

    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

/// Effective server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub root: PathBuf,
    pub shell: Option<String>,
    pub log_format: LogFormat,
    pub watch: WatchSection,
    pub hub: HubSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            root: PathBuf::from(DEFAULT_ROOT),
            shell: None,
            log_format: LogFormat::default(),
            watch: WatchSection::default(),
            hub: HubSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    /// Path segment names whose subtrees are never reported
    pub ignore: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    /// Outbound events buffered per client before it is dropped as lagging
    pub client_queue: usize,
}

impl Default for HubSection {
    fn default() -> Self {
        Self { client_queue: 1024 }
    }
}

impl ServerConfig {
    /// Resolve the effective config for a parsed command line
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.display().to_string()));
                }
                Self::from_file(path)?
            }
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_cli(cli);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(root) = &cli.root {
            self.root = root.clone();
        }
        if let Some(shell) = &cli.shell {
            self.shell = Some(shell.clone());
        }
        if let Some(format) = cli.log_format {
            self.log_format = format;
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".codeyantra").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.root, PathBuf::from(DEFAULT_ROOT));
        assert!(config.watch.ignore.is_empty());
        assert_eq!(config.hub.client_queue, 1024);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_partial_file() {
        let config = ServerConfig::from_toml_str(
            r#"
            port = 9100
            log_format = "json"

            [watch]
            ignore = ["node_modules"]
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.watch.ignore, vec!["node_modules".to_string()]);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            ServerConfig::from_toml_str("port = \"nine\""),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = ServerConfig::from_toml_str("port = 9100\nhost = \"0.0.0.0\"").unwrap();
        let cli = Cli {
            port: Some(9200),
            root: Some(PathBuf::from("/srv/ws")),
            ..Default::default()
        };
        config.apply_cli(&cli);
        assert_eq!(config.port, 9200);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.root, PathBuf::from("/srv/ws"));
        assert_eq!(config.bind_addr(), "0.0.0.0:9200");
    }

    #[test]
    fn test_missing_explicit_config() {
        let cli = Cli {
            config: Some(PathBuf::from("/definitely/not/here.toml")),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::load(&cli),
            Err(ConfigError::NotFound(_))
        ));
    }
}
