use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("key entry '{0}' appears more than once")]
    DuplicateKey(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub key: Vec<KeyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Lock the daemon's pages into RAM so keys never reach swap.
    #[serde(default = "default_true")]
    pub lock_memory: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            lock_memory: true,
        }
    }
}

impl AgentConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(paths::default_socket_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Confirmation program.  Falls back to `$SSH_ASKPASS` when unset.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_grant_ttl_secs")]
    pub grant_ttl_secs: u64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            command: None,
            grant_ttl_secs: default_grant_ttl_secs(),
            timeout_secs: None,
        }
    }
}

impl ApprovalConfig {
    pub fn grant_ttl(&self) -> Duration {
        Duration::from_secs(self.grant_ttl_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// The configured command, else `$SSH_ASKPASS`.
    pub fn resolve_command(&self) -> Option<String> {
        self.command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| std::env::var("SSH_ASKPASS").ok().filter(|c| !c.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl AuditConfig {
    pub fn path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(paths::default_usage_log)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl SourceConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(paths::default_key_dir)
    }
}

/// A key loaded into the agent when the daemon starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub id: String,
    pub file: PathBuf,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl KeyEntry {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Parse config text and check cross-entry constraints.
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let mut seen = std::collections::HashSet::new();
        for entry in &config.key {
            if !seen.insert(entry.id.as_str()) {
                return Err(ConfigError::DuplicateKey(entry.id.clone()));
            }
        }
        Ok(config)
    }

    /// Load the config at `path`.  A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        warn_if_exposed(path);
        Self::parse(&text, path)
    }
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::MetadataExt as _;
    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = %format!("{:o}", mode & 0o777),
                    "config file is readable by group or others; recommend chmod 600"
                );
            }
        }
        Err(e) => tracing::warn!("could not check config file permissions: {e}"),
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_path: &Path) {}

fn default_true() -> bool {
    true
}

fn default_grant_ttl_secs() -> u64 {
    300
}
