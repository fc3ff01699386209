//! Default filesystem locations.
//!
//! Everything sigil persists lives under `$XDG_DATA_HOME/sigil` (default
//! `~/.local/share/sigil`); the config file lives under
//! `$XDG_CONFIG_HOME/sigil` (default `~/.config/sigil`).

use std::path::{Path, PathBuf};

const APP: &str = "sigil";

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(fallback)))
        .unwrap_or_else(|| {
            tracing::warn!("neither {var} nor HOME are set; using current directory");
            PathBuf::from(".")
        })
        .join(APP)
}

/// `$XDG_DATA_HOME/sigil`
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

/// `$XDG_CONFIG_HOME/sigil`
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn default_usage_log() -> PathBuf {
    data_dir().join("usage.log")
}

pub fn default_key_dir() -> PathBuf {
    data_dir().join("keys")
}

/// Expand a leading `~/` to `$HOME`.  Other paths are returned unchanged.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Where the agent listens when the config does not say otherwise.
#[cfg(unix)]
pub fn default_socket_path() -> PathBuf {
    data_dir().join("agent.sock")
}

/// Named pipes live in a flat namespace, so the user name keeps them apart.
#[cfg(windows)]
pub fn default_socket_path() -> PathBuf {
    let user = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    let safe: String = user
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    PathBuf::from(format!(r"\\.\pipe\sigil-agent-{safe}"))
}
