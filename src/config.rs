//! Configuration loading.
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! `config.json` in the config directory, then `VDAGENT_*` environment
//! variables. Command-line flags are applied on top by `main`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::constants::{
    CONNECT_RETRY_DELAY, DEFAULT_SOCKET_PATH, DEFAULT_VIRTIO_PORT_PATH, MAX_CONNECT_ATTEMPTS,
};

/// Agent and daemon configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Daemon rendezvous socket.
    pub socket_path: PathBuf,
    /// Virtio-serial port node; the agent will not start without it.
    pub virtio_port_path: PathBuf,
    /// Per-message tracing and debug-level logging.
    pub debug: bool,
    /// Consecutive failed connects before the agent gives up.
    pub max_connect_attempts: u32,
    /// Delay between connect attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            virtio_port_path: PathBuf::from(DEFAULT_VIRTIO_PORT_PATH),
            debug: false,
            max_connect_attempts: MAX_CONNECT_ATTEMPTS,
            retry_delay_ms: CONNECT_RETRY_DELAY.as_millis() as u64,
        }
    }
}

/// An environment override whose value could not be understood. The
/// setting keeps its previous value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredOverride {
    /// Variable name.
    pub key: &'static str,
    /// Value found in the environment.
    pub value: String,
}

impl fmt::Display for IgnoredOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl Config {
    /// Directory holding `config.json`.
    ///
    /// `VDAGENT_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("VDAGENT_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("vdagent"))
    }

    /// Load from the config directory, falling back to defaults when the
    /// file is absent, then apply environment overrides.
    ///
    /// A config file that exists but does not parse is an error. Overrides
    /// that could not be applied are returned so the caller can report them
    /// once logging is up.
    pub fn load() -> Result<(Self, Vec<IgnoredOverride>)> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        let ignored = config.apply_env_overrides();
        Ok((config, ignored))
    }

    /// Parse a specific config file. Missing fields take their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> Vec<IgnoredOverride> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `VDAGENT_*` overrides from `lookup`, returning the ones whose
    /// value did not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<IgnoredOverride>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ignored = Vec::new();
        if let Some(socket) = lookup("VDAGENT_SOCKET") {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(port) = lookup("VDAGENT_VIRTIO_PORT") {
            self.virtio_port_path = PathBuf::from(port);
        }
        if let Some(debug) = lookup("VDAGENT_DEBUG") {
            match debug.as_str() {
                "1" | "true" | "yes" => self.debug = true,
                "0" | "false" | "no" | "" => self.debug = false,
                other => ignored.push(IgnoredOverride {
                    key: "VDAGENT_DEBUG",
                    value: other.to_string(),
                }),
            }
        }
        ignored
    }

    /// Delay between connect attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_constants() {
        let config = Config::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.max_connect_attempts, 60);
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert!(!config.debug);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "socket_path": "/tmp/agent.sock", "debug": true }"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/agent.sock"));
        assert!(config.debug);
        assert_eq!(config.virtio_port_path, PathBuf::from(DEFAULT_VIRTIO_PORT_PATH));
        assert_eq!(config.max_connect_attempts, MAX_CONNECT_ATTEMPTS);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("VDAGENT_SOCKET", "/run/test.sock"),
            ("VDAGENT_VIRTIO_PORT", "/dev/null"),
            ("VDAGENT_DEBUG", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        let ignored = config.apply_overrides(|k| env.get(k).map(ToString::to_string));
        assert!(ignored.is_empty());
        assert_eq!(config.socket_path, PathBuf::from("/run/test.sock"));
        assert_eq!(config.virtio_port_path, PathBuf::from("/dev/null"));
        assert!(config.debug);

        let ignored = config.apply_overrides(|k| (k == "VDAGENT_DEBUG").then(|| "maybe".to_string()));
        assert!(config.debug, "unparseable value leaves the setting alone");
        assert_eq!(
            ignored,
            vec![IgnoredOverride {
                key: "VDAGENT_DEBUG",
                value: "maybe".to_string(),
            }]
        );
        assert_eq!(ignored[0].to_string(), "VDAGENT_DEBUG=maybe");
    }
}
