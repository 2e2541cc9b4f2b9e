use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::services::persistence::default_state_path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub webroot: PathBuf,
    pub state_path: Option<PathBuf>,
    pub save_interval_secs: u64,
    pub prune_interval_secs: u64,
    pub node_max_age_secs: u64,
    /// Shared secret consoles must present before editing nodes.
    pub secret: Option<String>,
    pub ssh: SshConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub private_key: PathBuf,
    pub port: u16,
    pub interface: Option<String>,
    pub timeout_secs: u64,
    /// Interval between keepalive rounds over pooled sessions.
    pub keepalive_secs: u64,
}

/// Scope whose aggregate statistics are kept and broadcast.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub site: String,
    pub domain: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "[::]:8080".to_string(),
            webroot: PathBuf::from("./webroot"),
            state_path: None,
            save_interval_secs: 3,
            prune_interval_secs: 180,
            node_max_age_secs: 600,
            secret: None,
            ssh: SshConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            private_key: PathBuf::from("~/.ssh/id_rsa"),
            port: 22,
            interface: None,
            timeout_secs: 10,
            keepalive_secs: 60,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            site: "global".to_string(),
            domain: "global".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let text =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        let cfg = toml::from_str(&text).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(cfg)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(default_state_path)
    }

    pub fn private_key(&self) -> PathBuf {
        expand_tilde(&self.ssh.private_key)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs.max(1))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    pub fn node_max_age(&self) -> Duration {
        Duration::from_secs(self.node_max_age_secs)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.ssh.keepalive_secs.max(1))
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
