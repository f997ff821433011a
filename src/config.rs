use crate::assets::DEFAULT_WORKER_PORTS;
use anyhow::{Context, Result};
use local_ip_address::local_ip;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            start: *DEFAULT_WORKER_PORTS.start(),
            end: *DEFAULT_WORKER_PORTS.end(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    pub name: String,
    /// Known up front for workers whose feed server is already listening
    #[serde(default)]
    pub feed_server_port: Option<u16>,
    /// Ports the manager may hand out on this worker
    #[serde(default)]
    pub ports: PortRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Address the manager advertises; defaults to the first local IPv4
    #[serde(default)]
    pub host: Option<Ipv4Addr>,
    #[serde(default)]
    pub planet: Option<PathBuf>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub save_on_exit: bool,
}

impl Config {
    pub fn new() -> Self {
        Config {
            host: None,
            planet: None,
            workers: Vec::new(),
            save_on_exit: false,
        }
        .with_local_host()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config.with_local_host())
    }

    fn with_local_host(mut self) -> Self {
        if self.host.is_none() {
            self.host = local_ip().ok().and_then(|ip| {
                if let IpAddr::V4(ip) = ip {
                    Some(ip)
                } else {
                    None
                }
            });
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
