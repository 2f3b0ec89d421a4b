//! YAML configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub listener: ListenerConfig,
    pub backend: BackendConfig,
    pub pool: PoolConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub address: String,
    pub max_connections: usize,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub primary: BackendNode,
    #[serde(default)]
    pub replicas: Vec<BackendNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendNode {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub primary_size: usize,
    pub replica_size: usize,
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address of the Prometheus endpoint; the endpoint is disabled when unset.
    #[serde(default)]
    pub address: Option<String>,
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Config {
    /// Load and validate a configuration file. Any failure here is fatal at
    /// startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("read {}: {err}", path.display())))?;

        let config: Config =
            serde_yaml::from_str(&raw).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listener.address.is_empty() {
            return Err(Error::Config("listener.address must be set".into()));
        }
        if self.listener.max_connections == 0 {
            return Err(Error::Config("listener.max_connections must be positive".into()));
        }
        if self.backend.primary.address.is_empty() {
            return Err(Error::Config("backend.primary.address must be set".into()));
        }
        if self.backend.replicas.iter().any(|r| r.address.is_empty()) {
            return Err(Error::Config("backend.replicas entries must have an address".into()));
        }
        if self.pool.primary_size == 0 || self.pool.replica_size == 0 {
            return Err(Error::Config("pool sizes must be positive".into()));
        }
        Ok(())
    }

    pub fn replica_addresses(&self) -> Vec<String> {
        self.backend
            .replicas
            .iter()
            .map(|replica| replica.address.clone())
            .collect()
    }
}

impl ListenerConfig {
    /// The address to bind. A bare `":5432"` means every interface.
    pub fn listen_addr(&self) -> String {
        normalize_addr(&self.address)
    }
}

/// Expand the `":port"` shorthand into a bindable address.
pub fn normalize_addr(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_owned()
    }
}
