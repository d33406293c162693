//! Server configuration file format.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("trust-store registration is only available in tls mode")]
    RegisterRequiresTls,
}

/// Whether the server speaks plain HTTP or HTTPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServeMode {
    #[default]
    #[serde(alias = "http")]
    #[value(alias = "http")]
    Plain,
    #[serde(alias = "https")]
    #[value(alias = "https")]
    Tls,
}

impl ServeMode {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Plain => 80,
            Self::Tls => 443,
        }
    }

    /// URL scheme for log messages.
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Plain => "http",
            Self::Tls => "https",
        }
    }
}

/// Server configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub mode: ServeMode,
    /// Port to listen on. Defaults to 80 in plain mode and 443 in tls mode.
    pub port: Option<u16>,
    pub bind: IpAddr,
    /// Directory served at `/`.
    pub root: PathBuf,
    /// Install the generated certificate into the host trust store.
    pub register: bool,
    /// Send COOP/COEP headers so browsers enable `SharedArrayBuffer`.
    pub cross_origin_isolation: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: ServeMode::Plain,
            port: None,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            root: PathBuf::from("."),
            register: false,
            cross_origin_isolation: true,
        }
    }
}

impl ServerConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Checks settings that are only meaningful together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.register && self.mode != ServeMode::Tls {
            return Err(ConfigError::RegisterRequiresTls);
        }
        Ok(())
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.mode.default_port())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.effective_port())
    }
}
