//! Configuration & CLI (SPEC_FULL §10.3). The core (everything in
//! [`crate::control`], [`crate::registry`], [`crate::proxy_tcp`],
//! [`crate::proxy_udp`]) only ever sees the resulting [`BrokerConfig`] — it
//! never touches `std::env` or `clap` itself, so it stays unit-testable
//! without a CLI layer.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use tunnel_protocol::allowlist::PortAllowList;

use crate::error::ConfigError;

/// Fully resolved broker configuration (spec §6 table).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub server_bind: String,
    pub server_port: u16,
    pub allow_ports: PortAllowList,
    pub token: String,
    pub conn_timeout: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            server_bind: "0.0.0.0".into(),
            server_port: 6000,
            allow_ports: PortAllowList::allow_all(),
            token: String::new(),
            conn_timeout: 3600,
        }
    }
}

/// `--config file.toml` deserializes into this; every field optional so a
/// partial file only overrides what it mentions.
#[derive(Debug, Default, Deserialize)]
struct BrokerConfigFile {
    server_bind: Option<String>,
    server_port: Option<u16>,
    allow_ports: Option<String>,
    token: Option<String>,
    conn_timeout: Option<u64>,
}

/// Thin CLI front-end (SPEC_FULL §10.3 names this out of the core's scope;
/// it exists only to produce a [`BrokerConfig`]).
#[derive(Debug, Parser)]
#[command(name = "tunnel-broker", about = "Publicly-reachable side of the reverse tunnel")]
pub struct Cli {
    /// Load defaults from a TOML file; CLI flags explicitly passed override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub bind: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Comma-separated list of ports/ranges, e.g. "1-1024,8080,9000-9100".
    #[arg(long = "allow-ports")]
    pub allow_ports: Option<String>,

    #[arg(long)]
    pub token: Option<String>,

    #[arg(long = "conn-timeout")]
    pub conn_timeout: Option<u64>,
}

impl Cli {
    pub fn resolve(self) -> Result<BrokerConfig, ConfigError> {
        let file = match &self.config {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
                        path: path.display().to_string(),
                        source,
                    })?;
                toml::from_str::<BrokerConfigFile>(&text).map_err(|source| {
                    ConfigError::ParseFile {
                        path: path.display().to_string(),
                        source,
                    }
                })?
            }
            None => BrokerConfigFile::default(),
        };

        let defaults = BrokerConfig::default();

        let server_bind = self
            .bind
            .or(file.server_bind)
            .unwrap_or(defaults.server_bind);
        let server_port = self.port.or(file.server_port).unwrap_or(defaults.server_port);
        let allow_ports = match self.allow_ports.or(file.allow_ports) {
            Some(spec) => PortAllowList::parse(&spec)?,
            None => defaults.allow_ports,
        };
        let token = self.token.or(file.token).unwrap_or(defaults.token);
        let conn_timeout = self
            .conn_timeout
            .or(file.conn_timeout)
            .unwrap_or(defaults.conn_timeout);

        if server_port == 0 {
            return Err(ConfigError::MissingPort);
        }

        Ok(BrokerConfig {
            server_bind,
            server_port,
            allow_ports,
            token,
            conn_timeout,
        })
    }
}
