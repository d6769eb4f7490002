//! Configuration & CLI (SPEC_FULL §10.3). Mirrors `tunnel-broker`'s
//! `config.rs`: the core ([`crate::control`], [`crate::tunnel_tcp`],
//! [`crate::tunnel_udp`]) only ever sees a resolved [`AgentConfig`] and never
//! touches `std::env` or `clap` itself.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use serde::Deserialize;

use tunnel_protocol::message::Network;
use tunnel_protocol::Service;

use crate::error::ConfigError;

/// Fully resolved agent configuration (spec §6 table).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_host: String,
    pub server_port: u16,
    pub services: Vec<Service>,
    pub token: String,
    pub keep_alive_period: u64,
    pub keep_alive_max_failed: u32,
    pub conn_timeout: u64,
}

impl AgentConfig {
    pub fn server_addr(&self) -> String {
        tunnel_protocol::addr::join_host_port(&self.server_host, &self.server_port.to_string())
    }
}

const DEFAULT_KEEP_ALIVE_PERIOD: u64 = 2;
const DEFAULT_KEEP_ALIVE_MAX_FAILED: u32 = 3;
const DEFAULT_CONN_TIMEOUT: u64 = 3600;

/// One `--service network:local_addr:proxy_port` flag value, or one
/// `[[services]]` TOML table entry. `local_addr` is itself a `host:port`
/// pair, so the middle field can't be taken by splitting at a fixed count —
/// peel `network` off the front and `proxy_port` off the back instead.
fn parse_service_spec(spec: &str) -> Result<Service, ConfigError> {
    let (network, rest) = spec
        .split_once(':')
        .ok_or_else(|| ConfigError::BadServiceSpec(spec.to_string()))?;
    let (local_addr, proxy_port) = rest
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::BadServiceSpec(spec.to_string()))?;
    if local_addr.is_empty() || proxy_port.is_empty() || !local_addr.contains(':') {
        return Err(ConfigError::BadServiceSpec(spec.to_string()));
    }
    Ok(Service {
        network: Network::from_str(network)?,
        local_addr: local_addr.to_string(),
        proxy_port: proxy_port.to_string(),
    })
}

/// `--config file.toml` deserializes into this; every field optional so a
/// partial file only overrides what it mentions.
#[derive(Debug, Default, Deserialize)]
struct AgentConfigFile {
    server_host: Option<String>,
    server_port: Option<u16>,
    services: Option<Vec<ServiceFile>>,
    token: Option<String>,
    keep_alive_period: Option<u64>,
    keep_alive_max_failed: Option<u32>,
    conn_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ServiceFile {
    network: String,
    local_addr: String,
    proxy_port: String,
}

/// Thin CLI front-end (SPEC_FULL §10.3 names this out of the core's scope;
/// it exists only to produce an [`AgentConfig`]).
#[derive(Debug, Parser)]
#[command(name = "tunnel-agent", about = "NAT-side agent for the reverse tunnel")]
pub struct Cli {
    /// Load defaults from a TOML file; CLI flags explicitly passed override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long = "server-host")]
    pub server_host: Option<String>,

    #[arg(long = "server-port")]
    pub server_port: Option<u16>,

    /// Repeatable: "network:local_addr:proxy_port", e.g. "tcp:127.0.0.1:7000:6100".
    #[arg(long = "service")]
    pub services: Vec<String>,

    #[arg(long)]
    pub token: Option<String>,

    #[arg(long = "keep-alive-period")]
    pub keep_alive_period: Option<u64>,

    #[arg(long = "keep-alive-max-failed")]
    pub keep_alive_max_failed: Option<u32>,

    #[arg(long = "conn-timeout")]
    pub conn_timeout: Option<u64>,
}

impl Cli {
    pub fn resolve(self) -> Result<AgentConfig, ConfigError> {
        let file = match &self.config {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
                        path: path.display().to_string(),
                        source,
                    })?;
                toml::from_str::<AgentConfigFile>(&text).map_err(|source| {
                    ConfigError::ParseFile {
                        path: path.display().to_string(),
                        source,
                    }
                })?
            }
            None => AgentConfigFile::default(),
        };

        let server_host = self
            .server_host
            .or(file.server_host)
            .ok_or(ConfigError::MissingServerHost)?;
        if server_host.is_empty() {
            return Err(ConfigError::MissingServerHost);
        }
        let server_port = self
            .server_port
            .or(file.server_port)
            .ok_or(ConfigError::MissingServerPort)?;
        if server_port == 0 {
            return Err(ConfigError::MissingServerPort);
        }

        let mut services = Vec::new();
        for spec in &self.services {
            services.push(parse_service_spec(spec)?);
        }
        if services.is_empty() {
            if let Some(from_file) = file.services {
                for svc in from_file {
                    services.push(Service {
                        network: Network::from_str(&svc.network)?,
                        local_addr: svc.local_addr,
                        proxy_port: svc.proxy_port,
                    });
                }
            }
        }
        if services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        let token = self.token.or(file.token).unwrap_or_default();
        let keep_alive_period = self
            .keep_alive_period
            .or(file.keep_alive_period)
            .unwrap_or(DEFAULT_KEEP_ALIVE_PERIOD);
        let keep_alive_max_failed = self
            .keep_alive_max_failed
            .or(file.keep_alive_max_failed)
            .unwrap_or(DEFAULT_KEEP_ALIVE_MAX_FAILED);
        let conn_timeout = self
            .conn_timeout
            .or(file.conn_timeout)
            .unwrap_or(DEFAULT_CONN_TIMEOUT);

        Ok(AgentConfig {
            server_host,
            server_port,
            services,
            token,
            keep_alive_period,
            keep_alive_max_failed,
            conn_timeout,
        })
    }
}
