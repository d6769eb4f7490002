//! Error kinds (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid allow-ports list: {0}")]
    AllowPorts(#[from] tunnel_protocol::AllowListError),

    #[error("server_port must be nonzero")]
    MissingPort,

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors a single service registration can fail with (spec §4.6).
/// None of these close the control connection; they just withhold
/// SERVICE_READY (spec §4.9).
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("empty service_id")]
    EmptyServiceId,

    #[error("service_id {0:?} already registered")]
    AlreadyRegistered(String),

    #[error("proxy_port {0} is outside the configured allow-list")]
    PortNotAllowed(u16),

    #[error("invalid proxy_port {0:?}")]
    InvalidPort(String),

    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
}
