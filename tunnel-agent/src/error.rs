//! Error kinds (spec §7), agent side.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server_host must not be empty")]
    MissingServerHost,

    #[error("server_port must be nonzero")]
    MissingServerPort,

    #[error("at least one service must be configured")]
    NoServices,

    #[error("invalid --service spec {0:?}: expected \"network:local_addr:proxy_port\"")]
    BadServiceSpec(String),

    #[error("invalid network {0:?} in service spec, expected \"tcp\" or \"udp\"")]
    BadNetwork(#[from] tunnel_protocol::message::ParseNetworkError),

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
