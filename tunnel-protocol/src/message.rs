//! # ControlMessage schema
//!
//! The one wire structure shared by the broker and the agent (spec §3). It is
//! a flat record rather than a Rust-style enum-with-payload: the `ctl` field
//! is the verb discriminant and the remaining fields are populated or left at
//! their default depending on which verb is in play, mirroring the optional
//! fields of the original protobuf-based message. [`ControlMessage::verb`]
//! recovers a closed [`Verb`] enum for exhaustive matching in application
//! code, so callers never match on the raw `u32` tag directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verb tag: agent registers a service.
pub const NEW_TUNNEL: u32 = 10_000;
/// Verb tag: agent→broker, register a service; broker→agent, ask for a tunnel.
pub const NEW_SERVICE: u32 = 10_001;
/// Verb tag: broker→agent, service registration acknowledged.
pub const SERVICE_READY: u32 = 10_002;
/// Verb tag: either direction, liveness probe / echo.
pub const KEEP_ALIVE: u32 = 10_003;
/// Verb tag: UDP only, carries one wrapped user datagram.
pub const NEW_DATA_CONN: u32 = 10_004;

/// Closed sum type over the verbs a [`ControlMessage`] can carry. An
/// out-of-range `ctl` value (never emitted by this crate, but possible from a
/// misbehaving peer) decodes to `Unknown` rather than failing, so callers get
/// a single exhaustive `match` arm for "log and ignore" per spec §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    NewTunnel,
    NewService,
    ServiceReady,
    KeepAlive,
    NewDataConn,
    Unknown(u32),
}

impl From<u32> for Verb {
    fn from(ctl: u32) -> Self {
        match ctl {
            NEW_TUNNEL => Verb::NewTunnel,
            NEW_SERVICE => Verb::NewService,
            SERVICE_READY => Verb::ServiceReady,
            KEEP_ALIVE => Verb::KeepAlive,
            NEW_DATA_CONN => Verb::NewDataConn,
            other => Verb::Unknown(other),
        }
    }
}

impl From<Verb> for u32 {
    fn from(verb: Verb) -> Self {
        match verb {
            Verb::NewTunnel => NEW_TUNNEL,
            Verb::NewService => NEW_SERVICE,
            Verb::ServiceReady => SERVICE_READY,
            Verb::KeepAlive => KEEP_ALIVE,
            Verb::NewDataConn => NEW_DATA_CONN,
            Verb::Unknown(v) => v,
        }
    }
}

/// Transport network a service is exposed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("network must be \"tcp\" or \"udp\", got {0:?}")]
pub struct ParseNetworkError(pub String);

impl std::str::FromStr for Network {
    type Err = ParseNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(ParseNetworkError(other.to_string())),
        }
    }
}

/// `{network, proxy_port, local_addr}` — one exposed service (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub network: Network,
    pub proxy_port: String,
    pub local_addr: String,
}

impl Service {
    /// Agent-side convention: `service_id = network + proxy_port` (spec §3,
    /// and `client/control.go`'s `registryService` in the original source).
    pub fn service_id(&self) -> String {
        format!("{}{}", self.network, self.proxy_port)
    }
}

/// The one wire structure. See module docs and spec §3/§6.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub ctl: u32,
    pub service: Option<Service>,
    pub service_id: String,
    pub session_id: String,
    pub token: String,
    pub data: Vec<u8>,
}

impl ControlMessage {
    pub fn verb(&self) -> Verb {
        Verb::from(self.ctl)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn new_service(service: Service, service_id: String, token: impl Into<String>) -> Self {
        ControlMessage {
            ctl: NEW_SERVICE,
            session_id: service_id.clone(),
            service_id,
            service: Some(service),
            token: token.into(),
            data: Vec::new(),
        }
    }

    pub fn service_ready(service_id: String, session_id: String, token: impl Into<String>) -> Self {
        ControlMessage {
            ctl: SERVICE_READY,
            service_id,
            session_id,
            service: None,
            token: token.into(),
            data: Vec::new(),
        }
    }

    pub fn new_tunnel(
        service: Option<Service>,
        service_id: String,
        session_id: String,
        token: impl Into<String>,
    ) -> Self {
        ControlMessage {
            ctl: NEW_TUNNEL,
            service,
            service_id,
            session_id,
            token: token.into(),
            data: Vec::new(),
        }
    }

    pub fn keep_alive(token: impl Into<String>) -> Self {
        ControlMessage {
            ctl: KEEP_ALIVE,
            token: token.into(),
            ..Default::default()
        }
    }

    pub fn new_data_conn(
        service_id: String,
        session_id: String,
        token: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        ControlMessage {
            ctl: NEW_DATA_CONN,
            service_id,
            session_id,
            token: token.into(),
            data,
            service: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_round_trips_known_tags() {
        for &ctl in &[NEW_TUNNEL, NEW_SERVICE, SERVICE_READY, KEEP_ALIVE, NEW_DATA_CONN] {
            let verb = Verb::from(ctl);
            assert_eq!(u32::from(verb), ctl);
        }
    }

    #[test]
    fn unknown_verb_is_preserved_not_rejected() {
        assert_eq!(Verb::from(42), Verb::Unknown(42));
    }

    #[test]
    fn service_id_follows_network_plus_port_convention() {
        let svc = Service {
            network: Network::Tcp,
            proxy_port: "6100".into(),
            local_addr: "127.0.0.1:7000".into(),
        };
        assert_eq!(svc.service_id(), "tcp6100");
    }
}
