//! `handle_service` (spec §4.6): validates and admits a NEW_SERVICE request,
//! then starts the matching proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tunnel_protocol::message::Network;
use tunnel_protocol::ControlMessage;

use crate::config::BrokerConfig;
use crate::error::RegistrationError;
use crate::proxy_tcp::TcpProxy;
use crate::proxy_udp::UdpProxy;
use crate::registry::{ControlWriter, ServiceEntry, ServiceRegistry, ANNOUNCE_QUEUE_CAPACITY};

pub async fn register_service(
    cfg: &BrokerConfig,
    registry: &Arc<ServiceRegistry>,
    writer: &ControlWriter,
    msg: &ControlMessage,
    udp_control: &Arc<UdpSocket>,
    parent_cancel: CancellationToken,
) -> Result<(), RegistrationError> {
    let service = msg
        .service
        .clone()
        .ok_or(RegistrationError::EmptyServiceId)?;

    if msg.service_id.is_empty() {
        return Err(RegistrationError::EmptyServiceId);
    }
    if registry.is_live(&msg.service_id) {
        return Err(RegistrationError::AlreadyRegistered(msg.service_id.clone()));
    }

    let proxy_port: u16 = service
        .proxy_port
        .parse()
        .map_err(|_| RegistrationError::InvalidPort(service.proxy_port.clone()))?;
    if !cfg.allow_ports.allows(proxy_port) {
        return Err(RegistrationError::PortNotAllowed(proxy_port));
    }

    let cancel = parent_cancel.child_token();
    let (tunnel_announce_tx, tunnel_announce_rx) = mpsc::channel(ANNOUNCE_QUEUE_CAPACITY);

    match service.network {
        Network::Tcp => {
            let listener = TcpListener::bind((cfg.server_bind.as_str(), proxy_port))
                .await
                .map_err(RegistrationError::Bind)?;

            let entry = Arc::new(ServiceEntry {
                service: service.clone(),
                service_id: msg.service_id.clone(),
                token: cfg.token.clone(),
                control_writer: Arc::clone(writer),
                tunnel_announce_tx,
                tunnel_data_tx: None,
                cancel: cancel.clone(),
            });

            if !registry.try_register(Arc::clone(&entry)) {
                return Err(RegistrationError::AlreadyRegistered(msg.service_id.clone()));
            }

            info!(service_id = %entry.service_id, proxy_port, "tcp service registered");
            let service_id = entry.service_id.clone();
            let proxy = TcpProxy::new(listener, entry, cfg.conn_timeout, tunnel_announce_rx);
            let registry = Arc::clone(registry);
            tokio::spawn(async move {
                proxy.run(cancel).await;
                registry.remove(&service_id);
            });
        }
        Network::Udp => {
            let bind_addr: SocketAddr = format!("{}:{}", cfg.server_bind, proxy_port)
                .parse()
                .map_err(|_| RegistrationError::InvalidPort(proxy_port.to_string()))?;
            let socket = bind_tuned_udp(bind_addr).map_err(RegistrationError::Bind)?;
            let (tunnel_data_tx, tunnel_data_rx) = mpsc::channel(ANNOUNCE_QUEUE_CAPACITY);

            let entry = Arc::new(ServiceEntry {
                service: service.clone(),
                service_id: msg.service_id.clone(),
                token: cfg.token.clone(),
                control_writer: Arc::clone(writer),
                tunnel_announce_tx,
                tunnel_data_tx: Some(tunnel_data_tx),
                cancel: cancel.clone(),
            });

            if !registry.try_register(Arc::clone(&entry)) {
                return Err(RegistrationError::AlreadyRegistered(msg.service_id.clone()));
            }

            info!(service_id = %entry.service_id, proxy_port, "udp service registered");
            let service_id = entry.service_id.clone();
            let proxy = UdpProxy::new(
                Arc::new(socket),
                Arc::clone(udp_control),
                entry,
                cfg.conn_timeout,
                tunnel_announce_rx,
                tunnel_data_rx,
            );
            let registry = Arc::clone(registry);
            tokio::spawn(async move {
                proxy.run(cancel).await;
                registry.remove(&service_id);
            });
        }
    }

    Ok(())
}

/// Matches the original source's `UDPConnBufferSize` (SPEC_FULL §11): tuned
/// via `socket2` since `tokio::net::UdpSocket` exposes no `SO_SNDBUF`/
/// `SO_RCVBUF` knob directly. Used for every UDP socket the broker binds —
/// per-service public-port listeners and the shared control socket.
pub const UDP_CONN_BUFFER_SIZE: usize = 8 * 1024;

pub fn bind_tuned_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_send_buffer_size(UDP_CONN_BUFFER_SIZE)?;
    socket.set_recv_buffer_size(UDP_CONN_BUFFER_SIZE)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}
