//! Agent UDP tunnel worker (spec §4.4).
//!
//! Unlike the TCP variant, the tunnel "connection" here is a UDP socket
//! dialed at the broker's control port; a single NEW_TUNNEL datagram
//! announces the session, then every payload in either direction travels
//! wrapped in a NEW_DATA_CONN [`ControlMessage`] (spec §4.2).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use tunnel_protocol::codec::{decode_datagram, encode_datagram, UDP_RECV_BUFFER};
use tunnel_protocol::forward::conn_timeout_duration;
use tunnel_protocol::message::Verb;
use tunnel_protocol::ControlMessage;

use crate::config::AgentConfig;

/// Matches the original source's `UDPConnBufferSize` (SPEC_FULL §11): tuned
/// via `socket2` since `tokio::net::UdpSocket` exposes no `SO_SNDBUF`/
/// `SO_RCVBUF` knob directly.
const UDP_CONN_BUFFER_SIZE: usize = 8 * 1024;

/// Handles one broker→agent NEW_TUNNEL announcement for a UDP service.
pub async fn run(cfg: Arc<AgentConfig>, announce: ControlMessage) {
    if announce.session_id.is_empty() {
        warn!(service_id = %announce.service_id, "new tunnel announcement with empty session_id, aborting");
        return;
    }
    let service_id = announce.service_id.clone();
    let session_id = announce.session_id.clone();

    async {
        let Some(service) = announce.service.clone() else {
            warn!("new tunnel announcement missing service spec, aborting");
            return;
        };

        let tunnel_socket = match dial_tuned_udp(&cfg.server_addr()).await {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "tunnel connect failed");
                return;
            }
        };
        let local_socket = match dial_tuned_udp(&service.local_addr).await {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, local_addr = %service.local_addr, "local service connect failed");
                return;
            }
        };

        let announce_msg = ControlMessage::new_tunnel(
            Some(service.clone()),
            service_id.clone(),
            session_id.clone(),
            cfg.token.clone(),
        );
        let bytes = match encode_datagram(&announce_msg) {
            Ok(b) => b,
            Err(err) => {
                warn!(%err, "failed to encode new tunnel datagram");
                return;
            }
        };
        if let Err(err) = tunnel_socket.send(&bytes).await {
            warn!(%err, "failed to announce udp tunnel");
            return;
        }

        info!(local_addr = %service.local_addr, "udp tunnel established");
        let timeout_dur = conn_timeout_duration(cfg.conn_timeout);
        let tunnel_socket = Arc::new(tunnel_socket);
        let local_socket = Arc::new(local_socket);

        let tunnel_to_local = tokio::spawn(tunnel_to_local(
            Arc::clone(&tunnel_socket),
            Arc::clone(&local_socket),
            service_id.clone(),
            session_id.clone(),
            timeout_dur,
        ));
        let local_to_tunnel = tokio::spawn(local_to_tunnel(
            local_socket,
            tunnel_socket,
            service_id.clone(),
            session_id.clone(),
            cfg.token.clone(),
            timeout_dur,
        ));

        tokio::select! {
            _ = tunnel_to_local => { local_to_tunnel.abort(); }
            _ = local_to_tunnel => { tunnel_to_local.abort(); }
        }
        debug!("udp tunnel closed");
    }
    .instrument(info_span!("udp_tunnel", %service_id, %session_id))
    .await
}

/// Binds an ephemeral UDP socket, tunes its send/receive buffers via
/// `socket2`, and connects it to `addr` so `send`/`recv` address the peer
/// implicitly (spec §4.4 "dial the configured local_addr").
async fn dial_tuned_udp(addr: &str) -> std::io::Result<UdpSocket> {
    let peer: SocketAddr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))?;

    let domain = if peer.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_send_buffer_size(UDP_CONN_BUFFER_SIZE)?;
    socket.set_recv_buffer_size(UDP_CONN_BUFFER_SIZE)?;
    let bind_addr: SocketAddr = if peer.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket = UdpSocket::from_std(std_socket)?;
    tokio_socket.connect(peer).await?;
    Ok(tokio_socket)
}

/// Reads NEW_DATA_CONN datagrams off the tunnel socket, unwraps the payload,
/// and writes it raw to the local service.
async fn tunnel_to_local(
    tunnel_socket: Arc<UdpSocket>,
    local_socket: Arc<UdpSocket>,
    service_id: String,
    session_id: String,
    idle_timeout: Duration,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    loop {
        let n = match timeout(idle_timeout, tunnel_socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                debug!(%err, "tunnel read error");
                return;
            }
            Err(_) => {
                debug!("tunnel idle timeout");
                return;
            }
        };
        let msg = match decode_datagram(&buf[..n]) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "malformed datagram from tunnel");
                continue;
            }
        };
        if !matches!(msg.verb(), Verb::NewDataConn)
            || msg.service_id != service_id
            || msg.session_id != session_id
        {
            debug!(?msg, "unexpected datagram from tunnel, dropping");
            continue;
        }
        if let Err(err) = local_socket.send(&msg.data).await {
            debug!(%err, "write to local service failed");
            return;
        }
    }
}

/// Reads raw datagrams off the local socket, wraps each in a NEW_DATA_CONN
/// frame tagged with this session's ids, and sends it to the tunnel socket.
async fn local_to_tunnel(
    local_socket: Arc<UdpSocket>,
    tunnel_socket: Arc<UdpSocket>,
    service_id: String,
    session_id: String,
    token: String,
    idle_timeout: Duration,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    loop {
        let n = match timeout(idle_timeout, local_socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                debug!(%err, "local read error");
                return;
            }
            Err(_) => {
                debug!("local idle timeout");
                return;
            }
        };
        let msg = ControlMessage::new_data_conn(
            service_id.clone(),
            session_id.clone(),
            token.clone(),
            buf[..n].to_vec(),
        );
        let bytes = match encode_datagram(&msg) {
            Ok(b) => b,
            Err(err) => {
                warn!(%err, "oversized udp payload dropped");
                continue;
            }
        };
        if let Err(err) = tunnel_socket.send(&bytes).await {
            debug!(%err, "write to tunnel failed");
            return;
        }
    }
}
