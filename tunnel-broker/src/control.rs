//! Broker control server (spec §4.5) plus the shared UDP control socket
//! (spec §4.5 last paragraph, §4.8).
//!
//! Each accepted TCP connection on the control port is read with a hand
//! rolled length-prefix loop rather than `tokio_util::codec::FramedRead`
//! because one connection's fate genuinely bifurcates mid-stream (spec
//! §4.2's `Accepted → Registered | TunnelBearer` state machine): if the
//! first frame turns out to be NEW_TUNNEL, this task must hand the *raw*
//! socket to a proxy without losing whatever bytes it already buffered past
//! that frame (§4.1 "never drops data"). Doing the length-prefix decode by
//! hand keeps that leftover buffer in our own hands instead of trusting a
//! combinator to expose it.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use tunnel_protocol::codec::{decode_datagram, STREAM_READ_BUFFER, UDP_RECV_BUFFER};
use tunnel_protocol::message::{Network, Verb};
use tunnel_protocol::{ControlMessage, FrameCodec};

use crate::config::BrokerConfig;
use crate::registry::{ControlWriter, ServiceRegistry, TunnelConn};
use crate::service::register_service;

/// Runs the TCP control-connection accept loop until `shutdown` fires.
pub async fn run_control_server(
    cfg: Arc<BrokerConfig>,
    registry: Arc<ServiceRegistry>,
    udp_control: Arc<UdpSocket>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", cfg.server_bind, cfg.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "control server listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("control server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let cfg = Arc::clone(&cfg);
                let registry = Arc::clone(&registry);
                let udp_control = Arc::clone(&udp_control);
                let child = shutdown.child_token();
                tokio::spawn(
                    async move {
                        if let Err(err) =
                            handle_connection(stream, peer, cfg, registry, udp_control, child).await
                        {
                            debug!(%err, "control connection ended");
                        }
                    }
                    .instrument(info_span!("control_conn", %peer)),
                );
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    cfg: Arc<BrokerConfig>,
    registry: Arc<ServiceRegistry>,
    udp_control: Arc<UdpSocket>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let writer: ControlWriter = Arc::new(Mutex::new(FramedWrite::new(write_half, FrameCodec)));

    // Mirrors the Go source's `defer cancel()`: whatever this connection
    // registers lives only as long as the connection does. Dropping the
    // guard on any return path tears down its services' proxies, listeners,
    // and registry entries (I1, spec §4.6 step 5).
    let conn_cancel = shutdown.child_token();
    let _cancel_guard = conn_cancel.clone().drop_guard();

    let mut buf = BytesMut::with_capacity(STREAM_READ_BUFFER);
    let mut codec = FrameCodec;

    loop {
        let msg = match codec.decode(&mut buf) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                let n = read_half.read_buf(&mut buf).await?;
                if n == 0 {
                    return Ok(()); // peer closed
                }
                continue;
            }
            Err(err) => {
                warn!(%err, "frame decode error, closing connection");
                return Ok(());
            }
        };

        if msg.token != cfg.token {
            // I4/P3: unauthenticated frames are dropped without side
            // effects; the connection is left open (spec §4.5 log-and-continue).
            warn!(verb = ?msg.verb(), %peer, "dropping unauthenticated frame");
            continue;
        }

        match msg.verb() {
            Verb::NewService => {
                trace!(?msg, "new service request");
                match register_service(&cfg, &registry, &writer, &msg, &udp_control, conn_cancel.clone()).await
                {
                    Ok(()) => {
                        let reply = ControlMessage::service_ready(
                            msg.service_id.clone(),
                            msg.session_id.clone(),
                            cfg.token.clone(),
                        );
                        send(&writer, reply).await?;
                    }
                    Err(err) => {
                        warn!(%err, service_id = %msg.service_id, "service registration rejected");
                        // no SERVICE_READY; agent sees no ack (spec §4.9).
                    }
                }
            }
            Verb::KeepAlive => {
                let reply = ControlMessage::keep_alive(cfg.token.clone());
                send(&writer, reply).await?;
            }
            Verb::NewTunnel => {
                let Some(entry) = registry.get(&msg.service_id) else {
                    warn!(service_id = %msg.service_id, "new tunnel for unknown service");
                    return Ok(());
                };
                // Leftover bytes past the NEW_TUNNEL frame belong to the
                // tunnel, not the control plane; carry them along (§4.1).
                let leftover = buf.split().to_vec();

                let Ok(writer) = Arc::try_unwrap(writer) else {
                    warn!(service_id = %msg.service_id, "tunnel connection's writer still shared, dropping");
                    return Ok(());
                };
                let write_half: OwnedWriteHalf = writer.into_inner().into_inner();
                let stream = read_half
                    .reunite(write_half)
                    .map_err(|err| anyhow::anyhow!("failed to reunite tunnel connection: {err}"))?;

                info!(service_id = %msg.service_id, session_id = %msg.session_id, "tunnel connection handed off");
                if entry
                    .tunnel_announce_tx
                    .send((msg.session_id.clone(), TunnelConn::Tcp(stream, leftover)))
                    .await
                    .is_err()
                {
                    debug!(service_id = %msg.service_id, "tunnel announce queue closed");
                }
                return Ok(()); // handed off; do NOT close the socket.
            }
            Verb::ServiceReady => {
                debug!(?msg, "unexpected SERVICE_READY on broker side");
            }
            Verb::NewDataConn => {
                warn!("unexpected NEW_DATA_CONN on TCP control connection");
            }
            Verb::Unknown(tag) => {
                warn!(tag, "unknown control verb, ignoring");
            }
        }
    }
}

async fn send(writer: &ControlWriter, msg: ControlMessage) -> anyhow::Result<()> {
    use futures::SinkExt;
    let mut guard = writer.lock().await;
    guard.send(msg).await?;
    Ok(())
}

/// The shared UDP control socket (spec §4.5): one per broker process, bound
/// to the same address as the TCP control port. Routes NEW_TUNNEL to the
/// matching service's tunnel-announce queue and NEW_DATA_CONN to its
/// tunnel-data queue.
pub async fn run_udp_control_reader(
    socket: Arc<UdpSocket>,
    cfg: Arc<BrokerConfig>,
    registry: Arc<ServiceRegistry>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    loop {
        let (n, src) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = socket.recv_from(&mut buf) => result?,
        };

        let msg = match decode_datagram(&buf[..n]) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, %src, "malformed datagram on shared udp control socket");
                continue;
            }
        };

        if msg.token != cfg.token {
            warn!(%src, verb = ?msg.verb(), "dropping unauthenticated udp control datagram");
            continue;
        }

        let Some(entry) = registry.get(&msg.service_id) else {
            debug!(service_id = %msg.service_id, "udp control datagram for unknown service");
            continue;
        };
        if entry.service.network != Network::Udp {
            warn!(service_id = %msg.service_id, "udp control datagram for a tcp service");
            continue;
        }

        match msg.verb() {
            Verb::NewTunnel => {
                if entry
                    .tunnel_announce_tx
                    .send((msg.session_id.clone(), TunnelConn::Udp(src)))
                    .await
                    .is_err()
                {
                    debug!(service_id = %msg.service_id, "tunnel announce queue closed");
                }
            }
            Verb::NewDataConn => {
                if let Some(tx) = &entry.tunnel_data_tx {
                    if tx.send((msg.session_id.clone(), msg.data)).await.is_err() {
                        debug!(service_id = %msg.service_id, "tunnel data queue closed");
                    }
                }
            }
            other => {
                debug!(?other, "unexpected verb on shared udp control socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    use tunnel_protocol::allowlist::PortAllowList;
    use tunnel_protocol::codec::encode_datagram;
    use tunnel_protocol::message::Network;
    use tunnel_protocol::Service;

    fn test_config(token: &str) -> Arc<BrokerConfig> {
        Arc::new(BrokerConfig {
            server_bind: "127.0.0.1".into(),
            server_port: 6000,
            allow_ports: PortAllowList::allow_all(),
            token: token.into(),
            conn_timeout: 3600,
        })
    }

    fn test_config_on_port(port: u16) -> Arc<BrokerConfig> {
        Arc::new(BrokerConfig {
            server_bind: "127.0.0.1".into(),
            server_port: port,
            allow_ports: PortAllowList::allow_all(),
            token: "secret".into(),
            conn_timeout: 3600,
        })
    }

    async fn spawn_fake_agent(
        cfg: Arc<BrokerConfig>,
    ) -> (SocketAddr, Arc<ServiceRegistry>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ServiceRegistry::new());
        let udp_control = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let registry_clone = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await?;
            handle_connection(stream, peer, cfg, registry_clone, udp_control, CancellationToken::new())
                .await
        });
        (addr, registry, handle)
    }

    async fn reserve_tcp_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn reserve_udp_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn registers_tcp_service_and_replies_service_ready() {
        let cfg = test_config("secret");
        let (addr, registry, _handle) = spawn_fake_agent(Arc::clone(&cfg)).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = client.into_split();
        let mut sink = FramedWrite::new(write_half, FrameCodec);
        let mut stream = FramedRead::new(read_half, FrameCodec);

        let service = Service {
            network: Network::Tcp,
            proxy_port: "0".into(),
            local_addr: "127.0.0.1:7000".into(),
        };
        let register = ControlMessage::new_service(service, "tcp0".into(), "secret");
        sink.send(register).await.unwrap();

        let reply = stream.next().await.unwrap().unwrap();
        assert_eq!(reply.verb(), Verb::ServiceReady);
        assert_eq!(reply.service_id, "tcp0");
        assert!(registry.is_live("tcp0"));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_silently() {
        let cfg = test_config("secret");
        let (addr, registry, _handle) = spawn_fake_agent(Arc::clone(&cfg)).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = client.into_split();
        let mut sink = FramedWrite::new(write_half, FrameCodec);
        let mut stream = FramedRead::new(read_half, FrameCodec);

        let service = Service {
            network: Network::Tcp,
            proxy_port: "0".into(),
            local_addr: "127.0.0.1:7001".into(),
        };
        let register = ControlMessage::new_service(service.clone(), "tcp1".into(), "secret");
        sink.send(register).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.verb(), Verb::ServiceReady);

        let duplicate = ControlMessage::new_service(service, "tcp1".into(), "secret");
        sink.send(duplicate).await.unwrap();

        let second = tokio::time::timeout(std::time::Duration::from_millis(200), stream.next()).await;
        assert!(second.is_err(), "duplicate registration must not get a second SERVICE_READY");
        assert!(registry.is_live("tcp1"));
    }

    #[tokio::test]
    async fn unauthenticated_frame_is_dropped_without_side_effects() {
        let cfg = test_config("secret");
        let (addr, registry, _handle) = spawn_fake_agent(Arc::clone(&cfg)).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = client.into_split();
        let mut sink = FramedWrite::new(write_half, FrameCodec);
        let mut stream = FramedRead::new(read_half, FrameCodec);

        let service = Service {
            network: Network::Tcp,
            proxy_port: "0".into(),
            local_addr: "127.0.0.1:7002".into(),
        };
        let wrong_token = ControlMessage::new_service(service.clone(), "tcp2".into(), "wrong");
        sink.send(wrong_token).await.unwrap();

        let no_reply = tokio::time::timeout(std::time::Duration::from_millis(200), stream.next()).await;
        assert!(no_reply.is_err(), "bad token must produce no reply");
        assert!(!registry.is_live("tcp2"));

        let correct = ControlMessage::new_service(service, "tcp2".into(), "secret");
        sink.send(correct).await.unwrap();
        let reply = stream.next().await.unwrap().unwrap();
        assert_eq!(reply.verb(), Verb::ServiceReady);
        assert!(registry.is_live("tcp2"));
    }

    /// Scenario §8.2.1: a public client's bytes round-trip through the
    /// broker to a tunnel connection and back, end to end over real
    /// loopback sockets.
    #[tokio::test]
    async fn tcp_echo_end_to_end() {
        use tokio::io::AsyncWriteExt;

        let control_port = reserve_tcp_port().await;
        let proxy_port = reserve_tcp_port().await;

        let cfg = test_config_on_port(control_port);
        let registry = Arc::new(ServiceRegistry::new());
        let udp_control = Arc::new(UdpSocket::bind(("127.0.0.1", control_port)).await.unwrap());
        let shutdown = CancellationToken::new();
        let _server = tokio::spawn(run_control_server(
            Arc::clone(&cfg),
            Arc::clone(&registry),
            Arc::clone(&udp_control),
            shutdown.child_token(),
        ));

        // Fake agent registers a tcp service on the pre-reserved public port.
        let control_conn = TcpStream::connect(("127.0.0.1", control_port)).await.unwrap();
        let (agent_read, agent_write) = control_conn.into_split();
        let mut agent_sink = FramedWrite::new(agent_write, FrameCodec);
        let mut agent_stream = FramedRead::new(agent_read, FrameCodec);

        let service = Service {
            network: Network::Tcp,
            proxy_port: proxy_port.to_string(),
            local_addr: "127.0.0.1:0".into(),
        };
        agent_sink
            .send(ControlMessage::new_service(service, "tcp-echo".into(), "secret"))
            .await
            .unwrap();
        let ready = agent_stream.next().await.unwrap().unwrap();
        assert_eq!(ready.verb(), Verb::ServiceReady);

        // User dials the public port; the broker asks the agent for a tunnel.
        let mut user = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        let announce = tokio::time::timeout(std::time::Duration::from_secs(1), agent_stream.next())
            .await
            .expect("broker should request a tunnel")
            .unwrap()
            .unwrap();
        assert_eq!(announce.verb(), Verb::NewTunnel);
        assert_eq!(announce.service_id, "tcp-echo");

        // Agent dials a fresh connection, announces it as the tunnel, then
        // acts as the echoing local service directly on that socket.
        let mut tunnel_conn = TcpStream::connect(("127.0.0.1", control_port)).await.unwrap();
        let mut frame = BytesMut::new();
        Encoder::<&ControlMessage>::encode(
            &mut FrameCodec,
            &ControlMessage::new_tunnel(
                None,
                announce.service_id.clone(),
                announce.session_id.clone(),
                "secret",
            ),
            &mut frame,
        )
        .unwrap();
        tunnel_conn.write_all(&frame).await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match tunnel_conn.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if tunnel_conn.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        user.write_all(b"hello\n").await.unwrap();
        let mut response = [0u8; 6];
        tokio::time::timeout(std::time::Duration::from_secs(1), user.read_exact(&mut response))
            .await
            .expect("echo should arrive within 1s")
            .unwrap();
        assert_eq!(&response, b"hello\n");

        shutdown.cancel();
    }

    /// Scenario §8.2.2: same round trip, but over the shared UDP control
    /// socket (spec §4.8's "agent datagrams arrive on the broker's shared
    /// socket, not the service's own public-port socket").
    #[tokio::test]
    async fn udp_echo_end_to_end() {
        let control_port = reserve_tcp_port().await;
        let proxy_port = reserve_udp_port().await;

        let cfg = test_config_on_port(control_port);
        let registry = Arc::new(ServiceRegistry::new());
        let udp_control = Arc::new(UdpSocket::bind(("127.0.0.1", control_port)).await.unwrap());
        let udp_control_addr = udp_control.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let _tcp_server = tokio::spawn(run_control_server(
            Arc::clone(&cfg),
            Arc::clone(&registry),
            Arc::clone(&udp_control),
            shutdown.child_token(),
        ));
        let _udp_reader = tokio::spawn(run_udp_control_reader(
            Arc::clone(&udp_control),
            Arc::clone(&cfg),
            Arc::clone(&registry),
            shutdown.child_token(),
        ));

        // Fake agent registers a udp service on the pre-reserved public port.
        let control_conn = TcpStream::connect(("127.0.0.1", control_port)).await.unwrap();
        let (agent_read, agent_write) = control_conn.into_split();
        let mut agent_sink = FramedWrite::new(agent_write, FrameCodec);
        let mut agent_stream = FramedRead::new(agent_read, FrameCodec);

        let service = Service {
            network: Network::Udp,
            proxy_port: proxy_port.to_string(),
            local_addr: "127.0.0.1:0".into(),
        };
        agent_sink
            .send(ControlMessage::new_service(service, "udp-echo".into(), "secret"))
            .await
            .unwrap();
        let ready = agent_stream.next().await.unwrap().unwrap();
        assert_eq!(ready.verb(), Verb::ServiceReady);

        // User sends one datagram to the public port.
        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        user.send_to(b"ping", ("127.0.0.1", proxy_port)).await.unwrap();

        // The broker asks for a tunnel over the TCP control connection (udp
        // NEW_TUNNEL requests still travel on the control socket; only the
        // data plane uses the shared udp socket).
        let announce = tokio::time::timeout(std::time::Duration::from_secs(1), agent_stream.next())
            .await
            .expect("broker should request a udp tunnel")
            .unwrap()
            .unwrap();
        assert_eq!(announce.verb(), Verb::NewTunnel);
        assert_eq!(announce.service_id, "udp-echo");

        // Agent announces its tunnel socket with one NEW_TUNNEL datagram on
        // the shared control socket.
        let tunnel_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tunnel_announce = encode_datagram(&ControlMessage::new_tunnel(
            None,
            announce.service_id.clone(),
            announce.session_id.clone(),
            "secret",
        ))
        .unwrap();
        tunnel_socket.send_to(&tunnel_announce, udp_control_addr).await.unwrap();

        // The broker forwards the queued datagram wrapped in NEW_DATA_CONN;
        // echo its payload straight back, acting as the local echo service.
        let mut buf = vec![0u8; UDP_RECV_BUFFER];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(1), tunnel_socket.recv_from(&mut buf))
            .await
            .expect("agent should receive the forwarded datagram")
            .unwrap();
        let data_conn = decode_datagram(&buf[..n]).unwrap();
        assert_eq!(data_conn.verb(), Verb::NewDataConn);
        assert_eq!(data_conn.data, b"ping");

        let echo = encode_datagram(&ControlMessage::new_data_conn(
            data_conn.service_id.clone(),
            data_conn.session_id.clone(),
            "secret",
            data_conn.data.clone(),
        ))
        .unwrap();
        tunnel_socket.send_to(&echo, udp_control_addr).await.unwrap();

        let mut reply_buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(1), user.recv_from(&mut reply_buf))
            .await
            .expect("user should receive the echo")
            .unwrap();
        assert_eq!(&reply_buf[..n], b"ping");

        shutdown.cancel();
    }
}
