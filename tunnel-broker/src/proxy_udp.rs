//! Broker UDP proxy (spec §4.8). Harder than the TCP proxy: user flows are
//! identified by source address with no accept event, and agent-side
//! datagrams arrive on the broker's *shared* UDP control socket rather than
//! this service's own public-port socket (spec §9 "the shared-socket design
//! is the more robust one and is what this specification normalizes on").

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use tunnel_protocol::codec::{encode_datagram, UDP_RECV_BUFFER};
use tunnel_protocol::forward::conn_timeout_duration;
use tunnel_protocol::ControlMessage;

use crate::registry::{ServiceEntry, TunnelConn};
use crate::user_conn::{now_unix, UdpUserConn};

pub struct UdpProxy {
    public_socket: Arc<UdpSocket>,
    control_socket: Arc<UdpSocket>,
    entry: Arc<ServiceEntry>,
    conn_timeout: u64,
    tunnel_announce_rx: mpsc::Receiver<(String, TunnelConn)>,
    tunnel_data_rx: mpsc::Receiver<(String, Vec<u8>)>,
}

impl UdpProxy {
    pub fn new(
        public_socket: Arc<UdpSocket>,
        control_socket: Arc<UdpSocket>,
        entry: Arc<ServiceEntry>,
        conn_timeout: u64,
        tunnel_announce_rx: mpsc::Receiver<(String, TunnelConn)>,
        tunnel_data_rx: mpsc::Receiver<(String, Vec<u8>)>,
    ) -> Self {
        UdpProxy {
            public_socket,
            control_socket,
            entry,
            conn_timeout,
            tunnel_announce_rx,
            tunnel_data_rx,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let UdpProxy {
            public_socket,
            control_socket,
            entry,
            conn_timeout,
            mut tunnel_announce_rx,
            mut tunnel_data_rx,
        } = self;

        let user_conns: Arc<DashMap<String, Arc<UdpUserConn>>> = Arc::new(DashMap::new());

        let reader_cancel = cancel.clone();
        let reader_entry = Arc::clone(&entry);
        let reader_public = Arc::clone(&public_socket);
        let reader_user_conns = Arc::clone(&user_conns);
        let datagram_reader = tokio::spawn(
            async move {
                datagram_reader(reader_public, reader_entry, reader_user_conns, conn_timeout, reader_cancel)
                    .await;
            }
            .instrument(info_span!("udp_reader", service_id = %entry.service_id)),
        );

        let watcher_cancel = cancel.clone();
        let watcher_user_conns = Arc::clone(&user_conns);
        let watcher_entry = Arc::clone(&entry);
        let watcher_public = Arc::clone(&public_socket);
        let watcher_control = Arc::clone(&control_socket);
        let tunnel_watcher = tokio::spawn(async move {
            tunnel_watcher(
                &mut tunnel_announce_rx,
                watcher_entry,
                watcher_public,
                watcher_control,
                watcher_user_conns,
                conn_timeout,
                watcher_cancel,
            )
            .await;
        });

        let data_cancel = cancel.clone();
        let data_user_conns = Arc::clone(&user_conns);
        let tunnel_data_watcher = tokio::spawn(async move {
            tunnel_data_watcher(&mut tunnel_data_rx, data_user_conns, data_cancel).await;
        });

        let sweeper_cancel = cancel.clone();
        let sweeper_user_conns = Arc::clone(&user_conns);
        let idle_sweeper = tokio::spawn(async move {
            idle_sweeper(sweeper_user_conns, conn_timeout, sweeper_cancel).await;
        });

        cancel.cancelled().await;
        datagram_reader.abort();
        tunnel_watcher.abort();
        tunnel_data_watcher.abort();
        idle_sweeper.abort();
        info!("udp proxy stopped");
    }
}

async fn datagram_reader(
    public_socket: Arc<UdpSocket>,
    entry: Arc<ServiceEntry>,
    user_conns: Arc<DashMap<String, Arc<UdpUserConn>>>,
    conn_timeout: u64,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = public_socket.recv_from(&mut buf) => received,
        };
        let (n, src) = match received {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "udp proxy read error");
                return;
            }
        };
        let session_id = src.to_string();
        let data = buf[..n].to_vec();

        let conn = if let Some(existing) = user_conns.get(&session_id) {
            Arc::clone(existing.value())
        } else {
            let conn = UdpUserConn::new(session_id.clone(), src, conn_timeout);
            user_conns.insert(session_id.clone(), Arc::clone(&conn));
            info!(service_id = %entry.service_id, %session_id, "new udp session");
            let new_tunnel = ControlMessage::new_tunnel(
                Some(entry.service.clone()),
                entry.service_id.clone(),
                session_id.clone(),
                entry.token.clone(),
            );
            if let Err(err) = send_control(&entry, new_tunnel).await {
                warn!(%err, service_id = %entry.service_id, %session_id, "failed to request udp tunnel");
            }
            conn
        };

        conn.reset_deadline(conn_timeout);
        if conn.user_tx.send(data).await.is_err() {
            debug!(service_id = %entry.service_id, %session_id, "user queue closed, dropping datagram");
        }
    }
}

async fn send_control(entry: &ServiceEntry, msg: ControlMessage) -> anyhow::Result<()> {
    use futures::SinkExt;
    let mut guard = entry.control_writer.lock().await;
    guard.send(msg).await?;
    Ok(())
}

async fn tunnel_watcher(
    rx: &mut mpsc::Receiver<(String, TunnelConn)>,
    entry: Arc<ServiceEntry>,
    public_socket: Arc<UdpSocket>,
    control_socket: Arc<UdpSocket>,
    user_conns: Arc<DashMap<String, Arc<UdpUserConn>>>,
    conn_timeout: u64,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = rx.recv() => next,
        };
        let Some((session_id, tunnel)) = next else {
            return;
        };
        let TunnelConn::Udp(remote_addr) = tunnel else {
            warn!(service_id = %entry.service_id, "tcp tunnel announced on udp service");
            continue;
        };
        let Some(conn) = user_conns.get(&session_id).map(|e| Arc::clone(e.value())) else {
            warn!(service_id = %entry.service_id, %session_id, "udp tunnel for unknown session, dropping");
            continue;
        };

        conn.bind_tunnel(remote_addr).await;
        info!(service_id = %entry.service_id, %session_id, %remote_addr, "udp tunnel bound");

        let service_id = entry.service_id.clone();
        let token = entry.token.clone();
        let public_socket = Arc::clone(&public_socket);
        let control_socket = Arc::clone(&control_socket);
        let user_conns = Arc::clone(&user_conns);
        tokio::spawn(
            async move {
                run_udp_forwarders(conn.clone(), public_socket, control_socket, service_id.clone(), token, conn_timeout)
                    .await;
                user_conns.remove(&session_id);
                conn.close.close();
                conn.cancel.cancel();
            }
            .instrument(info_span!("udp_session", service_id = %entry.service_id, %session_id)),
        );
    }
}

async fn run_udp_forwarders(
    conn: Arc<UdpUserConn>,
    public_socket: Arc<UdpSocket>,
    control_socket: Arc<UdpSocket>,
    service_id: String,
    token: String,
    conn_timeout: u64,
) {
    let user_to_tunnel = tokio::spawn(user_to_tunnel(
        Arc::clone(&conn),
        control_socket,
        service_id.clone(),
        token,
        conn_timeout,
    ));
    let tunnel_to_user = tokio::spawn(tunnel_to_user(Arc::clone(&conn), public_socket, conn_timeout));

    tokio::select! {
        _ = conn.cancel.cancelled() => {}
        _ = user_to_tunnel => {}
        _ = tunnel_to_user => {}
    }
}

async fn user_to_tunnel(
    conn: Arc<UdpUserConn>,
    control_socket: Arc<UdpSocket>,
    service_id: String,
    token: String,
    conn_timeout: u64,
) {
    loop {
        let data = {
            let mut rx = conn.user_rx.lock().await;
            rx.recv().await
        };
        let Some(data) = data else { return };
        let Some(remote) = *conn.tunnel_remote_addr.read().await else {
            continue;
        };
        let msg = ControlMessage::new_data_conn(service_id.clone(), conn.session_id.clone(), token.clone(), data);
        let Ok(bytes) = encode_datagram(&msg) else {
            warn!(%service_id, "oversized udp payload dropped");
            continue;
        };
        if let Err(err) = control_socket.send_to(&bytes, remote).await {
            debug!(%err, "write to tunnel failed");
            return;
        }
        conn.reset_deadline(conn_timeout);
    }
}

async fn tunnel_to_user(conn: Arc<UdpUserConn>, public_socket: Arc<UdpSocket>, conn_timeout: u64) {
    loop {
        let data = {
            let mut rx = conn.tunnel_rx.lock().await;
            rx.recv().await
        };
        let Some(data) = data else { return };
        if let Err(err) = public_socket.send_to(&data, conn.user_remote_addr).await {
            debug!(%err, "write to user failed");
            return;
        }
        conn.reset_deadline(conn_timeout);
    }
}

async fn tunnel_data_watcher(
    rx: &mut mpsc::Receiver<(String, Vec<u8>)>,
    user_conns: Arc<DashMap<String, Arc<UdpUserConn>>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = rx.recv() => next,
        };
        let Some((session_id, data)) = next else {
            return;
        };
        let Some(conn) = user_conns.get(&session_id).map(|e| Arc::clone(e.value())) else {
            debug!(%session_id, "tunnel data for unknown udp session, dropping");
            continue;
        };
        if conn.tunnel_tx.send(data).await.is_err() {
            debug!(%session_id, "tunnel queue closed, dropping datagram");
        }
    }
}

async fn idle_sweeper(
    user_conns: Arc<DashMap<String, Arc<UdpUserConn>>>,
    conn_timeout: u64,
    cancel: CancellationToken,
) {
    let mut ticker = interval(conn_timeout_duration(conn_timeout));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let now = now_unix();
        let stale: Vec<String> = user_conns
            .iter()
            .filter(|entry| entry.value().is_past_deadline(now))
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in stale {
            if let Some((_, conn)) = user_conns.remove(&session_id) {
                debug!(%session_id, "evicted idle udp session");
                conn.close.close();
                conn.cancel.cancel();
            }
        }
    }
}
