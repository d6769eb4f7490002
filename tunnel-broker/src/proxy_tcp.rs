//! Broker TCP proxy (spec §4.7).

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use tunnel_protocol::forward::{conn_timeout_duration, copy_with_deadline_reset};
use tunnel_protocol::ControlMessage;

use crate::registry::{ServiceEntry, TunnelConn};
use crate::user_conn::{now_unix, TcpUserConn};

pub struct TcpProxy {
    listener: TcpListener,
    entry: Arc<ServiceEntry>,
    conn_timeout: u64,
    tunnel_announce_rx: mpsc::Receiver<(String, TunnelConn)>,
    user_conns: Arc<DashMap<String, Arc<TcpUserConn>>>,
}

impl TcpProxy {
    pub fn new(
        listener: TcpListener,
        entry: Arc<ServiceEntry>,
        conn_timeout: u64,
        tunnel_announce_rx: mpsc::Receiver<(String, TunnelConn)>,
    ) -> Self {
        TcpProxy {
            listener,
            entry,
            conn_timeout,
            tunnel_announce_rx,
            user_conns: Arc::new(DashMap::new()),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let TcpProxy {
            listener,
            entry,
            conn_timeout,
            mut tunnel_announce_rx,
            user_conns,
        } = self;

        let accept_cancel = cancel.clone();
        let accept_entry = Arc::clone(&entry);
        let accept_user_conns = Arc::clone(&user_conns);
        let accept_loop = tokio::spawn(
            async move {
                accept_loop(listener, accept_entry, accept_user_conns, accept_cancel).await;
            }
            .instrument(info_span!("tcp_accept", service_id = %entry.service_id)),
        );

        let watcher_cancel = cancel.clone();
        let watcher_entry = Arc::clone(&entry);
        let watcher_user_conns = Arc::clone(&user_conns);
        let tunnel_watcher = tokio::spawn(async move {
            tunnel_watcher(
                &mut tunnel_announce_rx,
                watcher_entry,
                watcher_user_conns,
                conn_timeout,
                watcher_cancel,
            )
            .await;
        });

        let sweeper_cancel = cancel.clone();
        let sweeper_user_conns = Arc::clone(&user_conns);
        let sweeper_service_id = entry.service_id.clone();
        let idle_sweeper = tokio::spawn(async move {
            idle_sweeper(sweeper_user_conns, conn_timeout, sweeper_service_id, sweeper_cancel).await;
        });

        cancel.cancelled().await;
        accept_loop.abort();
        tunnel_watcher.abort();
        idle_sweeper.abort();
        info!(service_id = %entry.service_id, "tcp proxy stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    entry: Arc<ServiceEntry>,
    user_conns: Arc<DashMap<String, Arc<TcpUserConn>>>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                debug!(%err, "accept error, stopping accept loop");
                return;
            }
        };

        let session_id = peer.to_string();
        let user_conn = Arc::new(TcpUserConn::new(session_id.clone(), stream));
        user_conns.insert(session_id.clone(), Arc::clone(&user_conn));

        info!(service_id = %entry.service_id, %session_id, "accepted user connection");

        let new_tunnel = ControlMessage::new_tunnel(
            Some(entry.service.clone()),
            entry.service_id.clone(),
            session_id.clone(),
            entry.token.clone(),
        );
        if let Err(err) = send_control(&entry, new_tunnel).await {
            warn!(%err, service_id = %entry.service_id, %session_id, "failed to request tunnel");
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
    user_conns: Arc<DashMap<String, Arc<TcpUserConn>>>,
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
        let TunnelConn::Tcp(tunnel_stream, leftover) = tunnel else {
            warn!(service_id = %entry.service_id, "udp tunnel announced on tcp service");
            continue;
        };

        let Some(user_conn) = user_conns.get(&session_id).map(|e| Arc::clone(e.value())) else {
            warn!(service_id = %entry.service_id, %session_id, "tunnel for unknown session, dropping");
            continue;
        };

        let Some(user_stream) = user_conn.stream.lock().await.take() else {
            warn!(service_id = %entry.service_id, %session_id, "user connection already bound");
            continue;
        };
        user_conn.bound.store(true, std::sync::atomic::Ordering::SeqCst);

        let timeout = conn_timeout_duration(conn_timeout);
        let service_id = entry.service_id.clone();
        let user_conns = Arc::clone(&user_conns);
        tokio::spawn(
            async move {
                run_forwarders(user_stream, tunnel_stream, leftover, timeout).await;
                user_conns.remove(&session_id);
                user_conn.close.close();
                user_conn.cancel.cancel();
            }
            .instrument(info_span!("tcp_session", %service_id, %session_id)),
        );
    }
}

async fn run_forwarders(
    user_stream: tokio::net::TcpStream,
    tunnel_stream: tokio::net::TcpStream,
    leftover: Vec<u8>,
    timeout: Duration,
) {
    use tokio::io::AsyncWriteExt;

    let (user_read, mut user_write) = user_stream.into_split();
    let (tunnel_read, tunnel_write) = tunnel_stream.into_split();

    if !leftover.is_empty() {
        if let Err(err) = user_write.write_all(&leftover).await {
            debug!(%err, "failed to flush buffered tunnel bytes to user");
            return;
        }
    }

    let tunnel_to_user = tokio::spawn(copy_with_deadline_reset(tunnel_read, user_write, timeout));
    let user_to_tunnel = tokio::spawn(copy_with_deadline_reset(user_read, tunnel_write, timeout));

    tokio::select! {
        _ = tunnel_to_user => { user_to_tunnel.abort(); }
        _ = user_to_tunnel => { tunnel_to_user.abort(); }
    }
}

async fn idle_sweeper(
    user_conns: Arc<DashMap<String, Arc<TcpUserConn>>>,
    conn_timeout: u64,
    service_id: String,
    cancel: CancellationToken,
) {
    let mut ticker = interval(conn_timeout_duration(conn_timeout));
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let now = now_unix();
        let stale: Vec<String> = user_conns
            .iter()
            .filter(|entry| entry.value().is_idle_expired(conn_timeout, now))
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in stale {
            if let Some((_, conn)) = user_conns.remove(&session_id) {
                debug!(%service_id, %session_id, "evicted idle unbound user connection");
                conn.close.close();
                conn.cancel.cancel();
            }
        }
    }
}
