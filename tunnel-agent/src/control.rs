//! Agent control client (spec §4.3): dials the broker, registers services,
//! runs keepalive, and dispatches NEW_TUNNEL notifications to per-session
//! tunnel workers. A supervisor redials on any failure until the process is
//! cancelled — the Rust shape of the original source's `client.Run`'s
//! `for { case <-c.done: ... retry }` loop.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnel_protocol::message::{Network, Verb};
use tunnel_protocol::{ControlMessage, FrameCodec, Service};

use crate::config::AgentConfig;
use crate::{tunnel_tcp, tunnel_udp};

/// Delay between redial attempts (spec §4.3 step 5).
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Top-level supervisor: dials, runs one session to completion, waits
/// [`RECONNECT_DELAY`], and redials — indefinitely, until `shutdown` fires.
pub async fn run_supervisor(cfg: Arc<AgentConfig>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let session = shutdown.child_token();
        if let Err(err) = run_session(Arc::clone(&cfg), session).await {
            warn!(%err, "control session ended");
        }
        if shutdown.is_cancelled() {
            return;
        }
        info!(delay_secs = RECONNECT_DELAY.as_secs(), server = %cfg.server_addr(), "retry connect server");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn run_session(cfg: Arc<AgentConfig>, session: CancellationToken) -> anyhow::Result<()> {
    let addr = cfg.server_addr();
    info!(%addr, "connecting to broker");
    let stream = TcpStream::connect(&addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut sink = FramedWrite::new(write_half, FrameCodec);
    let mut stream = FramedRead::new(read_half, FrameCodec);

    register_services(&cfg, &mut sink).await?;

    let (keep_alive_tx, keep_alive_rx) = mpsc::channel::<()>(1);

    let ticker_cancel = session.child_token();
    let ticker_token = cfg.token.clone();
    let ticker_period = cfg.keep_alive_period;
    let (frame_tx, mut frame_rx) = mpsc::channel::<ControlMessage>(16);
    let ticker = tokio::spawn(async move {
        keep_alive_ticker(ticker_period, ticker_token, frame_tx, ticker_cancel).await;
    });

    // Cloned (not a child token): a keepalive timeout must cancel the whole
    // session so `read_loop` below observes it and returns, not just this task.
    let watcher_cancel = session.clone();
    let watcher_period = cfg.keep_alive_period;
    let watcher_max_failed = cfg.keep_alive_max_failed;
    let watcher = tokio::spawn(async move {
        keep_alive_watcher(watcher_period, watcher_max_failed, keep_alive_rx, watcher_cancel).await;
    });

    let result = read_loop(&cfg, &mut stream, &mut sink, &keep_alive_tx, &mut frame_rx, &session).await;

    session.cancel();
    ticker.abort();
    watcher.abort();
    result
}

type ControlSink = FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>;
type ControlStream = FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>;

async fn register_services(cfg: &AgentConfig, sink: &mut ControlSink) -> anyhow::Result<()> {
    for service in &cfg.services {
        let msg = new_service_message(service, cfg.token.clone());
        if let Err(err) = sink.send(msg).await {
            // spec §4.3 step 2: a send failure doesn't abort the loop, just
            // surfaces the error for this one service.
            warn!(%err, network = %service.network, proxy_port = %service.proxy_port, "failed to send registration");
            continue;
        }
        info!(
            network = %service.network,
            proxy_port = %service.proxy_port,
            local_addr = %service.local_addr,
            "registry service",
        );
    }
    Ok(())
}

fn new_service_message(service: &Service, token: String) -> ControlMessage {
    let service_id = service.service_id();
    ControlMessage::new_service(service.clone(), service_id, token)
}

async fn keep_alive_ticker(
    period_secs: u64,
    token: String,
    frame_tx: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(period_secs.max(1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if frame_tx.send(ControlMessage::keep_alive(token.clone())).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Mirrors the original `Control.keepAlive`: resets a miss counter whenever
/// a KEEP_ALIVE arrives, increments it on every `period + 1s` window without
/// one, and cancels the session after `max_failed` consecutive misses.
async fn keep_alive_watcher(
    period_secs: u64,
    max_failed: u32,
    mut keep_alive_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let window = Duration::from_secs(period_secs + 1);
    let mut misses = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(window) => {
                misses += 1;
                if misses > max_failed {
                    warn!(max_failed, "keep alive max timeout");
                    cancel.cancel();
                    return;
                }
            }
            got = keep_alive_rx.recv() => {
                if got.is_none() {
                    return;
                }
                misses = 0;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    cfg: &Arc<AgentConfig>,
    stream: &mut ControlStream,
    sink: &mut ControlSink,
    keep_alive_tx: &mpsc::Sender<()>,
    frame_rx: &mut mpsc::Receiver<ControlMessage>,
    session: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = session.cancelled() => return Ok(()),
            outgoing = frame_rx.recv() => {
                let Some(msg) = outgoing else { return Ok(()) };
                sink.send(msg).await?;
            }
            incoming = stream.next() => {
                let Some(incoming) = incoming else {
                    debug!("control connection closed by broker");
                    return Ok(());
                };
                let msg = incoming?;
                if msg.token != cfg.token {
                    warn!(verb = ?msg.verb(), "dropping unauthenticated frame");
                    continue;
                }
                dispatch(cfg, msg, keep_alive_tx).await;
            }
        }
    }
}

async fn dispatch(cfg: &Arc<AgentConfig>, msg: ControlMessage, keep_alive_tx: &mpsc::Sender<()>) {
    match msg.verb() {
        Verb::ServiceReady => {
            info!(service_id = %msg.service_id, "service ready");
        }
        Verb::NewTunnel => {
            let network = msg.service.as_ref().map(|s| s.network);
            let cfg = Arc::clone(cfg);
            match network {
                Some(Network::Tcp) => {
                    tokio::spawn(tunnel_tcp::run(cfg, msg));
                }
                Some(Network::Udp) => {
                    tokio::spawn(tunnel_udp::run(cfg, msg));
                }
                None => {
                    warn!("new tunnel announcement missing service, dropping");
                }
            }
        }
        Verb::KeepAlive => {
            let _ = keep_alive_tx.send(()).await;
        }
        Verb::NewService | Verb::NewDataConn => {
            debug!(verb = ?msg.verb(), "unexpected verb on agent control connection");
        }
        Verb::Unknown(tag) => {
            warn!(tag, "unknown control verb, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_config(addr: std::net::SocketAddr, services: Vec<Service>) -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            server_host: addr.ip().to_string(),
            server_port: addr.port(),
            services,
            token: "secret".into(),
            keep_alive_period: 2,
            keep_alive_max_failed: 3,
            conn_timeout: 3600,
        })
    }

    #[tokio::test]
    async fn registers_one_frame_per_configured_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let services = vec![
            Service { network: Network::Tcp, proxy_port: "6100".into(), local_addr: "127.0.0.1:7000".into() },
            Service { network: Network::Udp, proxy_port: "6200".into(), local_addr: "127.0.0.1:7001".into() },
        ];
        let cfg = test_config(addr, services);

        let server = tokio::spawn(async move {
            let (stream, _peer) = listener.accept().await.unwrap();
            let mut reader = FramedRead::new(stream, FrameCodec);
            let first = reader.next().await.unwrap().unwrap();
            let second = reader.next().await.unwrap().unwrap();
            (first, second)
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (_read_half, write_half) = stream.into_split();
        let mut sink = FramedWrite::new(write_half, FrameCodec);

        register_services(&cfg, &mut sink).await.unwrap();

        let (first, second) = server.await.unwrap();
        assert_eq!(first.verb(), Verb::NewService);
        assert_eq!(first.service_id, "tcp6100");
        assert_eq!(second.verb(), Verb::NewService);
        assert_eq!(second.service_id, "udp6200");
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_watcher_cancels_session_after_max_failed_misses() {
        let (_tx, rx) = mpsc::channel::<()>(1);
        let cancel = CancellationToken::new();

        keep_alive_watcher(0, 1, rx, cancel.clone()).await;

        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_watcher_resets_on_traffic() {
        let (tx, rx) = mpsc::channel::<()>(1);
        let cancel = CancellationToken::new();
        let watcher_cancel = cancel.clone();

        let watcher = tokio::spawn(async move {
            keep_alive_watcher(0, 1, rx, watcher_cancel).await;
        });

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send(()).await.unwrap();
        }
        assert!(!cancel.is_cancelled());

        drop(tx);
        watcher.await.unwrap();
    }

    /// Scenario §8.2.6: the broker connection drops, the supervisor waits
    /// out [`RECONNECT_DELAY`], redials, and re-registers every service.
    #[tokio::test]
    async fn supervisor_reconnects_after_broker_restart() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let services = vec![Service {
            network: Network::Tcp,
            proxy_port: "6100".into(),
            local_addr: "127.0.0.1:7000".into(),
        }];
        let cfg = test_config(addr, services);
        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(run_supervisor(Arc::clone(&cfg), shutdown.child_token()));

        let (stream, _peer) = listener.accept().await.unwrap();
        let mut reader = FramedRead::new(stream, FrameCodec);
        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.verb(), Verb::NewService);
        assert_eq!(first.service_id, "tcp6100");

        // Simulate the broker vanishing; the agent must redial after
        // RECONNECT_DELAY and register again on the new connection.
        drop(reader);

        let (stream, _peer) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("agent should redial within 3s")
            .unwrap();
        let mut reader = FramedRead::new(stream, FrameCodec);
        let second = tokio::time::timeout(Duration::from_secs(1), reader.next())
            .await
            .expect("agent should re-register after reconnecting")
            .unwrap()
            .unwrap();
        assert_eq!(second.verb(), Verb::NewService);
        assert_eq!(second.service_id, "tcp6100");

        shutdown.cancel();
        supervisor.abort();
    }
}
