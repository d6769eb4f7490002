//! Per-session bookkeeping on the broker side (spec §3 "UserConn").
//!
//! Spec §9 asks for explicit capability types rather than the Go source's
//! embedding chain (`TCPUserConn` embeds `*UserConn` embeds nothing-but-
//! shared-fields); here that's two plain structs with the shared fields
//! (`session_id`, `created_at`, `bound`, close/cancel) duplicated rather than
//! inherited, since TCP and UDP sessions hold genuinely different transport
//! state (one stream vs. two queues).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use tunnel_protocol::OnceClose;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

/// TCP-side UserConn: owns the accepted public stream until (and after) it's
/// paired with a tunnel.
pub struct TcpUserConn {
    pub session_id: String,
    pub created_at: i64,
    pub stream: Mutex<Option<TcpStream>>,
    pub bound: AtomicBool,
    pub close: OnceClose,
    pub cancel: CancellationToken,
}

impl TcpUserConn {
    pub fn new(session_id: String, stream: TcpStream) -> Self {
        TcpUserConn {
            session_id,
            created_at: now_unix(),
            stream: Mutex::new(Some(stream)),
            bound: AtomicBool::new(false),
            close: OnceClose::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_tunnel_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    /// P8: eligible for idle eviction once unbound past `created_at + conn_timeout`.
    pub fn is_idle_expired(&self, conn_timeout_secs: u64, now: i64) -> bool {
        !self.is_tunnel_bound() && self.created_at + conn_timeout_secs as i64 <= now
    }
}

/// UDP-side UserConn: two bounded queues plus an atomic idle deadline
/// (spec §3, §4.8). Bound depth matches the Go original's `userCh`/`tunnelCh`.
pub const UDP_QUEUE_DEPTH: usize = 32;

pub struct UdpUserConn {
    pub session_id: String,
    pub created_at: i64,
    pub user_remote_addr: SocketAddr,
    pub user_tx: mpsc::Sender<Vec<u8>>,
    pub user_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    pub tunnel_tx: mpsc::Sender<Vec<u8>>,
    pub tunnel_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    pub tunnel_remote_addr: RwLock<Option<SocketAddr>>,
    pub deadline: AtomicI64,
    pub bound: AtomicBool,
    pub close: OnceClose,
    pub cancel: CancellationToken,
}

impl UdpUserConn {
    pub fn new(session_id: String, user_remote_addr: SocketAddr, conn_timeout_secs: u64) -> Arc<Self> {
        let (user_tx, user_rx) = mpsc::channel(UDP_QUEUE_DEPTH);
        let (tunnel_tx, tunnel_rx) = mpsc::channel(UDP_QUEUE_DEPTH);
        Arc::new(UdpUserConn {
            session_id,
            created_at: now_unix(),
            user_remote_addr,
            user_tx,
            user_rx: Mutex::new(user_rx),
            tunnel_tx,
            tunnel_rx: Mutex::new(tunnel_rx),
            tunnel_remote_addr: RwLock::new(None),
            deadline: AtomicI64::new(now_unix() + conn_timeout_secs as i64),
            bound: AtomicBool::new(false),
            close: OnceClose::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn reset_deadline(&self, conn_timeout_secs: u64) {
        self.deadline
            .store(now_unix() + conn_timeout_secs as i64, Ordering::SeqCst);
    }

    pub fn is_past_deadline(&self, now: i64) -> bool {
        now > self.deadline.load(Ordering::SeqCst)
    }

    pub async fn bind_tunnel(&self, remote: SocketAddr) {
        *self.tunnel_remote_addr.write().await = Some(remote);
        self.bound.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_idle_eviction_only_applies_while_unbound() {
        let stream_pair = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = stream_pair.local_addr().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let client = TcpStream::connect(addr).await.unwrap();
            let conn = TcpUserConn::new("127.0.0.1:1".into(), client);
            let far_future = conn.created_at + 1000;
            assert!(conn.is_idle_expired(5, far_future));
            assert!(!conn.is_idle_expired(5, conn.created_at));
            conn.bound.store(true, Ordering::SeqCst);
            assert!(!conn.is_idle_expired(5, far_future));
        });
    }
}
