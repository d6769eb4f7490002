//! Service registry (spec §3 "Registry tables", §4.6, I1/I2/I4).
//!
//! One [`ServiceEntry`] per live `service_id`. The redesign flag in spec §9
//! ("arena+key instead of back-references") is applied here: sessions never
//! hold a pointer back into their owning entry, they hold the `service_id`
//! string and look it up through this registry.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use tunnel_protocol::{FrameCodec, Service};

/// A tunnel endpoint handed from the control plane to a proxy (spec §3).
pub enum TunnelConn {
    /// The freshly-dialed connection itself, plus any bytes the decoder had
    /// already buffered past the NEW_TUNNEL frame (never dropped, spec §4.1).
    Tcp(tokio::net::TcpStream, Vec<u8>),
    /// `session_id` travels with the announcement; this is just the agent's
    /// source address on the shared UDP control socket.
    Udp(SocketAddr),
}

/// Shared handle for writing control-plane frames back to the agent that
/// owns a service (SERVICE_READY echoes, KEEP_ALIVE echoes, and — from the
/// proxy — NEW_TUNNEL announcements).
pub type ControlWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>>;

/// Bounded capacity for the tunnel-announce and (UDP) tunnel-data queues.
/// Spec only says "bounded"; picked generously since a burst of new sessions
/// should never need to block the control reader for long.
pub const ANNOUNCE_QUEUE_CAPACITY: usize = 64;

pub struct ServiceEntry {
    pub service: Service,
    pub service_id: String,
    /// The broker's configured shared secret, stamped onto outbound
    /// NEW_TUNNEL requests this proxy makes of its agent.
    pub token: String,
    pub control_writer: ControlWriter,
    pub tunnel_announce_tx: mpsc::Sender<(String, TunnelConn)>,
    /// UDP services only; TCP tunnels arrive as full connections instead.
    pub tunnel_data_tx: Option<mpsc::Sender<(String, Vec<u8>)>>,
    pub cancel: CancellationToken,
}

/// Registry of live services, keyed by `service_id` (spec §3/I1).
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry {
            services: DashMap::new(),
        }
    }

    /// Registers `entry` iff `service_id` isn't already live. Returns `false`
    /// without side effects on conflict (P4: single registration).
    pub fn try_register(&self, entry: Arc<ServiceEntry>) -> bool {
        match self.services.entry(entry.service_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<ServiceEntry>> {
        self.services.get(service_id).map(|e| Arc::clone(e.value()))
    }

    /// Tears down a service's registration (spec §4.6 step 5). Idempotent.
    pub fn remove(&self, service_id: &str) {
        if let Some((_, entry)) = self.services.remove(service_id) {
            entry.cancel.cancel();
        }
    }

    pub fn is_live(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }
}
