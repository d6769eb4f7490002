//! Agent TCP tunnel worker (spec §4.4).
//!
//! One of these runs per `(service_id, session_id)` NEW_TUNNEL notification.
//! It dials a fresh control-port connection, announces itself as the tunnel
//! for that session with a single NEW_TUNNEL frame, dials the local service,
//! and shuffles bytes in both directions until either side closes or goes
//! idle past `conn_timeout`.

use std::sync::Arc;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, info_span, warn, Instrument};

use tunnel_protocol::forward::{conn_timeout_duration, copy_with_deadline_reset};
use tunnel_protocol::{ControlMessage, FrameCodec};

use crate::config::AgentConfig;

/// Handles one broker→agent NEW_TUNNEL announcement for a TCP service.
/// `announce` is the frame as received, re-sent verbatim (minus token, which
/// is re-stamped) as the tunnel connection's first frame — mirroring the
/// original source's `SendCtl(tunnelConn, msg, NewTunnelCtl)`.
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

        let tunnel_stream = match TcpStream::connect(cfg.server_addr()).await {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "tunnel connect failed");
                return;
            }
        };

        let local_stream = match TcpStream::connect(&service.local_addr).await {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, local_addr = %service.local_addr, "local service connect failed");
                return;
            }
        };

        let mut tunnel_stream = tunnel_stream;
        let new_tunnel = ControlMessage::new_tunnel(
            Some(service.clone()),
            service_id.clone(),
            session_id.clone(),
            cfg.token.clone(),
        );
        {
            let mut framed = FramedWrite::new(&mut tunnel_stream, FrameCodec);
            if let Err(err) = framed.send(new_tunnel).await {
                warn!(%err, "failed to announce tcp tunnel");
                return;
            }
        }

        info!(local_addr = %service.local_addr, "tcp tunnel established");
        let timeout = conn_timeout_duration(cfg.conn_timeout);
        let (tunnel_read, tunnel_write) = tunnel_stream.into_split();
        let (local_read, local_write) = local_stream.into_split();

        let tunnel_to_local = tokio::spawn(copy_with_deadline_reset(tunnel_read, local_write, timeout));
        let local_to_tunnel = tokio::spawn(copy_with_deadline_reset(local_read, tunnel_write, timeout));

        tokio::select! {
            _ = tunnel_to_local => { local_to_tunnel.abort(); }
            _ = local_to_tunnel => { tunnel_to_local.abort(); }
        }
        debug!("tcp tunnel closed");
    }
    .instrument(info_span!("tcp_tunnel", %service_id, %session_id))
    .await
}
