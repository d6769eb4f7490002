//! Shared forwarding primitive (spec §2 item 8, §4.7 "Tunnel watcher").
//!
//! Every TCP byte-shuffling loop in this system — agent-side local↔tunnel,
//! broker-side user↔tunnel — is the same shape: read, write, and reset a
//! rolling idle deadline on every successful transfer (spec §5 "Each stream
//! socket carries a rolling read deadline... reset on every successful
//! transfer"). `tokio`'s streams don't expose a `SetReadDeadline` the way
//! Go's `net.Conn` does, so the idiomatic equivalent is wrapping each read in
//! `tokio::time::timeout` and letting the loop itself be the deadline.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Default `conn_timeout` from spec §6, used when a caller passes `0`.
pub const DEFAULT_CONN_TIMEOUT_SECS: u64 = 3600;

pub fn conn_timeout_duration(seconds: u64) -> Duration {
    if seconds == 0 {
        Duration::from_secs(DEFAULT_CONN_TIMEOUT_SECS)
    } else {
        Duration::from_secs(seconds)
    }
}

/// Copy bytes from `reader` to `writer` until EOF, a read/write error, or an
/// idle gap exceeding `idle_timeout`. Returns the number of bytes copied on
/// clean EOF; returns `Err` on idle timeout (mapped to `io::ErrorKind::TimedOut`)
/// or any underlying I/O error, matching the source's `message.Copy`, which
/// resets the read deadline after every successful `io.CopyBuffer` chunk.
pub async fn copy_with_deadline_reset<R, W>(
    mut reader: R,
    mut writer: W,
    idle_timeout: Duration,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let read = match timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        };
        if read == 0 {
            writer.flush().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..read]).await?;
        total += read as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn copies_all_bytes_then_returns_on_eof() {
        let src = Cursor::new(b"hello world".to_vec());
        let mut dst = Vec::new();
        let n = copy_with_deadline_reset(src, &mut dst, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(n, 11);
        assert_eq!(dst, b"hello world");
    }

    #[tokio::test]
    async fn idle_timeout_surfaces_as_timed_out_error() {
        let (client, _server) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let err = copy_with_deadline_reset(reader, writer, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
