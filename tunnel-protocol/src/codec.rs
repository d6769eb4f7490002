//! # Frame codec (spec §4.1)
//!
//! Stream framing: a little-endian `u32` length `L` followed by `L` payload
//! bytes, the payload being a `bincode`-serialized [`ControlMessage`].
//! Implemented as a [`tokio_util::codec::{Decoder, Encoder}`] pair so both
//! binaries drive it through `Framed`/`FramedRead`/`FramedWrite` instead of
//! hand-rolling buffered reads — the idiomatic way this corpus wires up
//! length-prefixed protocols over `tokio`.
//!
//! Datagram framing (UDP) carries one serialized `ControlMessage` per
//! datagram with no length prefix; see [`encode_datagram`]/[`decode_datagram`].

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::message::ControlMessage;

/// Hard cap on a single stream frame's payload, to bound attacker memory
/// (spec §4.1). Frames over this size close the connection with a
/// `ProtocolError`.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Minimum per-stream read buffer the spec calls for; `Framed` grows its
/// buffer on demand, so this is only used as the initial reservation.
pub const STREAM_READ_BUFFER: usize = 32 * 1024;

/// MTU × 2: the receive buffer sized for a single UDP datagram.
pub const UDP_RECV_BUFFER: usize = 3000;

/// Keep encoded UDP payloads under this to survive fragmentation on common
/// paths (spec §6).
pub const UDP_MAX_PAYLOAD: usize = 2960;

const LEN_PREFIX_BYTES: usize = 4;

/// `tokio_util::codec` implementation of the stream framing above.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = ControlMessage;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX_BYTES {
            // Not enough to even read the length prefix yet.
            return Ok(None);
        }

        let len = u32::from_le_bytes(src[..LEN_PREFIX_BYTES].try_into().unwrap()) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(FrameError::Protocol(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte cap"
            )));
        }

        let total = LEN_PREFIX_BYTES + len;
        if src.len() < total {
            // Transient "need more bytes" — reserve the rest and wait for
            // another read rather than dropping what we already have.
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(LEN_PREFIX_BYTES);

        let msg: ControlMessage =
            bincode::deserialize(&frame).map_err(|e| FrameError::Decode(e.to_string()))?;
        Ok(Some(msg))
    }
}

impl Encoder<&ControlMessage> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload =
            bincode::serialize(item).map_err(|e| FrameError::Decode(e.to_string()))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::Protocol(format!(
                "outgoing frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte cap",
                payload.len()
            )));
        }
        dst.reserve(LEN_PREFIX_BYTES + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Encoder<ControlMessage> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&ControlMessage>::encode(self, &item, dst)
    }
}

/// Serialize a `ControlMessage` for a bare UDP datagram (no length prefix).
pub fn encode_datagram(msg: &ControlMessage) -> Result<Vec<u8>, FrameError> {
    let bytes = bincode::serialize(msg).map_err(|e| FrameError::Decode(e.to_string()))?;
    if bytes.len() > UDP_MAX_PAYLOAD {
        return Err(FrameError::Protocol(format!(
            "datagram payload of {} bytes exceeds the {UDP_MAX_PAYLOAD} byte cap",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Deserialize a bare UDP datagram payload into a `ControlMessage`.
pub fn decode_datagram(buf: &[u8]) -> Result<ControlMessage, FrameError> {
    bincode::deserialize(buf).map_err(|e| FrameError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Network, Service};

    fn sample_message() -> ControlMessage {
        ControlMessage::new_service(
            Service {
                network: Network::Tcp,
                proxy_port: "6100".into(),
                local_addr: "127.0.0.1:7000".into(),
            },
            "tcp6100".into(),
            "secret",
        )
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let msg = sample_message();
        let mut buf = BytesMut::new();
        let mut codec = FrameCodec;
        Encoder::<&ControlMessage>::encode(&mut codec, &msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn byte_by_byte_delivery_yields_same_sequence_as_atomic() {
        // P2: feeding the codec one byte at a time must reproduce exactly
        // the frames that atomic delivery would.
        let messages = vec![sample_message(), ControlMessage::keep_alive("secret")];
        let mut whole = BytesMut::new();
        let mut codec = FrameCodec;
        for m in &messages {
            Encoder::<&ControlMessage>::encode(&mut codec, m, &mut whole).unwrap();
        }

        let mut trickled = BytesMut::new();
        let mut decoded = Vec::new();
        let mut codec = FrameCodec;
        for byte in whole.iter().copied() {
            trickled.put_u8(byte);
            while let Some(msg) = codec.decode(&mut trickled).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, messages);
    }

    #[test]
    fn incomplete_frame_yields_need_more_not_error() {
        let msg = sample_message();
        let mut buf = BytesMut::new();
        let mut codec = FrameCodec;
        Encoder::<&ControlMessage>::encode(&mut codec, &msg, &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME_SIZE + 1) as u32);
        let mut codec = FrameCodec;
        match codec.decode(&mut buf) {
            Err(FrameError::Protocol(_)) => {}
            other => panic!("expected Protocol error, got {other:?}"),
        }
    }

    #[test]
    fn datagram_round_trip() {
        let msg = sample_message();
        let bytes = encode_datagram(&msg).unwrap();
        let decoded = decode_datagram(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
