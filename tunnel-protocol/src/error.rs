//! Error types shared by the frame codec and the port allow-list parser.

use thiserror::Error;

/// Failure modes for encoding/decoding a single [`crate::message::ControlMessage`]
/// frame, on either the length-prefixed stream transport or the bare datagram
/// transport.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The payload bytes did not deserialize into a `ControlMessage`.
    #[error("malformed control message: {0}")]
    Decode(String),

    /// The frame violated a protocol invariant (e.g. declared length over the
    /// configured cap). The connection should be closed.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure parsing a port allow-list specification such as `"1-100,443,8000-9000"`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllowListError {
    #[error("invalid port range `{0}`")]
    InvalidRange(String),

    #[error("invalid port number `{0}`")]
    InvalidPort(String),

    #[error("range `{min}-{max}` is empty or out of bounds")]
    OutOfBounds { min: u32, max: u32 },
}
