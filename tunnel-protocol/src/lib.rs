//! Wire schema, frame codec and shared primitives for the tunnel
//! broker/agent pair.
//!
//! This crate is the "leaves first" bottom of the system: it knows nothing
//! about sockets being control connections vs. tunnels vs. user traffic, it
//! just encodes/decodes [`message::ControlMessage`] and offers the handful
//! of utilities (port allow-list, address joining, deadline-resetting copy,
//! single-shot close) that both binaries would otherwise duplicate.

pub mod addr;
pub mod allowlist;
pub mod codec;
pub mod error;
pub mod forward;
pub mod message;
pub mod once_close;

pub use codec::FrameCodec;
pub use error::{AllowListError, FrameError};
pub use message::{ControlMessage, Network, Service, Verb};
pub use once_close::OnceClose;
