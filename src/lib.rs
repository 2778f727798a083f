//! media-bridge: per-session WebRTC bridge for a local RTP producer
//!
//! Each remote peer that posts an offer gets its own pipeline: a leased
//! local UDP port, a media producer process aimed at that port, and a
//! relay forwarding every RTP unit into the peer's outbound video track.
//!
//! ```text
//!  POST /offer ──► SessionCoordinator ──► RTCPeerConnection ◄── browser
//!                        │
//!                        ├── PortAllocator ──► leased port N
//!                        ├── MediaSource ────► rtp://127.0.0.1:N
//!                        └── PacketPump: socket N ──► outbound track
//! ```
//!
//! Teardown is a single cancellation signal per session: it stops the
//! producer and the relay, closes the peer connection, and releases the
//! port lease.

pub mod api;
pub mod config;
pub mod error;
pub mod port;
pub mod relay;
pub mod session;
pub mod source;

pub use config::Config;
pub use error::{Error, Result};
pub use port::{PortAllocator, PortLease};
pub use session::{Session, SessionCoordinator, SessionState};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_version_is_set() {
        assert!(!super::version().is_empty());
    }
}
