//! Connection Manager: one authenticated, flow-controlled connection per peer.
//!
//! A connection moves through `Connecting -> Handshaking -> Established -> Draining ->
//! Closed`. Once established it runs a writer, a reader and a keepalive task, all of which
//! stop when the connection closes. Establishment and closure are published as
//! [ConnectionEvent]s so that the node can react, e.g. by looking for a replacement peer.
mod handshake;
mod manager;
mod state;

pub use handshake::{negotiate, Hello, Proof, SessionParams};
pub use manager::{Connection, ConnectionManager};
pub use state::ConnectionState;

use crate::zfx_id::Id;

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Consecutive heartbeat intervals without hearing from the peer before it is
    /// considered lost.
    pub missed_heartbeats: u32,
    pub drain_timeout_ms: u64,
    /// Messages queued for the writer task.
    pub outbound_queue: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            handshake_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            missed_heartbeats: 3,
            drain_timeout_ms: 5_000,
            outbound_queue: 1024,
        }
    }
}

impl ConnectionSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn keepalive_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats.max(1)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally.
    Requested,
    /// The peer sent a close with this reason.
    Remote(String),
    KeepaliveTimeout,
    ProtocolViolation(String),
    /// The underlying stream ended or failed.
    StreamClosed,
    /// Another connection to the same peer won.
    Superseded,
}

impl CloseReason {
    /// Whether the peer should be treated as lost and replaced.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CloseReason::KeepaliveTimeout | CloseReason::ProtocolViolation(_) | CloseReason::StreamClosed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Established { peer: Id, address: Option<SocketAddr> },
    Closed { peer: Id, reason: CloseReason },
}
