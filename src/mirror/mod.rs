//! Mirroring of decoded flow traffic to downstream collectors

pub mod engine;
pub mod filter;
pub mod raw;

use serde::Serialize;

pub use engine::{MirrorEngine, DEFAULT_SOURCE_PORT};
pub use raw::{RawConn, RawTransport, Socket2Transport, SocketPool};

/// Point-in-time counters of one mirror engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MirrorStatus {
    pub queue_size: usize,
    pub message_received_count: u64,
    pub raw_sent_count: u64,
    pub raw_error_count: u64,
    pub dropped_count: u64,
}
