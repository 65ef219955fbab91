//! UDP ingestion
//!
//! One `Collector` per protocol reads datagrams into pooled buffers and
//! feeds a bounded channel drained by a resizable pool of decode workers.

pub mod buffer;
pub mod netflow;
pub mod pipeline;
pub mod workers;

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

pub use buffer::{BufferPool, PooledBuffer};
pub use netflow::{NetflowHandler, QueueOutput};
pub use pipeline::{Collector, CollectorConfig};
pub use workers::{ScaleDecision, ScalingPolicy, WorkerBudget, WorkerPool};

/// One received UDP payload and its sender
pub struct Datagram {
    pub source: SocketAddr,
    pub payload: PooledBuffer,
}

/// Counters a handler exposes for status snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerCounters {
    pub decoded: u64,
    pub decode_errors: u64,
    pub mq_errors: u64,
    pub message_queue: usize,
    pub lost: u64,
}

/// Work done by a decode worker for each datagram
pub trait DatagramHandler: Send + Sync {
    fn handle(&self, datagram: Datagram);

    /// Called once, after every worker has exited
    fn shutdown(&self) {}

    fn counters(&self) -> HandlerCounters {
        HandlerCounters::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectorState {
    Stopped,
    Running,
    Draining,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            CollectorState::Stopped => "stopped",
            CollectorState::Running => "running",
            CollectorState::Draining => "draining",
        };
        f.write_str(state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CollectorStatus {
    pub state: CollectorState,
    #[serde(rename = "UDPQueue")]
    pub udp_queue: usize,
    pub message_queue: usize,
    #[serde(rename = "UDPCount")]
    pub udp_count: u64,
    pub decoded_count: u64,
    pub decode_error_count: u64,
    #[serde(rename = "MQErrorCount")]
    pub mq_error_count: u64,
    pub lost_count: u64,
    /// Unix seconds of the last start, 0 when never started
    pub start_time: u64,
    pub workers: usize,
}
