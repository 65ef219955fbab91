use thiserror::Error;

use crate::policy::PolicyError;

#[derive(Error, Debug)]
pub enum FlowmirrorError {
    #[error("Decode error: {0}")]
    DecodeError(#[from] flowmirror_common::DecodeError),

    #[error("Policy error: {0}")]
    PolicyError(#[from] PolicyError),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Template store error: {0}")]
    TemplateStoreError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Collector {protocol} is already {state}")]
    InvalidState { protocol: String, state: String },

    #[error("Raw socket error: {0}")]
    RawSocketError(String),

    #[error("Mirrored payload of {len} bytes exceeds {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowmirrorError>;
