//! Shared flow-telemetry types and the template-based wire codec
//!
//! This crate defines the decoded message model used across flowmirror:
//! - `Message` and its template / data FlowSets
//! - `decode` for NetFlow v9 and IPFIX datagrams against a `TemplateCache`
//! - `encode` for re-serializing (filtered) messages bit-exactly
//! - `JsonView` for rendering records onto message queues

pub mod decode;
pub mod element;
pub mod encode;
pub mod json;
pub mod message;

pub use decode::{decode, DecodeError, Decoded, TemplateCache};
pub use encode::{encode, encode_with_templates};
pub use json::JsonView;
pub use message::{
    DataFlowRecord, DataFlowSet, DecodedField, FieldSpecifier, FieldValue, Header, LengthPrefix,
    Message, SetHeader, TemplateKind, TemplateRecord, Version,
};

/// Data FlowSet IDs start here; lower IDs are reserved for template sets
pub const MIN_DATA_SET_ID: u16 = 256;

/// FlowSet / Set header size (ID + Length)
pub const SET_HEADER_LEN: usize = 4;

/// Declared field length marking an IPFIX variable-length field
pub const VARIABLE_LENGTH: u16 = 0xFFFF;
