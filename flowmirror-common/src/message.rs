//! Decoded NetFlow v9 / IPFIX message model

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{SET_HEADER_LEN, VARIABLE_LENGTH};

/// Export protocol of a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    NetflowV9,
    Ipfix,
}

impl Version {
    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            9 => Some(Version::NetflowV9),
            10 => Some(Version::Ipfix),
            _ => None,
        }
    }

    pub const fn number(self) -> u16 {
        match self {
            Version::NetflowV9 => 9,
            Version::Ipfix => 10,
        }
    }

    /// Size of the message header on the wire
    pub const fn header_len(self) -> usize {
        match self {
            Version::NetflowV9 => 20,
            Version::Ipfix => 16,
        }
    }

    pub const fn template_set_id(self) -> u16 {
        match self {
            Version::NetflowV9 => 0,
            Version::Ipfix => 2,
        }
    }

    pub const fn options_template_set_id(self) -> u16 {
        match self {
            Version::NetflowV9 => 1,
            Version::Ipfix => 3,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Version::NetflowV9 => "netflow9",
            Version::Ipfix => "ipfix",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message header
///
/// For IPFIX, `count` carries the message length and `sys_uptime` is zero;
/// `unix_secs` holds the export time and `source_id` the observation domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: Version,
    pub count: u16,
    pub sys_uptime: u32,
    pub unix_secs: u32,
    pub sequence: u32,
    pub source_id: u32,
}

/// One (element, length) pair of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSpecifier {
    pub element_id: u16,
    pub length: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise: Option<u32>,
}

impl FieldSpecifier {
    pub const fn new(element_id: u16, length: u16) -> Self {
        Self {
            element_id,
            length,
            enterprise: None,
        }
    }

    pub const fn enterprise(element_id: u16, length: u16, enterprise: u32) -> Self {
        Self {
            element_id,
            length,
            enterprise: Some(enterprise),
        }
    }

    pub const fn is_variable_length(&self) -> bool {
        self.length == VARIABLE_LENGTH
    }

    /// Bytes this specifier occupies inside a template record
    pub const fn wire_len(&self) -> usize {
        if self.enterprise.is_some() {
            8
        } else {
            4
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemplateKind {
    Data,
    Options,
}

/// A data or options template as announced by an exporter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub template_id: u16,
    pub kind: TemplateKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope_fields: Vec<FieldSpecifier>,
    pub fields: Vec<FieldSpecifier>,
}

impl TemplateRecord {
    pub fn new(template_id: u16, fields: Vec<FieldSpecifier>) -> Self {
        Self {
            template_id,
            kind: TemplateKind::Data,
            scope_fields: Vec::new(),
            fields,
        }
    }

    pub fn options(
        template_id: u16,
        scope_fields: Vec<FieldSpecifier>,
        fields: Vec<FieldSpecifier>,
    ) -> Self {
        Self {
            template_id,
            kind: TemplateKind::Options,
            scope_fields,
            fields,
        }
    }

    pub fn is_options(&self) -> bool {
        self.kind == TemplateKind::Options
    }

    pub fn field_count(&self) -> usize {
        self.scope_fields.len() + self.fields.len()
    }

    pub fn scope_field_count(&self) -> usize {
        self.scope_fields.len()
    }

    /// Scope fields first, then the regular fields, in record order
    pub fn specifiers(&self) -> impl Iterator<Item = &FieldSpecifier> {
        self.scope_fields.iter().chain(self.fields.iter())
    }

    /// Smallest possible data record; variable-length fields count one prefix byte
    pub fn min_record_len(&self) -> usize {
        self.specifiers()
            .map(|specifier| {
                if specifier.is_variable_length() {
                    1
                } else {
                    specifier.length as usize
                }
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetHeader {
    pub flowset_id: u16,
    pub length: u16,
}

/// Variable-length prefix form a field arrived with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthPrefix {
    /// Fixed-length field
    #[default]
    None,
    /// One length byte
    Short,
    /// 255 followed by a two-byte length
    Long,
}

impl LengthPrefix {
    pub fn for_len(len: usize) -> Self {
        if len < 255 {
            LengthPrefix::Short
        } else {
            LengthPrefix::Long
        }
    }

    pub const fn wire_len(self) -> usize {
        match self {
            LengthPrefix::None => 0,
            LengthPrefix::Short => 1,
            LengthPrefix::Long => 3,
        }
    }
}

/// Typed value of a single field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Unsigned { value: u64, width: u8 },
    Signed { value: i64, width: u8 },
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Mac([u8; 6]),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Number of value bytes on the wire, excluding any length prefix
    pub fn wire_len(&self) -> usize {
        match self {
            FieldValue::Unsigned { width, .. } | FieldValue::Signed { width, .. } => {
                *width as usize
            }
            FieldValue::Ipv4(_) => 4,
            FieldValue::Ipv6(_) => 16,
            FieldValue::Mac(_) => 6,
            FieldValue::Bytes(raw) => raw.len(),
        }
    }

    /// Integer view used for port and direction matching
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Unsigned { value, .. } => Some(*value),
            FieldValue::Signed { value, .. } => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn put<B: BufMut>(&self, buf: &mut B) {
        match self {
            FieldValue::Unsigned { value, width } => {
                let be = value.to_be_bytes();
                buf.put_slice(&be[8 - *width as usize..]);
            }
            FieldValue::Signed { value, width } => {
                let be = value.to_be_bytes();
                buf.put_slice(&be[8 - *width as usize..]);
            }
            FieldValue::Ipv4(addr) => buf.put_slice(&addr.octets()),
            FieldValue::Ipv6(addr) => buf.put_slice(&addr.octets()),
            FieldValue::Mac(mac) => buf.put_slice(mac),
            FieldValue::Bytes(raw) => buf.put_slice(raw),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Unsigned { value, .. } => write!(f, "{value}"),
            FieldValue::Signed { value, .. } => write!(f, "{value}"),
            FieldValue::Ipv4(addr) => write!(f, "{addr}"),
            FieldValue::Ipv6(addr) => write!(f, "{addr}"),
            FieldValue::Mac(mac) => write!(
                f,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            FieldValue::Bytes(raw) => {
                f.write_str("0x")?;
                for b in raw {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedField {
    pub element_id: u16,
    pub value: FieldValue,
    pub prefix: LengthPrefix,
}

impl DecodedField {
    pub fn new(element_id: u16, value: FieldValue) -> Self {
        Self {
            element_id,
            value,
            prefix: LengthPrefix::None,
        }
    }

    pub fn wire_len(&self) -> usize {
        self.prefix.wire_len() + self.value.wire_len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataFlowRecord {
    pub fields: Vec<DecodedField>,
}

impl DataFlowRecord {
    pub fn new(fields: Vec<DecodedField>) -> Self {
        Self { fields }
    }

    /// First field carrying `element_id`
    pub fn get(&self, element_id: u16) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.element_id == element_id)
            .map(|field| &field.value)
    }

    pub fn wire_len(&self) -> usize {
        self.fields.iter().map(DecodedField::wire_len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFlowSet {
    pub header: SetHeader,
    pub records: Vec<DataFlowRecord>,
}

impl DataFlowSet {
    /// Builds a set whose header length matches the records it carries
    pub fn new(flowset_id: u16, records: Vec<DataFlowRecord>) -> Self {
        let length = SET_HEADER_LEN + records.iter().map(DataFlowRecord::wire_len).sum::<usize>();
        Self {
            header: SetHeader {
                flowset_id,
                length: u16::try_from(length).unwrap_or(u16::MAX),
            },
            records,
        }
    }

    pub fn template_id(&self) -> u16 {
        self.header.flowset_id
    }
}

/// One decoded export datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub agent_id: String,
    pub header: Header,
    pub template_records: Vec<TemplateRecord>,
    pub data_flow_sets: Vec<DataFlowSet>,
}

impl Message {
    pub fn version(&self) -> Version {
        self.header.version
    }

    /// Observation domain / source ID the templates are scoped to
    pub fn domain(&self) -> u32 {
        self.header.source_id
    }

    pub fn record_count(&self) -> usize {
        self.data_flow_sets.iter().map(|set| set.records.len()).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = &DataFlowRecord> {
        self.data_flow_sets.iter().flat_map(|set| set.records.iter())
    }
}
