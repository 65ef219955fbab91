//! NetFlow v9 / IPFIX datagram decoding

use std::sync::Arc;

use bytes::Buf;
use thiserror::Error;

use crate::element::decode_value;
use crate::message::{
    DataFlowRecord, DataFlowSet, DecodedField, FieldSpecifier, FieldValue, Header, LengthPrefix,
    Message, TemplateRecord, Version,
};
use crate::{MIN_DATA_SET_ID, SET_HEADER_LEN};

const ENTERPRISE_BIT: u16 = 0x8000;

/// Template lookup the decoder resolves data FlowSets against.
///
/// Templates are scoped by agent and observation domain (source ID).
pub trait TemplateCache {
    fn get(&self, agent: &str, domain: u32, template_id: u16) -> Option<Arc<TemplateRecord>>;
    fn put(&self, agent: &str, domain: u32, template: TemplateRecord);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Datagram too short: {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },

    #[error("Unsupported export version {0}")]
    UnsupportedVersion(u16),

    #[error("Invalid length {length} for set {set_id}")]
    InvalidSetLength { set_id: u16, length: u16 },

    #[error("Set {set_id} declares {length} bytes but only {remaining} remain")]
    SetOverrun {
        set_id: u16,
        length: u16,
        remaining: usize,
    },

    #[error("Malformed template in set {set_id}: {reason}")]
    MalformedTemplate { set_id: u16, reason: &'static str },

    #[error("Template {template_id} not received from {agent} (domain {domain})")]
    MissingTemplate {
        agent: String,
        domain: u32,
        template_id: u16,
    },

    #[error("Record in set {set_id} runs past the set end")]
    TruncatedRecord { set_id: u16 },

    #[error("Reserved set ID {0}")]
    ReservedSetId(u16),
}

/// Result of a datagram decode.
///
/// `message` holds every FlowSet that could be decoded; `errors` lists the
/// ones that were skipped and why.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub message: Message,
    pub errors: Vec<DecodeError>,
}

impl Decoded {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Decodes one datagram received from `agent_id`.
///
/// Template sets are registered in `cache` as they are parsed, so data sets
/// later in the same datagram can use them. Only an unusable header is a
/// hard error.
pub fn decode<C>(agent_id: &str, payload: &[u8], cache: &C) -> Result<Decoded, DecodeError>
where
    C: TemplateCache + ?Sized,
{
    if payload.len() < 2 {
        return Err(DecodeError::Truncated {
            len: payload.len(),
            need: 2,
        });
    }
    let number = u16::from_be_bytes([payload[0], payload[1]]);
    let version = Version::from_number(number).ok_or(DecodeError::UnsupportedVersion(number))?;
    if payload.len() < version.header_len() {
        return Err(DecodeError::Truncated {
            len: payload.len(),
            need: version.header_len(),
        });
    }

    let mut buf = payload;
    let header = read_header(version, &mut buf);
    if version == Version::Ipfix {
        // Message length may be shorter than the datagram
        let declared = header.count as usize;
        if declared >= version.header_len() && declared <= payload.len() {
            buf = &payload[version.header_len()..declared];
        }
    }

    let mut message = Message {
        agent_id: agent_id.to_string(),
        header,
        template_records: Vec::new(),
        data_flow_sets: Vec::new(),
    };
    let mut errors = Vec::new();

    while buf.remaining() >= SET_HEADER_LEN {
        let set_id = buf.get_u16();
        let length = buf.get_u16();
        if (length as usize) < SET_HEADER_LEN {
            errors.push(DecodeError::InvalidSetLength { set_id, length });
            break;
        }
        let body_len = length as usize - SET_HEADER_LEN;
        if body_len > buf.remaining() {
            errors.push(DecodeError::SetOverrun {
                set_id,
                length,
                remaining: buf.remaining(),
            });
            break;
        }
        let (body, rest) = buf.split_at(body_len);
        buf = rest;

        let (templates, err) = if set_id == version.template_set_id() {
            read_templates(version, set_id, body)
        } else if set_id == version.options_template_set_id() {
            read_options_templates(version, set_id, body)
        } else if set_id >= MIN_DATA_SET_ID {
            match cache.get(agent_id, header.source_id, set_id) {
                Some(template) => {
                    let (set, err) = read_data_set(version, set_id, body, &template);
                    if !set.records.is_empty() {
                        message.data_flow_sets.push(set);
                    }
                    if let Some(err) = err {
                        errors.push(err);
                    }
                }
                None => errors.push(DecodeError::MissingTemplate {
                    agent: agent_id.to_string(),
                    domain: header.source_id,
                    template_id: set_id,
                }),
            }
            continue;
        } else {
            errors.push(DecodeError::ReservedSetId(set_id));
            continue;
        };

        for template in templates {
            cache.put(agent_id, header.source_id, template.clone());
            message.template_records.push(template);
        }
        if let Some(err) = err {
            errors.push(err);
        }
    }

    Ok(Decoded { message, errors })
}

fn read_header(version: Version, buf: &mut &[u8]) -> Header {
    let number = buf.get_u16();
    debug_assert_eq!(number, version.number());
    match version {
        Version::NetflowV9 => Header {
            version,
            count: buf.get_u16(),
            sys_uptime: buf.get_u32(),
            unix_secs: buf.get_u32(),
            sequence: buf.get_u32(),
            source_id: buf.get_u32(),
        },
        Version::Ipfix => Header {
            version,
            count: buf.get_u16(),
            sys_uptime: 0,
            unix_secs: buf.get_u32(),
            sequence: buf.get_u32(),
            source_id: buf.get_u32(),
        },
    }
}

fn read_specifiers(
    version: Version,
    set_id: u16,
    body: &mut &[u8],
    count: usize,
) -> Result<Vec<FieldSpecifier>, DecodeError> {
    let mut specifiers = Vec::with_capacity(count);
    for _ in 0..count {
        if body.remaining() < 4 {
            return Err(DecodeError::MalformedTemplate {
                set_id,
                reason: "field specifier truncated",
            });
        }
        let raw_id = body.get_u16();
        let length = body.get_u16();
        if version == Version::Ipfix && raw_id & ENTERPRISE_BIT != 0 {
            if body.remaining() < 4 {
                return Err(DecodeError::MalformedTemplate {
                    set_id,
                    reason: "enterprise number truncated",
                });
            }
            let enterprise = body.get_u32();
            specifiers.push(FieldSpecifier::enterprise(
                raw_id & !ENTERPRISE_BIT,
                length,
                enterprise,
            ));
        } else {
            specifiers.push(FieldSpecifier::new(raw_id, length));
        }
    }
    Ok(specifiers)
}

fn check_template_id(set_id: u16, template_id: u16) -> Result<(), DecodeError> {
    if template_id < MIN_DATA_SET_ID {
        return Err(DecodeError::MalformedTemplate {
            set_id,
            reason: "template ID below 256",
        });
    }
    Ok(())
}

/// Templates parsed before a malformed one are kept.
fn read_templates(
    version: Version,
    set_id: u16,
    mut body: &[u8],
) -> (Vec<TemplateRecord>, Option<DecodeError>) {
    let mut templates = Vec::new();
    while body.remaining() >= 4 {
        let template_id = body.get_u16();
        let field_count = body.get_u16() as usize;
        if field_count == 0 {
            // IPFIX withdrawal or padding
            continue;
        }
        let fields = check_template_id(set_id, template_id)
            .and_then(|()| read_specifiers(version, set_id, &mut body, field_count));
        match fields {
            Ok(fields) => templates.push(TemplateRecord::new(template_id, fields)),
            Err(err) => return (templates, Some(err)),
        }
    }
    (templates, None)
}

fn read_options_template(
    version: Version,
    set_id: u16,
    body: &mut &[u8],
) -> Result<TemplateRecord, DecodeError> {
    let template_id = body.get_u16();
    let (scope_count, option_count) = match version {
        Version::NetflowV9 => {
            let scope_len = body.get_u16() as usize;
            let option_len = body.get_u16() as usize;
            if scope_len % 4 != 0 || option_len % 4 != 0 {
                return Err(DecodeError::MalformedTemplate {
                    set_id,
                    reason: "scope or option length not a multiple of 4",
                });
            }
            (scope_len / 4, option_len / 4)
        }
        Version::Ipfix => {
            let field_count = body.get_u16() as usize;
            let scope_count = body.get_u16() as usize;
            if scope_count == 0 || scope_count > field_count {
                return Err(DecodeError::MalformedTemplate {
                    set_id,
                    reason: "invalid scope field count",
                });
            }
            (scope_count, field_count - scope_count)
        }
    };
    check_template_id(set_id, template_id)?;
    let scope_fields = read_specifiers(version, set_id, body, scope_count)?;
    let fields = read_specifiers(version, set_id, body, option_count)?;
    Ok(TemplateRecord::options(template_id, scope_fields, fields))
}

/// Templates parsed before a malformed one are kept.
fn read_options_templates(
    version: Version,
    set_id: u16,
    mut body: &[u8],
) -> (Vec<TemplateRecord>, Option<DecodeError>) {
    let mut templates = Vec::new();
    while body.remaining() >= 6 {
        match read_options_template(version, set_id, &mut body) {
            Ok(template) => templates.push(template),
            Err(err) => return (templates, Some(err)),
        }
    }
    (templates, None)
}

fn take_field<'a>(
    version: Version,
    specifier: &FieldSpecifier,
    body: &mut &'a [u8],
) -> Option<(&'a [u8], LengthPrefix)> {
    let (len, prefix) = if version == Version::Ipfix && specifier.is_variable_length() {
        let first = *body.first()?;
        if first < 255 {
            body.advance(1);
            (first as usize, LengthPrefix::Short)
        } else {
            if body.len() < 3 {
                return None;
            }
            let len = u16::from_be_bytes([body[1], body[2]]) as usize;
            body.advance(3);
            (len, LengthPrefix::Long)
        }
    } else {
        (specifier.length as usize, LengthPrefix::None)
    };
    let slice: &'a [u8] = body;
    if slice.len() < len {
        return None;
    }
    let (raw, rest) = slice.split_at(len);
    *body = rest;
    Some((raw, prefix))
}

/// Reads records until the remainder is shorter than the template's minimum
/// record size (trailing padding). A record running past the set end stops
/// the set; records before it are kept.
fn read_data_set(
    version: Version,
    set_id: u16,
    mut body: &[u8],
    template: &TemplateRecord,
) -> (DataFlowSet, Option<DecodeError>) {
    let min_len = template.min_record_len().max(1);
    let mut records = Vec::new();
    let mut error = None;

    'records: while body.len() >= min_len {
        let before = body.len();
        let mut fields = Vec::with_capacity(template.field_count());
        for specifier in template.specifiers() {
            let Some((raw, prefix)) = take_field(version, specifier, &mut body) else {
                error = Some(DecodeError::TruncatedRecord { set_id });
                break 'records;
            };
            let value = if prefix == LengthPrefix::None {
                decode_value(specifier.element_id, raw)
            } else {
                FieldValue::Bytes(raw.to_vec())
            };
            fields.push(DecodedField {
                element_id: specifier.element_id,
                value,
                prefix,
            });
        }
        // zero-length templates never advance
        if body.len() == before {
            break;
        }
        records.push(DataFlowRecord::new(fields));
    }

    (DataFlowSet::new(set_id, records), error)
}
