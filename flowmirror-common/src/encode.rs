//! Re-serialization of (filtered) messages

use bytes::{BufMut, BytesMut};

use crate::message::{
    DataFlowSet, FieldSpecifier, LengthPrefix, Message, TemplateKind, TemplateRecord, Version,
};
use crate::SET_HEADER_LEN;

const ENTERPRISE_BIT: u16 = 0x8000;

/// Encodes `message` with a new sequence number, its own templates and the
/// given data FlowSets.
pub fn encode(message: &Message, sequence: u32, flow_sets: &[DataFlowSet]) -> Vec<u8> {
    encode_with_templates(message, sequence, &message.template_records, flow_sets)
}

/// Encodes the header of `message` followed by `templates` and `flow_sets`.
///
/// Data templates go into one template set and options templates into one
/// options template set. Every set length is taken from the bytes actually
/// written, so filtered FlowSets stay self-consistent.
pub fn encode_with_templates(
    message: &Message,
    sequence: u32,
    templates: &[TemplateRecord],
    flow_sets: &[DataFlowSet],
) -> Vec<u8> {
    let header = &message.header;
    let version = header.version;
    let mut buf = BytesMut::with_capacity(1500);

    buf.put_u16(version.number());
    match version {
        Version::NetflowV9 => {
            let records: usize = flow_sets.iter().map(|set| set.records.len()).sum();
            buf.put_u16(saturate(records + templates.len()));
            buf.put_u32(header.sys_uptime);
        }
        Version::Ipfix => {
            // Message length, patched below
            buf.put_u16(0);
        }
    }
    buf.put_u32(header.unix_secs);
    buf.put_u32(sequence);
    buf.put_u32(header.source_id);

    let data_templates: Vec<_> = templates
        .iter()
        .filter(|t| t.kind == TemplateKind::Data)
        .collect();
    let options_templates: Vec<_> = templates
        .iter()
        .filter(|t| t.kind == TemplateKind::Options)
        .collect();

    if !data_templates.is_empty() {
        let start = begin_set(&mut buf, version.template_set_id());
        for template in data_templates {
            buf.put_u16(template.template_id);
            buf.put_u16(saturate(template.fields.len()));
            put_specifiers(&mut buf, &template.fields);
        }
        finish_set(&mut buf, start);
    }

    if !options_templates.is_empty() {
        let start = begin_set(&mut buf, version.options_template_set_id());
        for template in options_templates {
            buf.put_u16(template.template_id);
            match version {
                Version::NetflowV9 => {
                    buf.put_u16(saturate(specifiers_len(&template.scope_fields)));
                    buf.put_u16(saturate(specifiers_len(&template.fields)));
                }
                Version::Ipfix => {
                    buf.put_u16(saturate(template.field_count()));
                    buf.put_u16(saturate(template.scope_field_count()));
                }
            }
            put_specifiers(&mut buf, &template.scope_fields);
            put_specifiers(&mut buf, &template.fields);
        }
        finish_set(&mut buf, start);
    }

    for set in flow_sets {
        let start = begin_set(&mut buf, set.header.flowset_id);
        for record in &set.records {
            for field in &record.fields {
                let len = field.value.wire_len();
                match field.prefix {
                    LengthPrefix::None => {}
                    LengthPrefix::Short => buf.put_u8(len as u8),
                    LengthPrefix::Long => {
                        buf.put_u8(255);
                        buf.put_u16(saturate(len));
                    }
                }
                field.value.put(&mut buf);
            }
        }
        finish_set(&mut buf, start);
    }

    if version == Version::Ipfix {
        let total = saturate(buf.len()).to_be_bytes();
        buf[2..4].copy_from_slice(&total);
    }

    buf.to_vec()
}

fn saturate(n: usize) -> u16 {
    u16::try_from(n).unwrap_or(u16::MAX)
}

fn specifiers_len(specifiers: &[FieldSpecifier]) -> usize {
    specifiers.iter().map(FieldSpecifier::wire_len).sum()
}

fn put_specifiers(buf: &mut BytesMut, specifiers: &[FieldSpecifier]) {
    for specifier in specifiers {
        match specifier.enterprise {
            Some(enterprise) => {
                buf.put_u16(specifier.element_id | ENTERPRISE_BIT);
                buf.put_u16(specifier.length);
                buf.put_u32(enterprise);
            }
            None => {
                buf.put_u16(specifier.element_id);
                buf.put_u16(specifier.length);
            }
        }
    }
}

fn begin_set(buf: &mut BytesMut, set_id: u16) -> usize {
    let start = buf.len();
    buf.put_u16(set_id);
    buf.put_u16(0);
    start
}

fn finish_set(buf: &mut BytesMut, start: usize) {
    let length = saturate(buf.len() - start);
    debug_assert!(length as usize >= SET_HEADER_LEN);
    buf[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::decode::tests::{v9_data_set, v9_header, v9_template_set, MemoryCache};

    #[test]
    fn test_reencode_is_byte_identical() {
        let cache = MemoryCache::default();
        let mut packet = v9_header(3, 10, 1);
        packet.extend(v9_template_set());
        packet.extend(v9_data_set(&[([10, 0, 0, 1], 80), ([10, 0, 0, 2], 443)]));

        let decoded = decode("agent", &packet, &cache).expect("Should decode");
        let message = decoded.message;
        let encoded = encode(&message, 10, &message.data_flow_sets);
        assert_eq!(encoded, packet);
    }

    #[test]
    fn test_filtered_set_gets_new_length_and_sequence() {
        let cache = MemoryCache::default();
        let mut packet = v9_header(3, 10, 1);
        packet.extend(v9_template_set());
        packet.extend(v9_data_set(&[([10, 0, 0, 1], 80), ([10, 0, 0, 2], 443)]));
        let message = decode("agent", &packet, &cache).expect("Should decode").message;

        let filtered = DataFlowSet::new(256, message.data_flow_sets[0].records[..1].to_vec());
        let encoded = encode_with_templates(&message, 77, &[], &[filtered]);

        let mut expected = v9_header(1, 77, 1);
        expected.extend(v9_data_set(&[([10, 0, 0, 1], 80)]));
        assert_eq!(encoded, expected);
    }

    #[test]
    fn test_ipfix_roundtrip_with_options_and_varlen() {
        let cache = MemoryCache::default();
        let mut body = Vec::new();
        body.extend_from_slice(&[0, 2, 0, 20, 1, 144, 0, 2]);
        body.extend_from_slice(&[0, 82, 0xff, 0xff]);
        body.extend_from_slice(&[0x80, 1, 0, 4, 0, 0, 0x7a, 0x69]);
        body.extend_from_slice(&[0, 3, 0, 18, 1, 145, 0, 2, 0, 1, 0, 149, 0, 4, 0, 34, 0, 4]);
        body.extend_from_slice(&[1, 144, 0, 13, 4, b'e', b't', b'h', b'0', 0, 0, 0, 9]);

        let total = (16 + body.len()) as u16;
        let mut packet = Vec::new();
        packet.extend_from_slice(&10u16.to_be_bytes());
        packet.extend_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        packet.extend_from_slice(&5u32.to_be_bytes());
        packet.extend_from_slice(&99u32.to_be_bytes());
        packet.extend(body);

        let decoded = decode("agent", &packet, &cache).expect("Should decode");
        assert!(decoded.is_complete(), "{:?}", decoded.errors);
        let message = decoded.message;
        assert_eq!(message.template_records.len(), 2);

        let encoded = encode(&message, 5, &message.data_flow_sets);
        assert_eq!(encoded, packet);
    }
}
