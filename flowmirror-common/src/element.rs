//! Information element IDs and value typing

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::message::FieldValue;

pub const IPV4_SRC_ADDR: u16 = 8;
pub const INPUT_SNMP: u16 = 10;
pub const IPV4_DST_ADDR: u16 = 12;
pub const OUTPUT_SNMP: u16 = 14;
pub const IPV4_NEXT_HOP: u16 = 15;
pub const BGP_IPV4_NEXT_HOP: u16 = 18;
pub const IPV6_SRC_ADDR: u16 = 27;
pub const IPV6_DST_ADDR: u16 = 28;
pub const IPV4_SRC_PREFIX: u16 = 44;
pub const IPV4_DST_PREFIX: u16 = 45;
pub const MPLS_TOP_LABEL_IPV4: u16 = 47;
pub const IN_SRC_MAC: u16 = 56;
pub const OUT_DST_MAC: u16 = 57;
pub const FLOW_DIRECTION: u16 = 61;
pub const IPV6_NEXT_HOP: u16 = 62;
pub const BGP_IPV6_NEXT_HOP: u16 = 63;
pub const IN_DST_MAC: u16 = 80;
pub const OUT_SRC_MAC: u16 = 81;
pub const EXPORTER_IPV4_ADDR: u16 = 130;
pub const EXPORTER_IPV6_ADDR: u16 = 131;
pub const POST_NAT_SRC_IPV4_ADDR: u16 = 225;
pub const POST_NAT_DST_IPV4_ADDR: u16 = 226;
pub const FLOW_START_DELTA_MICROSECONDS: u16 = 434;

const IPV4_ELEMENTS: [u16; 10] = [
    IPV4_SRC_ADDR,
    IPV4_DST_ADDR,
    IPV4_NEXT_HOP,
    BGP_IPV4_NEXT_HOP,
    IPV4_SRC_PREFIX,
    IPV4_DST_PREFIX,
    MPLS_TOP_LABEL_IPV4,
    EXPORTER_IPV4_ADDR,
    POST_NAT_SRC_IPV4_ADDR,
    POST_NAT_DST_IPV4_ADDR,
];

const IPV6_ELEMENTS: [u16; 5] = [
    IPV6_SRC_ADDR,
    IPV6_DST_ADDR,
    IPV6_NEXT_HOP,
    BGP_IPV6_NEXT_HOP,
    EXPORTER_IPV6_ADDR,
];

const MAC_ELEMENTS: [u16; 4] = [IN_SRC_MAC, OUT_DST_MAC, IN_DST_MAC, OUT_SRC_MAC];

const SIGNED_ELEMENTS: [u16; 1] = [FLOW_START_DELTA_MICROSECONDS];

/// Types raw field bytes by element ID and length.
///
/// Address and MAC elements are only typed as such when the length matches;
/// anything else up to eight bytes is a big-endian integer, longer fields stay raw.
pub fn decode_value(element_id: u16, raw: &[u8]) -> FieldValue {
    match raw.len() {
        4 if IPV4_ELEMENTS.contains(&element_id) => {
            FieldValue::Ipv4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
        }
        16 if IPV6_ELEMENTS.contains(&element_id) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            FieldValue::Ipv6(Ipv6Addr::from(octets))
        }
        6 if MAC_ELEMENTS.contains(&element_id) => {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(raw);
            FieldValue::Mac(mac)
        }
        len @ 1..=8 => {
            let unsigned = raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            if SIGNED_ELEMENTS.contains(&element_id) {
                let shift = 64 - 8 * len as u32;
                FieldValue::Signed {
                    value: ((unsigned << shift) as i64) >> shift,
                    width: len as u8,
                }
            } else {
                FieldValue::Unsigned {
                    value: unsigned,
                    width: len as u8,
                }
            }
        }
        _ => FieldValue::Bytes(raw.to_vec()),
    }
}
