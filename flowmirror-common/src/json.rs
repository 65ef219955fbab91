//! JSON rendering of decoded records for message-queue publishing

use serde::ser::{SerializeMap, SerializeSeq, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::message::{DataFlowRecord, DecodedField, FieldValue, Header, Message};

/// Serializable view over a message and a subset of its records.
///
/// Renders as `{"AgentID", "Header", "DataSets"}` where each record is a list
/// of `{"I": element, "V": value}` pairs.
pub struct JsonView<'a> {
    agent_id: &'a str,
    header: Header,
    records: Vec<&'a DataFlowRecord>,
}

impl<'a> JsonView<'a> {
    pub fn new(
        message: &'a Message,
        records: impl IntoIterator<Item = &'a DataFlowRecord>,
    ) -> Self {
        Self {
            agent_id: &message.agent_id,
            header: message.header,
            records: records.into_iter().collect(),
        }
    }

    /// Overrides the header count, e.g. with the size of a topic group
    pub fn with_count(mut self, count: u16) -> Self {
        self.header.count = count;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Serialize for JsonView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("AgentID", self.agent_id)?;
        map.serialize_entry("Header", &HeaderView(&self.header))?;
        map.serialize_entry("DataSets", &RecordsView(&self.records))?;
        map.end()
    }
}

struct HeaderView<'a>(&'a Header);

impl Serialize for HeaderView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let header = self.0;
        let mut s = serializer.serialize_struct("Header", 6)?;
        s.serialize_field("Version", &header.version.number())?;
        s.serialize_field("Count", &header.count)?;
        s.serialize_field("SysUpTime", &header.sys_uptime)?;
        s.serialize_field("UNIXSecs", &header.unix_secs)?;
        s.serialize_field("SeqNum", &header.sequence)?;
        s.serialize_field("SrcID", &header.source_id)?;
        s.end()
    }
}

struct RecordsView<'a>(&'a [&'a DataFlowRecord]);

impl Serialize for RecordsView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for record in self.0 {
            seq.serialize_element(&record.fields)?;
        }
        seq.end()
    }
}

impl Serialize for DecodedField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Field", 2)?;
        s.serialize_field("I", &self.element_id)?;
        s.serialize_field("V", &self.value)?;
        s.end()
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Unsigned { value, .. } => serializer.serialize_u64(*value),
            FieldValue::Signed { value, .. } => serializer.serialize_i64(*value),
            other => serializer.collect_str(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DataFlowSet, Version};
    use std::net::Ipv4Addr;

    fn message() -> Message {
        let record = DataFlowRecord::new(vec![
            DecodedField::new(8, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 0, 1))),
            DecodedField::new(10, FieldValue::Unsigned { value: 3, width: 2 }),
            DecodedField::new(95, FieldValue::Bytes(vec![0xca, 0xfe])),
        ]);
        Message {
            agent_id: "192.0.2.1".to_string(),
            header: Header {
                version: Version::NetflowV9,
                count: 2,
                sys_uptime: 5,
                unix_secs: 6,
                sequence: 7,
                source_id: 8,
            },
            template_records: Vec::new(),
            data_flow_sets: vec![DataFlowSet::new(256, vec![record.clone(), record])],
        }
    }

    #[test]
    fn test_json_shape() {
        let message = message();
        let view = JsonView::new(&message, message.data_flow_sets[0].records.iter().take(1));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "AgentID": "192.0.2.1",
                "Header": {
                    "Version": 9, "Count": 2, "SysUpTime": 5,
                    "UNIXSecs": 6, "SeqNum": 7, "SrcID": 8
                },
                "DataSets": [[
                    {"I": 8, "V": "10.0.0.1"},
                    {"I": 10, "V": 3},
                    {"I": 95, "V": "0xcafe"}
                ]]
            })
        );
    }

    #[test]
    fn test_count_override() {
        let message = message();
        let view = JsonView::new(&message, message.records()).with_count(2);
        assert_eq!(view.len(), 2);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["Header"]["Count"], 2);
        assert_eq!(json["DataSets"].as_array().map(Vec::len), Some(2));
    }
}
