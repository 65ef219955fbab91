//! Record selection for mirror rules

use flowmirror_common::element::{INPUT_SNMP, OUTPUT_SNMP};
use flowmirror_common::{DataFlowRecord, DataFlowSet};

use crate::policy::{Direction, Rule, ANY_PORT};

/// Whether `record` is selected by `rule`.
///
/// A record without an ingress (or egress) port field matches that side.
pub fn record_matches(rule: &Rule, record: &DataFlowRecord) -> bool {
    if rule.port == ANY_PORT {
        return true;
    }
    let port = u64::try_from(rule.port).ok();
    let side = |element_id| {
        record
            .get(element_id)
            .map_or(true, |value| value.as_u64() == port)
    };
    match rule.direction {
        Direction::Ingress => side(INPUT_SNMP),
        Direction::Egress => side(OUTPUT_SNMP),
        Direction::Both => side(INPUT_SNMP) || side(OUTPUT_SNMP),
    }
}

/// Clones the records of `set` selected by `rule` into a new set.
///
/// Returns `None` when nothing matches.
pub fn filter_set(rule: &Rule, set: &DataFlowSet) -> Option<DataFlowSet> {
    let records: Vec<_> = set
        .records
        .iter()
        .filter(|record| record_matches(rule, record))
        .cloned()
        .collect();
    if records.is_empty() {
        return None;
    }
    Some(DataFlowSet::new(set.template_id(), records))
}
