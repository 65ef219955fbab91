//! Mapping of (agent, ports, direction) to queue topics

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use flowmirror_common::element::{FLOW_DIRECTION, INPUT_SNMP, OUTPUT_SNMP};
use flowmirror_common::DataFlowRecord;
use parking_lot::Mutex;

use crate::policy::{Direction, PolicyStore, Rule, ANY_PORT};

/// Cached lookups beyond this are discarded wholesale
const MAX_CACHE_ENTRIES: usize = 65_536;

/// Port or direction value for a field the record does not carry
pub const MISSING: i64 = -1;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct TopicKey {
    agent: String,
    in_port: i64,
    out_port: i64,
    direction: i64,
}

#[derive(Default)]
struct TopicCache {
    generation: u64,
    entries: HashMap<TopicKey, Arc<[String]>>,
}

/// Resolves queue topics from the queue policy store, memoizing results
/// until the store's generation changes
pub struct TopicRouter {
    store: Arc<PolicyStore>,
    cache: Mutex<TopicCache>,
}

impl TopicRouter {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(TopicCache::default()),
        }
    }

    /// Topics of every enabled queue rule of `agent` selecting these ports.
    ///
    /// `direction` is the record's flow direction: 0 ingress, 1 egress, -1 unknown.
    pub fn parse_topic(
        &self,
        agent: &str,
        in_port: i64,
        out_port: i64,
        direction: i64,
    ) -> Arc<[String]> {
        let generation = self.store.generation();
        let key = TopicKey {
            agent: agent.to_string(),
            in_port,
            out_port,
            direction,
        };

        let mut cache = self.cache.lock();
        if cache.generation != generation || cache.entries.len() >= MAX_CACHE_ENTRIES {
            cache.entries.clear();
            cache.generation = generation;
        }
        if let Some(topics) = cache.entries.get(&key) {
            return Arc::clone(topics);
        }

        let topics: Arc<[String]> = self
            .store
            .with_rules(agent, |rules| {
                rules
                    .iter()
                    .filter(|rule| rule_selects(rule, in_port, out_port, direction))
                    .flat_map(|rule| rule.targets.iter().cloned())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_else(|| Arc::from(Vec::new()));
        cache.entries.insert(key, Arc::clone(&topics));
        topics
    }

    /// Topics for one decoded record
    pub fn route_record(&self, agent: &str, record: &DataFlowRecord) -> Arc<[String]> {
        let field = |element_id| {
            record
                .get(element_id)
                .and_then(|value| value.as_u64())
                .and_then(|value| i64::try_from(value).ok())
                .unwrap_or(MISSING)
        };
        self.parse_topic(
            agent,
            field(INPUT_SNMP),
            field(OUTPUT_SNMP),
            field(FLOW_DIRECTION),
        )
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().entries.len()
    }
}

/// Queue rule matching: ingress rules compare the input port, egress rules
/// the output port, and `Both` rules whichever side the record's direction allows
fn rule_selects(rule: &Rule, in_port: i64, out_port: i64, direction: i64) -> bool {
    if rule.port == ANY_PORT {
        return true;
    }
    let port = i64::from(rule.port);
    match rule.direction {
        Direction::Ingress => port == in_port,
        Direction::Egress => port == out_port,
        Direction::Both => {
            (port == in_port && direction != 1) || (port == out_port && direction != 0)
        }
    }
}
