//! NetFlow v9 / IPFIX datagram handling

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flowmirror_common::{decode, DataFlowRecord, JsonView, Message};
use tracing::{debug, warn};

use super::{Datagram, DatagramHandler, HandlerCounters};
use crate::loss::LossTracker;
use crate::mirror::MirrorEngine;
use crate::producer::{Producer, TopicRouter};
use crate::template_store::TemplateStore;

/// Where decoded records are published
pub struct QueueOutput {
    pub producer: Arc<Producer>,
    pub router: Arc<TopicRouter>,
    /// Topic receiving every data set
    pub topic: String,
}

/// Decodes datagrams and fans the messages out to the loss tracker, the
/// mirror engine and the queue producer
pub struct NetflowHandler {
    name: String,
    templates: TemplateStore,
    template_file: Option<PathBuf>,
    loss: Arc<LossTracker>,
    mirror: Option<Arc<MirrorEngine>>,
    output: Option<QueueOutput>,
    decoded: AtomicU64,
    decode_errors: AtomicU64,
    mq_errors: AtomicU64,
}

impl NetflowHandler {
    pub fn new(name: impl Into<String>, templates: TemplateStore, loss: Arc<LossTracker>) -> Self {
        Self {
            name: name.into(),
            templates,
            template_file: None,
            loss,
            mirror: None,
            output: None,
            decoded: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            mq_errors: AtomicU64::new(0),
        }
    }

    /// Dump the template store here on shutdown
    pub fn with_template_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_file = Some(path.into());
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<MirrorEngine>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_output(mut self, output: QueueOutput) -> Self {
        self.output = Some(output);
        self
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    fn publish(&self, output: &QueueOutput, message: &Message) {
        for set in &message.data_flow_sets {
            self.send_json(output, &output.topic, JsonView::new(message, &set.records));
        }

        let routed: Vec<(Arc<[String]>, &DataFlowRecord)> = message
            .records()
            .map(|record| (output.router.route_record(&message.agent_id, record), record))
            .collect();
        let mut groups: BTreeMap<&str, Vec<&DataFlowRecord>> = BTreeMap::new();
        for (topics, record) in &routed {
            for topic in topics.iter() {
                groups.entry(topic.as_str()).or_default().push(*record);
            }
        }
        for (topic, records) in groups {
            let count = u16::try_from(records.len()).unwrap_or(u16::MAX);
            self.send_json(output, topic, JsonView::new(message, records).with_count(count));
        }
    }

    fn send_json(&self, output: &QueueOutput, topic: &str, view: JsonView<'_>) {
        match serde_json::to_vec(&view) {
            Ok(payload) => {
                if !output.producer.send(topic, payload) {
                    self.mq_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                warn!("{}: JSON rendering failed: {}", self.name, e);
                self.mq_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl DatagramHandler for NetflowHandler {
    fn handle(&self, datagram: Datagram) {
        let agent = datagram.source.ip().to_canonical().to_string();
        let decoded = match decode(&agent, &datagram.payload, &self.templates) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("{}: dropping datagram from {}: {}", self.name, agent, e);
                return;
            }
        };
        drop(datagram);

        if !decoded.errors.is_empty() {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
            for e in &decoded.errors {
                debug!("{}: {}", self.name, e);
            }
        }

        let message = Arc::new(decoded.message);
        self.decoded.fetch_add(1, Ordering::Relaxed);
        self.loss
            .record(&agent, message.header.source_id, message.header.sequence);

        if let Some(mirror) = &self.mirror {
            mirror.submit(Arc::clone(&message));
        }
        if let Some(output) = &self.output {
            self.publish(output, &message);
        }
    }

    fn shutdown(&self) {
        let Some(path) = &self.template_file else {
            return;
        };
        if let Err(e) = self.templates.dump(path) {
            warn!("{}: template dump failed: {}", self.name, e);
        }
    }

    fn counters(&self) -> HandlerCounters {
        HandlerCounters {
            decoded: self.decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            mq_errors: self.mq_errors.load(Ordering::Relaxed),
            message_queue: self
                .output
                .as_ref()
                .map_or(0, |output| output.producer.queue_len()),
            lost: self.loss.total_loss(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collector::buffer::BufferPool;
    use crate::policy::{Direction, Policy, PolicyKind, PolicyStore, Rule};
    use crate::producer::LogSink;
    use std::net::SocketAddr;

    /// NetFlow v9 datagram with template 256 (in port, out port, src addr)
    /// followed by one data set of `records`
    pub(crate) fn v9_packet(sequence: u32, records: &[(u16, u16, [u8; 4])]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&9u16.to_be_bytes());
        buf.extend_from_slice(&(1 + records.len() as u16).to_be_bytes());
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf.extend_from_slice(&5u32.to_be_bytes());

        buf.extend_from_slice(&[0, 0, 0, 20, 1, 0, 0, 3]);
        buf.extend_from_slice(&[0, 10, 0, 2, 0, 14, 0, 2, 0, 8, 0, 4]);

        buf.extend_from_slice(&[1, 0]);
        buf.extend_from_slice(&(4 + records.len() as u16 * 8).to_be_bytes());
        for (input, output, addr) in records {
            buf.extend_from_slice(&input.to_be_bytes());
            buf.extend_from_slice(&output.to_be_bytes());
            buf.extend_from_slice(addr);
        }
        buf
    }

    fn datagram(buffers: &Arc<BufferPool>, payload: &[u8]) -> Datagram {
        let mut buffer = buffers.get();
        buffer.as_mut_full()[..payload.len()].copy_from_slice(payload);
        buffer.truncate(payload.len());
        Datagram {
            source: SocketAddr::from(([10, 1, 1, 1], 2055)),
            payload: buffer,
        }
    }

    #[test]
    fn test_decode_and_track_loss() {
        let loss = Arc::new(LossTracker::new());
        let handler = NetflowHandler::new("netflow9", TemplateStore::new(), loss.clone());
        let buffers = BufferPool::new(1500, 4);

        handler.handle(datagram(&buffers, &v9_packet(100, &[(1, 2, [10, 0, 0, 1])])));
        handler.handle(datagram(&buffers, &v9_packet(103, &[(1, 2, [10, 0, 0, 2])])));

        assert_eq!(loss.loss("10.1.1.1").unwrap(), 2);
        let counters = handler.counters();
        assert_eq!(counters.decoded, 2);
        assert_eq!(counters.decode_errors, 0);
        assert_eq!(counters.lost, 2);
        assert_eq!(handler.templates().len(), 1);
        assert_eq!(buffers.idle(), 1);
    }

    #[test]
    fn test_garbage_is_counted_and_buffer_released() {
        let handler =
            NetflowHandler::new("netflow9", TemplateStore::new(), Arc::new(LossTracker::new()));
        let buffers = BufferPool::new(1500, 4);
        handler.handle(datagram(&buffers, &[0, 9, 0]));
        assert_eq!(handler.counters().decode_errors, 1);
        assert_eq!(handler.counters().decoded, 0);
        assert_eq!(buffers.idle(), 1);
    }

    #[test]
    fn test_publish_main_and_routed_topics() {
        let queue_store = Arc::new(PolicyStore::in_memory(PolicyKind::Queue));
        queue_store
            .add_policy(
                Policy::new("q1", vec!["web".to_string()])
                    .with_rule(Rule::new("10.1.1.1", 80, Direction::Ingress)),
            )
            .unwrap();
        let producer = Arc::new(Producer::new(Arc::new(LogSink), 16));
        let handler =
            NetflowHandler::new("netflow9", TemplateStore::new(), Arc::new(LossTracker::new()))
                .with_output(QueueOutput {
                    producer: producer.clone(),
                    router: Arc::new(TopicRouter::new(queue_store)),
                    topic: "vflow.netflow9".to_string(),
                });
        let buffers = BufferPool::new(1500, 4);

        let packet = v9_packet(
            1,
            &[(80, 2, [10, 0, 0, 1]), (443, 2, [10, 0, 0, 2]), (80, 3, [10, 0, 0, 3])],
        );
        handler.handle(datagram(&buffers, &packet));

        // one main-topic document plus one "web" group of two records
        assert_eq!(producer.queue_len(), 2);
        assert_eq!(handler.counters().message_queue, 2);
        assert_eq!(handler.counters().mq_errors, 0);
    }

    #[test]
    fn test_shutdown_dumps_templates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netflowv9.templates");
        let handler =
            NetflowHandler::new("netflow9", TemplateStore::new(), Arc::new(LossTracker::new()))
                .with_template_file(&path);
        let buffers = BufferPool::new(1500, 4);
        handler.handle(datagram(&buffers, &v9_packet(1, &[])));
        handler.shutdown();

        let restored = TemplateStore::new();
        assert_eq!(restored.load(&path).unwrap(), 1);
        assert!(restored.get("10.1.1.1", 5, 256).is_some());
    }
}
