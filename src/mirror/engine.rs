//! Policy-driven re-encode and raw dispatch of decoded messages

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flowmirror_common::{encode_with_templates, DataFlowSet, Message, TemplateRecord};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::filter_set;
use super::raw::{build_packet, SocketPool};
use super::MirrorStatus;
use crate::policy::validate::parse_mirror_target;
use crate::policy::{PolicyStore, Rule};
use crate::template_store::TemplateStore;
use crate::{FlowmirrorError, Result};

/// Source port of mirrored datagrams
pub const DEFAULT_SOURCE_PORT: u16 = 9999;

/// (agent, domain, template ID)
type TemplateKey = (String, u32, u16);

/// Templates a destination has received since its socket was opened
struct Delivered {
    epoch: u64,
    templates: HashSet<TemplateKey>,
}

pub struct MirrorEngine {
    name: String,
    store: Arc<PolicyStore>,
    sockets: Arc<SocketPool>,
    templates: TemplateStore,
    source_port: u16,
    sequences: Mutex<HashMap<(String, u32), u32>>,
    delivered: Mutex<HashMap<SocketAddrV4, Delivered>>,
    queue: mpsc::Sender<Arc<Message>>,
    receiver: Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    received: AtomicU64,
    raw_sent: AtomicU64,
    raw_errors: AtomicU64,
    dropped: AtomicU64,
}

impl MirrorEngine {
    pub fn new(
        name: impl Into<String>,
        store: Arc<PolicyStore>,
        sockets: Arc<SocketPool>,
        templates: TemplateStore,
        queue_size: usize,
        source_port: u16,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(queue_size.max(1));
        Self {
            name: name.into(),
            store,
            sockets,
            templates,
            source_port,
            sequences: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
            queue,
            receiver: Mutex::new(Some(receiver)),
            received: AtomicU64::new(0),
            raw_sent: AtomicU64::new(0),
            raw_errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a message for dispatch without waiting; a full queue drops it
    pub fn submit(&self, message: Arc<Message>) -> bool {
        match self.queue.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Start the dispatch task; it drains what is queued once `shutdown` fires
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut receiver =
            self.receiver
                .lock()
                .take()
                .ok_or_else(|| FlowmirrorError::InvalidState {
                    protocol: self.name.clone(),
                    state: "mirroring".to_string(),
                })?;
        let engine = Arc::clone(self);
        info!("Starting {} mirror engine", engine.name);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(message) => engine.handle(&message),
                        None => break,
                    },
                }
            }
            while let Ok(message) = receiver.try_recv() {
                engine.handle(&message);
            }
            info!("{} mirror engine stopped", engine.name);
        }))
    }

    fn handle(&self, message: &Message) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.dispatch(message);
    }

    /// Evaluate every rule for the message's agent and send the matching subsets
    pub fn dispatch(&self, message: &Message) {
        let Some(rules) = self.store.rules_for(&message.agent_id) else {
            return;
        };
        for rule in rules.iter() {
            self.forward(message, rule);
        }
    }

    fn forward(&self, message: &Message, rule: &Rule) {
        let flow_sets: Vec<DataFlowSet> = message
            .data_flow_sets
            .iter()
            .filter_map(|set| filter_set(rule, set))
            .collect();
        if flow_sets.is_empty() && message.template_records.is_empty() {
            return;
        }

        let agent = match message.agent_id.parse::<IpAddr>() {
            Ok(IpAddr::V4(agent)) => agent,
            _ => {
                debug!("Cannot mirror from non-IPv4 agent {}", message.agent_id);
                self.raw_errors
                    .fetch_add(rule.targets.len() as u64, Ordering::Relaxed);
                return;
            }
        };
        let source = SocketAddrV4::new(agent, self.source_port);

        for target in &rule.targets {
            let destination = match parse_mirror_target(target) {
                Ok(SocketAddr::V4(destination)) => destination,
                _ => {
                    debug!("Cannot mirror to {}", target);
                    self.raw_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let socket = match self.sockets.get_or_open(*destination.ip()) {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Opening raw socket for {} failed: {}", destination, e);
                    self.raw_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let (templates, pending) =
                self.templates_for(message, destination, socket.epoch, &flow_sets);
            let sequence = self.next_sequence(&message.agent_id, message.domain());
            let payload = encode_with_templates(message, sequence, &templates, &flow_sets);
            let sent = build_packet(source, destination, &payload).and_then(|packet| {
                socket
                    .conn
                    .send(&packet, *destination.ip())
                    .map_err(FlowmirrorError::from)
            });
            match sent {
                Ok(_) => {
                    self.raw_sent.fetch_add(1, Ordering::Relaxed);
                    self.mark_delivered(destination, socket.epoch, pending);
                }
                Err(e) => {
                    warn!("Mirroring to {} failed: {}", destination, e);
                    self.raw_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// The message's own templates plus cached ones `destination` has not
    /// received on its current socket. Also returns the keys to mark as
    /// delivered once the packet is sent.
    fn templates_for(
        &self,
        message: &Message,
        destination: SocketAddrV4,
        epoch: u64,
        flow_sets: &[DataFlowSet],
    ) -> (Vec<TemplateRecord>, Vec<TemplateKey>) {
        let key = |template_id| (message.agent_id.clone(), message.domain(), template_id);
        let delivered = self.delivered.lock();
        let known = delivered
            .get(&destination)
            .filter(|delivered| delivered.epoch == epoch)
            .map(|delivered| &delivered.templates);

        let mut templates = message.template_records.clone();
        let mut pending: Vec<TemplateKey> = templates.iter().map(|t| key(t.template_id)).collect();
        for set in flow_sets {
            let template_id = set.template_id();
            if pending.iter().any(|(_, _, id)| *id == template_id) {
                continue;
            }
            if known.is_some_and(|known| known.contains(&key(template_id))) {
                continue;
            }
            if let Some(template) =
                self.templates
                    .get(&message.agent_id, message.domain(), template_id)
            {
                templates.push((*template).clone());
                pending.push(key(template_id));
            }
        }
        (templates, pending)
    }

    fn mark_delivered(&self, destination: SocketAddrV4, epoch: u64, keys: Vec<TemplateKey>) {
        if keys.is_empty() {
            return;
        }
        let mut delivered = self.delivered.lock();
        // forget destinations whose socket was recycled
        delivered.retain(|dst, _| self.sockets.contains(*dst.ip()));
        let entry = delivered.entry(destination).or_insert_with(|| Delivered {
            epoch,
            templates: HashSet::new(),
        });
        if entry.epoch != epoch {
            entry.epoch = epoch;
            entry.templates.clear();
        }
        entry.templates.extend(keys);
    }

    fn next_sequence(&self, agent: &str, domain: u32) -> u32 {
        let mut sequences = self.sequences.lock();
        let next = sequences.entry((agent.to_string(), domain)).or_insert(0);
        let sequence = *next;
        *next = next.wrapping_add(1);
        sequence
    }

    pub fn status(&self) -> MirrorStatus {
        MirrorStatus {
            queue_size: self.queue.max_capacity() - self.queue.capacity(),
            message_received_count: self.received.load(Ordering::Relaxed),
            raw_sent_count: self.raw_sent.load(Ordering::Relaxed),
            raw_error_count: self.raw_errors.load(Ordering::Relaxed),
            dropped_count: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
