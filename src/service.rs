//! Top-level wiring and the management surface
//!
//! `Service` owns every store, engine and collector; nothing is global, so
//! several services can live in one process (as the tests do).

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use flowmirror_common::Version;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{
    Collector, CollectorState, CollectorStatus, NetflowHandler, QueueOutput, WorkerBudget,
};
use crate::config::Options;
use crate::loss::LossTracker;
use crate::mirror::{MirrorEngine, MirrorStatus, RawTransport, Socket2Transport, SocketPool};
use crate::policy::{ApiReply, Policy, PolicyKind, PolicyStore, Rule};
use crate::producer::{LogSink, Producer, QueueSink, TopicRouter};
use crate::template_store::TemplateStore;
use crate::{FlowmirrorError, Result};

struct ProtocolRuntime {
    version: Version,
    templates: TemplateStore,
    loss: Arc<LossTracker>,
    mirror: Arc<MirrorEngine>,
    collector: Collector,
}

pub struct Service {
    options: Options,
    shutdown: CancellationToken,
    mirror_store: Arc<PolicyStore>,
    queue_store: Arc<PolicyStore>,
    sockets: Arc<SocketPool>,
    producer: Option<Arc<Producer>>,
    protocols: Vec<ProtocolRuntime>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn sink_for(mq_name: &str) -> Result<Arc<dyn QueueSink>> {
    match mq_name {
        "log" => Ok(Arc::new(LogSink)),
        other => Err(FlowmirrorError::ConfigError(format!(
            "no queue backend named {}",
            other
        ))),
    }
}

impl Service {
    /// Build a service sending mirrored packets over raw sockets
    pub fn new(options: Options) -> Result<Self> {
        Self::with_transport(options, Arc::new(Socket2Transport))
    }

    pub fn with_transport(options: Options, transport: Arc<dyn RawTransport>) -> Result<Self> {
        options.validate()?;

        let sockets = Arc::new(SocketPool::new(transport));
        let mirror_store = Arc::new(
            PolicyStore::open(PolicyKind::Mirror, &options.flow_forward_cfg)?
                .with_pool(sockets.clone()),
        );

        let producer = if options.mq_enabled() {
            Some(Arc::new(Producer::new(
                sink_for(&options.mq_name)?,
                options.mq_queue_size,
            )))
        } else {
            None
        };
        let mut queue_store = PolicyStore::open(PolicyKind::Queue, &options.queue_forward_cfg)?;
        if let Some(producer) = &producer {
            queue_store = queue_store.with_pool(producer.clone());
        }
        let queue_store = Arc::new(queue_store);
        let router = Arc::new(TopicRouter::new(queue_store.clone()));

        let budget = WorkerBudget::new(options.max_workers);
        let mut protocols = Vec::new();
        for protocol in options.enabled_protocols() {
            let name = protocol.version.as_str();
            let templates = TemplateStore::new();
            if let Some(path) = &protocol.template_file {
                let loaded = templates.load(path)?;
                info!("{}: {} templates restored from {}", name, loaded, path.display());
            }

            let loss = Arc::new(LossTracker::new());
            let mirror = Arc::new(MirrorEngine::new(
                name,
                mirror_store.clone(),
                sockets.clone(),
                templates.clone(),
                options.mirror_queue_size,
                options.mirror_source_port,
            ));

            let mut handler = NetflowHandler::new(name, templates.clone(), loss.clone())
                .with_mirror(mirror.clone());
            if let Some(path) = &protocol.template_file {
                handler = handler.with_template_file(path);
            }
            if let Some(producer) = &producer {
                handler = handler.with_output(QueueOutput {
                    producer: producer.clone(),
                    router: router.clone(),
                    topic: protocol.topic.clone(),
                });
            }

            let collector = Collector::new(
                protocol.collector_config(options.bind_addr, options.dynamic_workers),
                Arc::new(handler),
                budget.clone(),
            );
            protocols.push(ProtocolRuntime {
                version: protocol.version,
                templates,
                loss,
                mirror,
                collector,
            });
        }

        Ok(Self {
            options,
            shutdown: CancellationToken::new(),
            mirror_store,
            queue_store,
            sockets,
            producer,
            protocols,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Start the producer, the mirror engines and then the collectors;
    /// returns the address each collector bound
    pub async fn start(&self) -> Result<Vec<(Version, SocketAddr)>> {
        if let Some(producer) = &self.producer {
            let task = producer.start(self.shutdown.child_token())?;
            self.tasks.lock().push(task);
        }
        for runtime in &self.protocols {
            let task = runtime.mirror.start(self.shutdown.child_token())?;
            self.tasks.lock().push(task);
        }

        let mut bound = Vec::with_capacity(self.protocols.len());
        for runtime in &self.protocols {
            let addr = runtime.collector.start().await?;
            bound.push((runtime.version, addr));
        }
        Ok(bound)
    }

    /// Drain the collectors, then stop the engines and the producer once
    /// their queues are flushed
    pub async fn shutdown(&self) {
        for runtime in &self.protocols {
            if runtime.collector.state() != CollectorState::Running {
                continue;
            }
            if let Err(e) = runtime.collector.stop().await {
                warn!("Stopping {} collector failed: {}", runtime.version, e);
            }
        }

        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for e in join_all(tasks).await.into_iter().filter_map(|result| result.err()) {
            warn!("Background task failed: {}", e);
        }
        info!("flowmirror stopped");
    }

    /// Run until `signal` resolves, then shut down
    pub async fn run_until<F: Future<Output = ()>>(&self, signal: F) -> Result<()> {
        for (version, addr) in self.start().await? {
            info!("{} collector ready on {}", version, addr);
        }
        signal.await;
        info!("Shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    fn store(&self, kind: PolicyKind) -> &PolicyStore {
        match kind {
            PolicyKind::Mirror => &self.mirror_store,
            PolicyKind::Queue => &self.queue_store,
        }
    }

    pub fn add_policy(&self, kind: PolicyKind, policy: Policy) -> ApiReply {
        ApiReply::new(self.store(kind).add_policy(policy), "add succeed.")
    }

    pub fn update_policy(&self, kind: PolicyKind, policy_id: &str, policy: Policy) -> ApiReply {
        ApiReply::new(self.store(kind).update_policy(policy_id, policy), "update success")
    }

    pub fn delete_policy(&self, kind: PolicyKind, policy_id: &str) -> ApiReply {
        ApiReply::new(self.store(kind).delete_policy(policy_id), "delete success")
    }

    pub fn add_rule(&self, kind: PolicyKind, policy_id: &str, rule: Rule) -> ApiReply {
        ApiReply::new(self.store(kind).add_rule(policy_id, rule), "add rule succeed.")
    }

    /// Delete by rule id, `"<port>_<direction>_<source>"`
    pub fn delete_rule(&self, kind: PolicyKind, policy_id: &str, rule_id: &str) -> ApiReply {
        ApiReply::new(
            self.store(kind).delete_rule_by_id(policy_id, rule_id),
            "delete success.",
        )
    }

    pub fn policies(&self, kind: PolicyKind) -> Vec<Policy> {
        self.store(kind).policies()
    }

    pub fn policy_by_id(&self, kind: PolicyKind, policy_id: &str) -> Option<Policy> {
        self.store(kind).policy(policy_id)
    }

    /// Status per protocol, keyed by protocol name
    pub fn collector_status(&self) -> BTreeMap<String, CollectorStatus> {
        self.protocols
            .iter()
            .map(|runtime| (runtime.version.to_string(), runtime.collector.status()))
            .collect()
    }

    /// Status per mirror engine, keyed by protocol name
    pub fn mirror_status(&self) -> BTreeMap<String, MirrorStatus> {
        self.protocols
            .iter()
            .map(|runtime| (runtime.version.to_string(), runtime.mirror.status()))
            .collect()
    }

    /// Packets lost by a NetFlow v9 agent
    pub fn netflow_packet_loss(&self, agent: &str) -> Result<u64> {
        self.runtime(Version::NetflowV9)
            .ok_or_else(|| FlowmirrorError::AgentNotFound(agent.to_string()))?
            .loss
            .loss(agent)
    }

    /// Templates currently cached for `version`
    pub fn template_count(&self, version: Version) -> usize {
        self.runtime(version)
            .map_or(0, |runtime| runtime.templates.len())
    }

    /// Raw sockets currently open
    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Queue topics referenced by enabled queue rules
    pub fn active_topics(&self) -> Vec<String> {
        self.producer
            .as_ref()
            .map_or_else(Vec::new, |producer| producer.active_topics())
    }

    fn runtime(&self, version: Version) -> Option<&ProtocolRuntime> {
        self.protocols
            .iter()
            .find(|runtime| runtime.version == version)
    }
}
