//! Message-queue output
//!
//! Decoded records are rendered as JSON and handed to a `QueueSink` through
//! a bounded channel so a slow broker never stalls decode workers.

pub mod topic;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::policy::TargetPool;
use crate::{FlowmirrorError, Result};

pub use topic::TopicRouter;

/// Default capacity of the producer channel
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Destination broker
#[async_trait]
pub trait QueueSink: Send + Sync {
    async fn publish(&self, message: MqMessage) -> Result<()>;
    fn name(&self) -> &str;
}

/// Writes each message to the log at debug level
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl QueueSink for LogSink {
    async fn publish(&self, message: MqMessage) -> Result<()> {
        debug!(
            topic = %message.topic,
            "{}",
            String::from_utf8_lossy(&message.payload)
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

pub struct Producer {
    sink: Arc<dyn QueueSink>,
    queue: mpsc::Sender<MqMessage>,
    receiver: Mutex<Option<mpsc::Receiver<MqMessage>>>,
    topics: Mutex<BTreeSet<String>>,
    published: AtomicU64,
    errors: AtomicU64,
}

impl Producer {
    pub fn new(sink: Arc<dyn QueueSink>, queue_size: usize) -> Self {
        let (queue, receiver) = mpsc::channel(queue_size.max(1));
        Self {
            sink,
            queue,
            receiver: Mutex::new(Some(receiver)),
            topics: Mutex::new(BTreeSet::new()),
            published: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Queue `payload` for `topic`; returns false when the queue is full
    pub fn send(&self, topic: &str, payload: Vec<u8>) -> bool {
        let message = MqMessage {
            topic: topic.to_string(),
            payload,
        };
        match self.queue.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Start the publishing task; queued messages are flushed after `shutdown`
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut receiver = self.receiver.lock().take().ok_or_else(|| {
            FlowmirrorError::InvalidState {
                protocol: format!("producer {}", self.sink.name()),
                state: "running".to_string(),
            }
        })?;
        let producer = Arc::clone(self);
        info!("Starting queue producer ({})", producer.sink.name());

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(message) => producer.publish(message).await,
                        None => break,
                    },
                }
            }
            while let Ok(message) = receiver.try_recv() {
                producer.publish(message).await;
            }
            info!("Queue producer stopped");
        }))
    }

    async fn publish(&self, message: MqMessage) {
        let topic = message.topic.clone();
        match self.sink.publish(message).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Messages waiting for the sink
    pub fn queue_len(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    /// Topics referenced by enabled queue rules
    pub fn active_topics(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }
}

impl TargetPool for Producer {
    fn sync_targets(&self, targets: &BTreeSet<String>) {
        let mut topics = self.topics.lock();
        for added in targets.difference(&topics) {
            info!("Queue topic {} active", added);
        }
        for removed in topics.difference(targets) {
            info!("Recycle queue topic {}", removed);
        }
        topics.clone_from(targets);
    }
}
