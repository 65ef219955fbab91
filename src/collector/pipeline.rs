//! Per-protocol collector lifecycle: Stopped -> Running -> Draining -> Stopped

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::BufferPool;
use super::workers::{scale_loop, ScalingPolicy, WorkerBudget, WorkerPool};
use super::{CollectorState, CollectorStatus, Datagram, DatagramHandler};
use crate::{FlowmirrorError, Result};

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Protocol name used in logs and errors
    pub name: String,
    pub bind: SocketAddr,
    /// Baseline worker count
    pub workers: usize,
    pub queue_size: usize,
    /// Receive buffer size, the largest datagram accepted
    pub udp_size: usize,
    /// `None` keeps the worker count fixed
    pub scaling: Option<ScalingPolicy>,
}

struct Running {
    shutdown: CancellationToken,
    reader: JoinHandle<()>,
    scaler: Option<JoinHandle<()>>,
    pool: Arc<WorkerPool>,
}

pub struct Collector {
    config: CollectorConfig,
    handler: Arc<dyn DatagramHandler>,
    budget: Arc<WorkerBudget>,
    state: Mutex<CollectorState>,
    running: Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
    udp_count: Arc<AtomicU64>,
    depth: Arc<AtomicUsize>,
    start_time: AtomicU64,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        handler: Arc<dyn DatagramHandler>,
        budget: Arc<WorkerBudget>,
    ) -> Self {
        Self {
            config,
            handler,
            budget,
            state: Mutex::new(CollectorState::Stopped),
            running: Mutex::new(None),
            local_addr: Mutex::new(None),
            udp_count: Arc::new(AtomicU64::new(0)),
            depth: Arc::new(AtomicUsize::new(0)),
            start_time: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> CollectorState {
        *self.state.lock()
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind the socket and start the reader, workers and scaler
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.state.lock();
            if *state != CollectorState::Stopped {
                return Err(self.invalid_state(*state));
            }
            *state = CollectorState::Running;
        }

        match self.launch().await {
            Ok(addr) => Ok(addr),
            Err(e) => {
                *self.state.lock() = CollectorState::Stopped;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(self.config.bind).await?;
        let local = socket.local_addr()?;
        let queue_size = self.config.queue_size.max(1);
        let (sender, receiver) = mpsc::channel(queue_size);

        let pool = Arc::new(WorkerPool::new(
            self.config.name.clone(),
            receiver,
            Arc::clone(&self.handler),
            Arc::clone(&self.depth),
            Arc::clone(&self.budget),
            self.config.workers,
        ));
        if pool.spawn(self.config.workers) != self.config.workers {
            return Err(FlowmirrorError::ConfigError(format!(
                "{}: cannot start {} workers, budget is {} with {} in use",
                self.config.name,
                self.config.workers,
                self.budget.max(),
                self.budget.used()
            )));
        }

        let shutdown = CancellationToken::new();
        let buffers = BufferPool::new(self.config.udp_size, queue_size);
        let reader = tokio::spawn(read_loop(
            self.config.name.clone(),
            socket,
            sender,
            buffers,
            Arc::clone(&self.depth),
            Arc::clone(&self.udp_count),
            shutdown.clone(),
        ));
        let scaler = self.config.scaling.clone().map(|policy| {
            tokio::spawn(scale_loop(Arc::clone(&pool), policy, shutdown.clone()))
        });

        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        self.start_time.store(started, Ordering::Relaxed);
        *self.local_addr.lock() = Some(local);
        *self.running.lock() = Some(Running {
            shutdown,
            reader,
            scaler,
            pool,
        });

        info!(
            "{} collector listening on {} with {} workers",
            self.config.name, local, self.config.workers
        );
        Ok(local)
    }

    /// Stop reading, drain queued datagrams through the workers, then
    /// run the handler's shutdown hook
    pub async fn stop(&self) -> Result<()> {
        let running = {
            let mut state = self.state.lock();
            if *state != CollectorState::Running {
                return Err(self.invalid_state(*state));
            }
            *state = CollectorState::Draining;
            self.running.lock().take()
        };
        let Some(running) = running else {
            *self.state.lock() = CollectorState::Stopped;
            return Ok(());
        };

        info!("Draining {} collector", self.config.name);
        running.shutdown.cancel();
        if let Err(e) = running.reader.await {
            warn!("{}: reader task failed: {}", self.config.name, e);
        }
        if let Some(scaler) = running.scaler {
            if let Err(e) = scaler.await {
                warn!("{}: scaler task failed: {}", self.config.name, e);
            }
        }
        // the reader owned the only sender, so workers see the channel close
        running.pool.join_all().await;
        self.handler.shutdown();

        *self.local_addr.lock() = None;
        *self.state.lock() = CollectorState::Stopped;
        info!("{} collector stopped", self.config.name);
        Ok(())
    }

    pub fn status(&self) -> CollectorStatus {
        let counters = self.handler.counters();
        let workers = self
            .running
            .lock()
            .as_ref()
            .map_or(0, |running| running.pool.len());
        CollectorStatus {
            state: self.state(),
            udp_queue: self.depth.load(Ordering::Relaxed),
            message_queue: counters.message_queue,
            udp_count: self.udp_count.load(Ordering::Relaxed),
            decoded_count: counters.decoded,
            decode_error_count: counters.decode_errors,
            mq_error_count: counters.mq_errors,
            lost_count: counters.lost,
            start_time: self.start_time.load(Ordering::Relaxed),
            workers,
        }
    }

    fn invalid_state(&self, state: CollectorState) -> FlowmirrorError {
        FlowmirrorError::InvalidState {
            protocol: self.config.name.clone(),
            state: state.to_string(),
        }
    }
}

async fn read_loop(
    name: String,
    socket: UdpSocket,
    sender: mpsc::Sender<Datagram>,
    buffers: Arc<BufferPool>,
    depth: Arc<AtomicUsize>,
    udp_count: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        let mut buffer = buffers.get();
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(buffer.as_mut_full()) => received,
        };
        let (len, source) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!("{}: udp read error: {}", name, e);
                continue;
            }
        };
        buffer.truncate(len);
        udp_count.fetch_add(1, Ordering::Relaxed);

        // counted before the send so a worker never decrements first
        depth.fetch_add(1, Ordering::Relaxed);
        let datagram = Datagram {
            source,
            payload: buffer,
        };
        if sender.send(datagram).await.is_err() {
            depth.fetch_sub(1, Ordering::Relaxed);
            break;
        }
    }
    debug!("{}: reader stopped", name);
}
