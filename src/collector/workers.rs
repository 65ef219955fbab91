//! Decode workers, their registry and the adaptive scaling controller

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Datagram, DatagramHandler};

/// Process-wide cap on decode workers across all protocols
#[derive(Debug)]
pub struct WorkerBudget {
    max: usize,
    used: AtomicUsize,
}

impl WorkerBudget {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            used: AtomicUsize::new(0),
        })
    }

    /// Reserve `n` workers, all or nothing
    pub fn try_acquire(&self, n: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(n).filter(|total| *total <= self.max)
            })
            .is_ok()
    }

    pub fn release(&self, n: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(n))
            });
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Spawn(usize),
    Retire(usize),
}

/// When and by how much the worker pool grows or shrinks
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    /// Time between sampling rounds
    pub interval: Duration,
    pub samples: u32,
    pub sample_every: Duration,
    /// Summed queue depth above which workers are added
    pub load_threshold: usize,
    /// Consecutive idle rounds before workers are retired
    pub idle_rounds: u32,
    pub retire_step: usize,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            samples: 30,
            sample_every: Duration::from_secs(1),
            load_threshold: 15,
            idle_rounds: 15,
            retire_step: 10,
        }
    }
}

impl ScalingPolicy {
    /// Decide from one round's summed load. `idle` counts consecutive
    /// zero-load rounds and is updated in place.
    pub fn decide(&self, load: usize, idle: &mut u32) -> ScaleDecision {
        if load > self.load_threshold {
            *idle = 0;
            return ScaleDecision::Spawn(Self::tier(load));
        }
        if load > 0 {
            *idle = 0;
            return ScaleDecision::Hold;
        }

        *idle += 1;
        if *idle > self.idle_rounds {
            *idle = 0;
            ScaleDecision::Retire(self.retire_step)
        } else {
            ScaleDecision::Hold
        }
    }

    fn tier(load: usize) -> usize {
        match load {
            l if l > 300 => 100,
            l if l > 200 => 60,
            l if l > 100 => 40,
            _ => 30,
        }
    }
}

struct WorkerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// The live decode workers of one protocol
pub struct WorkerPool {
    name: String,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Datagram>>>,
    handler: Arc<dyn DatagramHandler>,
    depth: Arc<AtomicUsize>,
    budget: Arc<WorkerBudget>,
    baseline: usize,
    handles: Mutex<Vec<WorkerHandle>>,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        receiver: mpsc::Receiver<Datagram>,
        handler: Arc<dyn DatagramHandler>,
        depth: Arc<AtomicUsize>,
        budget: Arc<WorkerBudget>,
        baseline: usize,
    ) -> Self {
        Self {
            name: name.into(),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            handler,
            depth,
            budget,
            baseline,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start `n` workers if the budget allows all of them; returns how many started
    pub fn spawn(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        if !self.budget.try_acquire(n) {
            warn!(
                "{}: max out workers ({} of {} in use)",
                self.name,
                self.budget.used(),
                self.budget.max()
            );
            return 0;
        }

        let mut handles = self.handles.lock();
        for _ in 0..n {
            let token = CancellationToken::new();
            let task = tokio::spawn(run_worker(
                Arc::clone(&self.receiver),
                Arc::clone(&self.handler),
                Arc::clone(&self.depth),
                token.clone(),
            ));
            handles.push(WorkerHandle { token, task });
        }
        info!("{}: {} workers started, {} running", self.name, n, handles.len());
        n
    }

    /// Stop up to `n` workers, never going below the baseline
    pub fn retire(&self, n: usize) -> usize {
        let mut handles = self.handles.lock();
        let mut retired = 0;
        while retired < n && handles.len() > self.baseline {
            if let Some(handle) = handles.pop() {
                handle.token.cancel();
                retired += 1;
            }
        }
        drop(handles);

        if retired > 0 {
            self.budget.release(retired);
            info!("{}: {} workers retired", self.name, retired);
        }
        retired
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Wait for every worker to finish; workers exit once the channel is
    /// closed and drained
    pub async fn join_all(&self) {
        let handles: Vec<WorkerHandle> = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();
        let results = join_all(handles.into_iter().map(|handle| handle.task)).await;
        for e in results.into_iter().filter_map(|result| result.err()) {
            warn!("{}: worker task failed: {}", self.name, e);
        }
        self.budget.release(count);
        debug!("{}: {} workers joined", self.name, count);
    }
}

async fn run_worker(
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Datagram>>>,
    handler: Arc<dyn DatagramHandler>,
    depth: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    loop {
        let datagram = {
            let mut receiver = tokio::select! {
                _ = token.cancelled() => return,
                guard = receiver.lock() => guard,
            };
            // recv is cancel safe: a datagram is either returned or left queued
            tokio::select! {
                _ = token.cancelled() => return,
                datagram = receiver.recv() => datagram,
            }
        };
        let Some(datagram) = datagram else {
            return;
        };
        depth.fetch_sub(1, Ordering::Relaxed);
        handler.handle(datagram);
    }
}

/// Periodically samples the queue depth and resizes `pool`
pub async fn scale_loop(pool: Arc<WorkerPool>, policy: ScalingPolicy, shutdown: CancellationToken) {
    let mut idle = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(policy.interval) => {}
        }

        let mut load = 0usize;
        for _ in 0..policy.samples {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(policy.sample_every) => {}
            }
            load = load.saturating_add(pool.queue_depth());
        }

        match policy.decide(load, &mut idle) {
            ScaleDecision::Spawn(n) => {
                debug!("{}: load {} spawning {} workers", pool.name, load, n);
                pool.spawn(n);
            }
            ScaleDecision::Retire(n) => {
                pool.retire(n);
            }
            ScaleDecision::Hold => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::buffer::BufferPool;
    use std::net::SocketAddr;

    #[test]
    fn test_budget_is_all_or_nothing() {
        let budget = WorkerBudget::new(10);
        assert!(budget.try_acquire(6));
        assert!(!budget.try_acquire(5));
        assert_eq!(budget.used(), 6);
        assert!(budget.try_acquire(4));
        budget.release(3);
        assert_eq!(budget.used(), 7);
        budget.release(100);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_spawn_tiers() {
        let policy = ScalingPolicy::default();
        let mut idle = 3;
        assert_eq!(policy.decide(16, &mut idle), ScaleDecision::Spawn(30));
        assert_eq!(idle, 0);
        assert_eq!(policy.decide(101, &mut idle), ScaleDecision::Spawn(40));
        assert_eq!(policy.decide(201, &mut idle), ScaleDecision::Spawn(60));
        assert_eq!(policy.decide(301, &mut idle), ScaleDecision::Spawn(100));
        assert_eq!(policy.decide(15, &mut idle), ScaleDecision::Hold);
    }

    #[test]
    fn test_retire_after_idle_rounds() {
        let policy = ScalingPolicy::default();
        let mut idle = 0;
        for _ in 0..15 {
            assert_eq!(policy.decide(0, &mut idle), ScaleDecision::Hold);
        }
        assert_eq!(policy.decide(0, &mut idle), ScaleDecision::Retire(10));
        assert_eq!(idle, 0);

        // any traffic resets the idle streak
        for _ in 0..10 {
            policy.decide(0, &mut idle);
        }
        policy.decide(3, &mut idle);
        assert_eq!(idle, 0);
    }

    #[derive(Default)]
    struct CountingHandler {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl DatagramHandler for CountingHandler {
        fn handle(&self, datagram: Datagram) {
            self.seen.lock().push(datagram.payload.to_vec());
        }
    }

    fn datagram(buffers: &Arc<BufferPool>, byte: u8) -> Datagram {
        let mut payload = buffers.get();
        payload.as_mut_full()[0] = byte;
        payload.truncate(1);
        Datagram {
            source: SocketAddr::from(([127, 0, 0, 1], 2055)),
            payload,
        }
    }

    #[tokio::test]
    async fn test_pool_drains_channel_then_exits() {
        let (sender, receiver) = mpsc::channel(16);
        let handler = Arc::new(CountingHandler::default());
        let depth = Arc::new(AtomicUsize::new(0));
        let budget = WorkerBudget::new(8);
        let pool = WorkerPool::new(
            "test",
            receiver,
            handler.clone(),
            depth.clone(),
            budget.clone(),
            2,
        );
        let buffers = BufferPool::new(8, 4);

        assert_eq!(pool.spawn(4), 4);
        assert_eq!(pool.spawn(5), 0);
        assert_eq!(budget.used(), 4);

        for byte in 0..5u8 {
            depth.fetch_add(1, Ordering::Relaxed);
            sender.send(datagram(&buffers, byte)).await.unwrap();
        }
        drop(sender);
        pool.join_all().await;

        let mut seen = handler.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, (0..5u8).map(|b| vec![b]).collect::<Vec<_>>());
        assert_eq!(depth.load(Ordering::Relaxed), 0);
        assert_eq!(budget.used(), 0);
        assert_eq!(buffers.idle(), 4);
    }

    #[tokio::test]
    async fn test_retire_keeps_baseline() {
        let (_sender, receiver) = mpsc::channel::<Datagram>(4);
        let budget = WorkerBudget::new(20);
        let pool = WorkerPool::new(
            "test",
            receiver,
            Arc::new(CountingHandler::default()),
            Arc::new(AtomicUsize::new(0)),
            budget.clone(),
            3,
        );
        pool.spawn(8);
        assert_eq!(pool.retire(10), 5);
        assert_eq!(pool.len(), 3);
        assert_eq!(budget.used(), 3);
        assert_eq!(pool.retire(1), 0);
    }
}
