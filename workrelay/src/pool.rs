use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use crate::{
    collector::{Collector, Observer},
    cost::{Cost, LinearCost},
    message::{Message, SupervisorMessage, WorkerMessage},
    selector::RoundRobin,
    worker, Env, Pid,
};

use error::{DispatchError, PoolError};

/// Number of workers a pool starts with unless configured otherwise.
pub const DEFAULT_POOL_SIZE: NonZeroUsize = match NonZeroUsize::new(20) {
    Some(size) => size,
    None => unreachable!(),
};

/// Settings applied to every worker when the pool is created.
#[derive(Clone)]
pub struct PoolConfig {
    pub size: NonZeroUsize,
    pub env: Env,
    pub cost: Arc<dyn Cost>,
    pub shutdown_timeout: Duration,
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("size", &self.size)
            .field("env", &self.env)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl PoolConfig {
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            size,
            env: Env::new(),
            cost: Arc::new(LinearCost::default()),
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost: impl Cost + 'static) -> Self {
        self.cost = Arc::new(cost);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// Everything the pool keeps per slot. The outbox is handed over to the
// collector once an observer subscribes.
#[derive(Debug)]
struct WorkerHandle {
    pid: Pid,
    tx: UnboundedSender<SupervisorMessage>,
    outbox: Option<UnboundedReceiver<(Pid, WorkerMessage)>>,
}

/// Fixed-size pool of workers fed in round-robin order.
///
/// Dispatching never waits on a worker: tasks are pushed into the chosen
/// worker's unbounded inbox and the call returns straight away. Responses
/// are delivered to whichever [`Observer`] was registered through
/// [`WorkerPool::on_response`].
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    selector: RoundRobin,

    // Monitor tasks of every worker, taken out on shutdown.
    monitors: Mutex<Vec<JoinHandle<()>>>,

    closed: AtomicBool,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `config.size` workers. Must be called from within a tokio
    /// runtime.
    pub fn new(config: PoolConfig) -> Self {
        let size = config.size.get();
        let mut workers = Vec::with_capacity(size);
        let mut monitors = Vec::with_capacity(size);

        for pid in 0..size {
            let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
            let (tx, monitor) =
                worker::spawn(pid, config.env.clone(), Arc::clone(&config.cost), outbox_tx);

            workers.push(WorkerHandle {
                pid,
                tx,
                outbox: Some(outbox_rx),
            });
            monitors.push(monitor);
        }

        tracing::debug!(workers = size, "worker pool started");

        Self {
            workers,
            selector: RoundRobin::new(config.size),
            monitors: Mutex::new(monitors),
            closed: AtomicBool::new(false),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Hands `message` to the next worker in round-robin order and returns
    /// its slot.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::ShuttingDown`] once [`WorkerPool::shutdown`] was
    ///   called.
    /// - [`DispatchError::Unavailable`] if the selected worker has stopped.
    ///   The selector still advances, so subsequent calls reach other
    ///   workers.
    pub fn dispatch(&self, message: impl Into<Message>) -> Result<Pid, DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::ShuttingDown);
        }

        let pid = self.selector.next_index();
        let worker = &self.workers[pid];

        worker
            .tx
            .send(SupervisorMessage::Task(message.into()))
            .map_err(|_| DispatchError::Unavailable { pid })?;

        tracing::trace!(worker_id = pid, "dispatched task");

        Ok(pid)
    }

    /// Registers `observer` against every worker and starts draining their
    /// responses on a dedicated task.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AlreadySubscribed`] when an observer has already
    /// been registered.
    pub fn on_response<O: Observer>(&mut self, observer: O) -> Result<Collector, PoolError> {
        if self.workers.iter().any(|worker| worker.outbox.is_none()) {
            return Err(PoolError::AlreadySubscribed);
        }

        let outboxes = self
            .workers
            .iter_mut()
            .filter_map(|worker| worker.outbox.take())
            .collect();

        Ok(Collector::spawn(outboxes, observer))
    }

    /// Stops accepting tasks, asks every worker to stop and waits for them to
    /// do so. Tasks already queued ahead of the shutdown request still
    /// complete.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShutdownTimeout`] if the workers did not stop
    /// within the configured timeout.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        self.closed.store(true, Ordering::Release);
        tracing::info!(workers = self.size(), "shutting down worker pool");

        for worker in &self.workers {
            if worker.tx.send(SupervisorMessage::Shutdown).is_err() {
                tracing::warn!(worker_id = worker.pid, "worker already stopped");
            }
        }

        let monitors = std::mem::take(
            &mut *self
                .monitors
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        if tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(monitors))
            .await
            .is_err()
        {
            tracing::warn!(
                "shutdown timeout elapsed, one or more workers may remain in an inconsistent state"
            );
            return Err(PoolError::ShutdownTimeout(self.shutdown_timeout));
        }

        tracing::info!("all workers have been shutdown");

        Ok(())
    }
}

pub mod error {
    //! Pool related errors

    use std::time::Duration;

    use crate::Pid;

    /// Failure to hand a task to a worker. Never fatal to the pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum DispatchError {
        #[error("worker {pid} is unavailable")]
        Unavailable { pid: Pid },
        #[error("worker pool is shutting down")]
        ShuttingDown,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum PoolError {
        #[error("an observer is already registered for this pool")]
        AlreadySubscribed,
        #[error("workers did not stop within {0:?}")]
        ShutdownTimeout(Duration),
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{
        cost::{Workload, ZeroCost},
        message::ResponseRecord,
        MIB,
    };

    type Inbox = UnboundedReceiver<(Pid, WorkerMessage)>;

    fn config(size: usize) -> PoolConfig {
        PoolConfig::new(NonZeroUsize::new(size).unwrap()).with_cost(ZeroCost)
    }

    fn subscribe(pool: &mut WorkerPool) -> (Collector, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let collector = pool
            .on_response(move |pid, message| {
                let _ = tx.send((pid, message));
            })
            .unwrap();

        (collector, rx)
    }

    async fn next_record(rx: &mut Inbox) -> ResponseRecord {
        loop {
            match rx.recv().await {
                Some((_, WorkerMessage::Complete(record))) => return record,
                Some(_) => continue,
                None => panic!("collector closed before a record arrived"),
            }
        }
    }

    #[tokio::test]
    async fn dispatch_follows_round_robin() {
        let pool = WorkerPool::new(config(4));

        let pids: Vec<Pid> = (0..10).map(|i| pool.dispatch(format!("m{i}")).unwrap()).collect();

        assert_eq!(pool.size(), 4);
        assert_eq!(pids, [0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
    }

    #[tokio::test]
    async fn every_dispatch_yields_one_record() {
        let mut pool = WorkerPool::new(config(3));
        let (collector, mut rx) = subscribe(&mut pool);

        let sent: BTreeSet<String> = (0..30).map(|i| format!("message {i}")).collect();
        for message in &sent {
            pool.dispatch(message.as_str()).unwrap();
        }

        let mut received = BTreeSet::new();
        for _ in 0..sent.len() {
            let record = next_record(&mut rx).await;
            assert!(received.insert(record.message.to_string()));
        }

        pool.shutdown().await.unwrap();
        collector.join().await;

        assert_eq!(sent, received);
        assert!(std::iter::from_fn(|| rx.try_recv().ok())
            .all(|(_, message)| matches!(message, WorkerMessage::ShutdownAck)));
    }

    #[tokio::test(start_paused = true)]
    async fn slower_slots_respond_later() {
        let cost = LinearCost {
            bytes_per_index: 0,
            delay_per_index: Duration::from_millis(100),
        };
        let mut pool = WorkerPool::new(config(5).with_cost(cost));
        let (_collector, mut rx) = subscribe(&mut pool);

        for _ in 0..5 {
            pool.dispatch("tick").unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(next_record(&mut rx).await.pid);
        }

        assert_eq!(order, [0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_order_is_not_send_order() {
        let cost = |pid: Pid| Workload {
            allocation: 0,
            delay: Duration::from_millis(100) * u32::try_from(4 - pid).unwrap(),
        };
        let mut pool = WorkerPool::new(config(5).with_cost(cost));
        let (_collector, mut rx) = subscribe(&mut pool);

        for i in 0..5 {
            pool.dispatch(format!("m{i}")).unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(next_record(&mut rx).await.message.to_string());
        }

        assert_eq!(order, ["m4", "m3", "m2", "m1", "m0"]);
    }

    #[tokio::test]
    async fn same_message_yields_independent_records() {
        let mut pool = WorkerPool::new(config(1).with_env("foo", "bar"));
        let (_collector, mut rx) = subscribe(&mut pool);

        assert_eq!(pool.dispatch("echo"), Ok(0));
        assert_eq!(pool.dispatch("echo"), Ok(0));

        let first = next_record(&mut rx).await;
        let second = next_record(&mut rx).await;

        assert_eq!(first, second);
        assert_eq!(first.message.as_str(), "echo");
        assert_eq!(first.env.get("foo").map(String::as_str), Some("bar"));
    }

    #[tokio::test]
    async fn memory_scales_with_index() {
        let cost = LinearCost {
            bytes_per_index: MIB,
            delay_per_index: Duration::ZERO,
        };
        let mut pool = WorkerPool::new(config(4).with_cost(cost));
        let (_collector, mut rx) = subscribe(&mut pool);

        for _ in 0..4 {
            pool.dispatch("alloc").unwrap();
        }

        for _ in 0..4 {
            let record = next_record(&mut rx).await;
            #[allow(clippy::cast_precision_loss)]
            let expected = record.pid as f64;
            assert!((record.memory_mib - expected).abs() < f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn faulted_worker_is_isolated() {
        let cost = |pid: Pid| {
            assert_ne!(pid, 1, "worker 1 always faults");
            Workload::default()
        };
        let mut pool = WorkerPool::new(config(3).with_cost(cost));
        let (_collector, mut rx) = subscribe(&mut pool);

        for message in ["a", "b", "c"] {
            pool.dispatch(message).unwrap();
        }

        let mut completed = BTreeSet::new();
        let mut faulted = None;
        for _ in 0..3 {
            match rx.recv().await {
                Some((pid, WorkerMessage::Complete(_))) => {
                    completed.insert(pid);
                }
                Some((pid, WorkerMessage::Fault(fault))) => {
                    assert_eq!(fault.pid, pid);
                    faulted = Some(pid);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }

        assert_eq!(completed, BTreeSet::from([0, 2]));
        assert_eq!(faulted, Some(1));

        assert_eq!(pool.dispatch("d"), Ok(0));
        assert_eq!(pool.dispatch("e"), Err(DispatchError::Unavailable { pid: 1 }));
        assert_eq!(pool.dispatch("f"), Ok(2));
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_rejects_new_work() {
        let mut pool = WorkerPool::new(config(2));
        let (collector, mut rx) = subscribe(&mut pool);

        for i in 0..6 {
            pool.dispatch(format!("m{i}")).unwrap();
        }

        pool.shutdown().await.unwrap();
        assert_eq!(pool.dispatch("late"), Err(DispatchError::ShuttingDown));

        collector.join().await;

        let messages: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let completed = messages
            .iter()
            .filter(|(_, message)| matches!(message, WorkerMessage::Complete(_)))
            .count();
        let acks: BTreeSet<Pid> = messages
            .iter()
            .filter(|(_, message)| matches!(message, WorkerMessage::ShutdownAck))
            .map(|(pid, _)| *pid)
            .collect();

        assert_eq!(completed, 6);
        assert_eq!(acks, BTreeSet::from([0, 1]));
    }

    #[tokio::test]
    async fn observer_registers_once() {
        let mut pool = WorkerPool::new(config(2));
        let _collector = pool.on_response(crate::LogObserver).unwrap();

        assert_eq!(
            pool.on_response(crate::LogObserver).err(),
            Some(PoolError::AlreadySubscribed)
        );
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = PoolConfig::default();

        assert_eq!(config.size.get(), 20);
        assert!(config.env.is_empty());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.cost.cost(2).delay, Duration::from_millis(200));
    }
}
