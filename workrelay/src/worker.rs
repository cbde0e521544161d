use std::{any::Any, fmt, hint, sync::Arc};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use crate::{
    cost::{Cost, Workload},
    message::{Message, ResponseRecord, SupervisorMessage, WorkerFault, WorkerMessage},
    Env, Pid, MIB,
};

/// Sending half of the channel every worker reports back on.
pub(crate) type Outbox = UnboundedSender<(Pid, WorkerMessage)>;

/// A long-lived worker owning one pool slot. It receives tasks over its own
/// inbox, processes them one at a time and emits exactly one response per
/// task.
pub(crate) struct Worker {
    pid: Pid,
    tx: Outbox,
    rx: UnboundedReceiver<SupervisorMessage>,
    env: Env,
    cost: Arc<dyn Cost>,
    state: State,
    // Bytes of simulated allocation currently held by this worker.
    resident: usize,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("resident", &self.resident)
            .finish_non_exhaustive()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // NOTE(jdb): Perform clean shutdown as recommended by tokio
        //
        // https://docs.rs/tokio/latest/tokio/sync/mpsc/index.html#clean-shutdown
        self.rx.close();

        let mut dropped = 0_usize;
        while let Ok(message) = self.rx.try_recv() {
            if matches!(message, SupervisorMessage::Task(_)) {
                dropped += 1;
            }
        }

        if dropped > 0 {
            tracing::warn!(worker_id = self.pid, dropped, "worker stopped with pending tasks");
        }
    }
}

impl Worker {
    pub(crate) fn new(
        pid: Pid,
        env: Env,
        cost: Arc<dyn Cost>,
        tx: Outbox,
        rx: UnboundedReceiver<SupervisorMessage>,
    ) -> Self {
        Self {
            pid,
            tx,
            rx,
            env,
            cost,
            state: State::Idle,
            resident: 0,
        }
    }

    #[tracing::instrument(skip(self), fields(worker_id = self.pid))]
    pub(crate) async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            tracing::trace!("received event {event:?}");

            match self.state.next(&event) {
                Ok(state) => self.state = state,
                Err(e) => {
                    tracing::warn!("state transition error: {e}");
                    continue;
                }
            }

            match (self.state, event) {
                (State::Running, SupervisorMessage::Task(message)) => {
                    let record = self.process(message).await;
                    self.state = State::Idle;
                    self.emit(WorkerMessage::Complete(record));
                }
                (State::Stop, _) => {
                    tracing::debug!("received shutdown signal from supervisor");
                    self.emit(WorkerMessage::ShutdownAck);
                    return;
                }
                _ => {}
            }
        }

        tracing::debug!("worker inbox closed: shutting down");
    }

    async fn process(&mut self, message: Message) -> ResponseRecord {
        let Workload { allocation, delay } = self.cost.cost(self.pid);

        // Touch every byte so the allocation is actually backed by memory.
        let ballast = vec![b'a'; allocation];
        self.resident = hint::black_box(&ballast).len();

        tokio::time::sleep(delay).await;

        let record = ResponseRecord {
            pid: self.pid,
            message,
            env: self.env.clone(),
            memory_mib: self.memory_mib(),
        };

        drop(ballast);
        self.resident = 0;

        record
    }

    #[allow(clippy::cast_precision_loss)]
    fn memory_mib(&self) -> f64 {
        self.resident as f64 / MIB as f64
    }

    fn emit(&self, message: WorkerMessage) {
        if self.tx.send((self.pid, message)).is_err() {
            tracing::debug!("collector dropped, discarding worker message");
        }
    }
}

/// Spawns a worker for slot `pid` along with a monitor task that reports a
/// panicking worker as [`WorkerMessage::Fault`] on the same outbox.
///
/// Returns the worker's inbox and the monitor handle, which completes once
/// the worker has stopped for any reason.
pub(crate) fn spawn(
    pid: Pid,
    env: Env,
    cost: Arc<dyn Cost>,
    tx: Outbox,
) -> (UnboundedSender<SupervisorMessage>, JoinHandle<()>) {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

    let worker = Worker::new(pid, env, cost, tx.clone(), inbox_rx);
    let handle = tokio::spawn(worker.run());
    let monitor = tokio::spawn(monitor(pid, handle, tx));

    (inbox_tx, monitor)
}

async fn monitor(pid: Pid, handle: JoinHandle<()>, tx: Outbox) {
    match handle.await {
        Ok(()) => tracing::trace!(worker_id = pid, "worker stopped"),
        Err(err) if err.is_panic() => {
            let fault = WorkerFault {
                pid,
                reason: panic_reason(err.into_panic()),
            };
            let _ = tx.send((pid, WorkerMessage::Fault(fault)));
        }
        Err(err) => tracing::debug!(worker_id = pid, "worker task cancelled: {err}"),
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        (*reason).to_string()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stop,
}

impl State {
    //         ┌──────────┐      task         ┌───────────┐
    //         │          ├───────────────────►           │
    //         │   IDLE   │                   │  RUNNING  │
    //         │          ◄───────────────────┤           │
    //         └────┬─────┘     complete      └───────────┘
    //              │
    //      shutdown│
    //              │
    //         ┌────▼─────┐
    //         │   STOP   │
    //         └──────────┘
    //
    //  Tasks are awaited inline, so a worker is always back in IDLE by the
    //  time it reads its next event. Faults are not a state: a panicking
    //  worker is torn down and reported by its monitor.
    fn next(&self, event: &SupervisorMessage) -> Result<State, String> {
        match (self, event) {
            (State::Idle, SupervisorMessage::Task(_)) => Ok(State::Running),
            (_, SupervisorMessage::Shutdown) => Ok(State::Stop),
            _ => Err(format!(
                "invalid transition, event: {event:?}, state: {self:?}"
            )),
        }
    }
}
