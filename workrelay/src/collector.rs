//! Fan-in of every worker's outbound channel into a single observer.

use futures::StreamExt;
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{message::WorkerMessage, Pid};

/// Sink for worker messages. Runs on the collector task, so implementations
/// should hand off anything slow rather than block.
pub trait Observer: Send + 'static {
    fn observe(&mut self, pid: Pid, message: WorkerMessage);
}

impl<F> Observer for F
where
    F: FnMut(Pid, WorkerMessage) + Send + 'static,
{
    fn observe(&mut self, pid: Pid, message: WorkerMessage) {
        self(pid, message);
    }
}

/// Writes every worker message to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn observe(&mut self, pid: Pid, message: WorkerMessage) {
        match message {
            WorkerMessage::Complete(record) => tracing::info!(
                worker_id = pid,
                message = %record.message,
                memory_mib = record.memory_mib,
                "{record}"
            ),
            WorkerMessage::Fault(fault) => tracing::error!(worker_id = pid, "{fault}"),
            WorkerMessage::ShutdownAck => tracing::debug!(worker_id = pid, "got shutdown ack"),
        }
    }
}

/// Handle to the task draining all worker outboxes.
#[derive(Debug)]
pub struct Collector {
    handle: JoinHandle<()>,
}

impl Collector {
    pub(crate) fn spawn<O: Observer>(
        outboxes: Vec<UnboundedReceiver<(Pid, WorkerMessage)>>,
        mut observer: O,
    ) -> Self {
        let mut messages =
            futures::stream::select_all(outboxes.into_iter().map(UnboundedReceiverStream::new));

        let handle = tokio::spawn(async move {
            while let Some((pid, message)) = messages.next().await {
                observer.observe(pid, message);
            }

            tracing::debug!("all worker outboxes closed");
        });

        Self { handle }
    }

    /// Waits until every worker has stopped and all of their messages have
    /// been observed.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            tracing::error!("collector task failed: {err}");
        }
    }
}
